//! Connection records
//!
//! One record per open connection or in-flight stateless call. The record
//! lives in the connection pool and is reached only through a validated
//! [`SlotRef`](crate::pool::SlotRef).

use crate::pool::Poison;
use bitflags::bitflags;
use crate::registry::{PartitionIdx, ServiceIdx};
use core_types::{
    CallReply, ClientId, Handle, InVec, Message, MessageType, OutVec, PsaStatus, MAX_IOVEC,
};
use psa_api::RpcClientData;
use serde::{Deserialize, Serialize};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No request in flight
    Idle,
    /// A request has been delivered and awaits its reply
    Active,
    /// Released as soon as the reply reaches the client
    PendingFree,
}

bitflags! {
    /// How the service has touched one call vector
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct IovecStatus: u8 {
        const MAPPED = 1 << 0;
        const UNMAPPED = 1 << 1;
        /// Read, skipped or written through the copy API
        const ACCESSED = 1 << 2;
    }
}

impl IovecStatus {
    /// Mapped and not yet released
    pub fn is_mapped(&self) -> bool {
        self.contains(IovecStatus::MAPPED) && !self.contains(IovecStatus::UNMAPPED)
    }
}

/// Read position in a client input vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InCursor {
    pub base: usize,
    pub remaining: usize,
    pub status: IovecStatus,
}

/// Write position in a client output vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutCursor {
    pub base: usize,
    pub capacity: usize,
    pub written: usize,
    pub status: IovecStatus,
}

impl OutCursor {
    pub fn space(&self) -> usize {
        self.capacity - self.written
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub status: ConnectionStatus,
    pub service: Option<ServiceIdx>,
    /// Partition that issued the request; the mailbox agent for remote clients
    pub client: Option<PartitionIdx>,
    pub msg: Message,
    pub invec: [InCursor; MAX_IOVEC],
    pub outvec: [OutCursor; MAX_IOVEC],
    pub rhandle: Option<usize>,
    /// Set when the request came in through the remote bridge
    pub rpc: Option<RpcClientData>,
    /// The service ended the connection with a programmer error
    pub terminated: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            service: None,
            client: None,
            msg: Message::new(MessageType::Connect, Handle::NULL, ClientId::NON_SECURE_DEFAULT),
            invec: [InCursor::default(); MAX_IOVEC],
            outvec: [OutCursor::default(); MAX_IOVEC],
            rhandle: None,
            rpc: None,
            terminated: false,
        }
    }
}

const POISON_WORD: usize = 0xDEAD_BEEF;

impl Poison for Connection {
    fn poison(&mut self) {
        self.status = ConnectionStatus::PendingFree;
        self.service = None;
        self.client = None;
        self.msg = Message::new(
            MessageType::Disconnect,
            Handle::from_raw(POISON_WORD as i32),
            ClientId::new(0),
        );
        self.invec = [InCursor {
            base: POISON_WORD,
            ..InCursor::default()
        }; MAX_IOVEC];
        self.outvec = [OutCursor {
            base: POISON_WORD,
            ..OutCursor::default()
        }; MAX_IOVEC];
        self.rhandle = None;
        self.rpc = None;
        self.terminated = true;
    }
}

impl Connection {
    /// Fills a freshly allocated record
    pub fn init(
        &mut self,
        service: ServiceIdx,
        client: PartitionIdx,
        client_id: ClientId,
        handle: Handle,
    ) {
        *self = Connection {
            service: Some(service),
            client: Some(client),
            msg: Message::new(MessageType::Connect, handle, client_id),
            ..Connection::default()
        };
    }

    pub fn client_id(&self) -> ClientId {
        self.msg.client_id
    }

    /// Moves an idle connection to active for a new request
    pub fn begin(&mut self, msg_type: MessageType) -> Result<(), PsaStatus> {
        if self.status != ConnectionStatus::Idle {
            return Err(PsaStatus::PROGRAMMER_ERROR);
        }
        self.status = ConnectionStatus::Active;
        self.msg.msg_type = msg_type;
        if !msg_type.is_call() {
            self.msg.in_size = [0; MAX_IOVEC];
            self.msg.out_size = [0; MAX_IOVEC];
            self.invec = [InCursor::default(); MAX_IOVEC];
            self.outvec = [OutCursor::default(); MAX_IOVEC];
        }
        Ok(())
    }

    /// Records the vectors of a call; the caller has checked them
    pub fn set_vectors(&mut self, in_vec: &[InVec], out_vec: &[OutVec]) {
        self.msg.in_size = [0; MAX_IOVEC];
        self.msg.out_size = [0; MAX_IOVEC];
        self.invec = [InCursor::default(); MAX_IOVEC];
        self.outvec = [OutCursor::default(); MAX_IOVEC];
        for (i, v) in in_vec.iter().enumerate().take(MAX_IOVEC) {
            self.msg.in_size[i] = v.len;
            self.invec[i] = InCursor {
                base: v.base,
                remaining: v.len,
                status: IovecStatus::empty(),
            };
        }
        for (i, v) in out_vec.iter().enumerate().take(MAX_IOVEC) {
            self.msg.out_size[i] = v.len;
            self.outvec[i] = OutCursor {
                base: v.base,
                capacity: v.len,
                written: 0,
                status: IovecStatus::empty(),
            };
        }
    }

    /// Unmaps every vector the service left mapped
    ///
    /// An output vector released this way reports nothing written.
    pub fn release_mappings(&mut self) {
        for cursor in self.invec.iter_mut().filter(|c| c.status.is_mapped()) {
            cursor.status.insert(IovecStatus::UNMAPPED);
        }
        for cursor in self.outvec.iter_mut().filter(|c| c.status.is_mapped()) {
            cursor.status.insert(IovecStatus::UNMAPPED);
            cursor.written = 0;
        }
    }

    /// Reply for the client with the written lengths flushed
    pub fn call_reply(&self, status: PsaStatus) -> CallReply {
        let mut reply = CallReply::status(status);
        for (len, cursor) in reply.out_len.iter_mut().zip(self.outvec.iter()) {
            *len = cursor.written;
        }
        reply
    }

    /// Message as handed to the service
    pub fn message(&self) -> Message {
        Message {
            rhandle: self.rhandle,
            ..self.msg.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        let mut conn = Connection::default();
        conn.init(
            ServiceIdx::new(0),
            PartitionIdx::new(1),
            ClientId::new(7),
            Handle::from_raw(9),
        );
        conn
    }

    #[test]
    fn test_begin_requires_idle() {
        for status in [ConnectionStatus::Active, ConnectionStatus::PendingFree] {
            let mut conn = connection();
            conn.status = status;
            assert_eq!(
                conn.begin(MessageType::Call(0)),
                Err(PsaStatus::PROGRAMMER_ERROR)
            );
            assert_eq!(conn.status, status);
        }

        let mut conn = connection();
        assert!(conn.begin(MessageType::Call(3)).is_ok());
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert_eq!(conn.msg.msg_type, MessageType::Call(3));
    }

    #[test]
    fn test_vectors_and_reply() {
        let mut conn = connection();
        conn.set_vectors(
            &[InVec::new(0x100, 4)],
            &[OutVec::new(0x200, 8), OutVec::new(0x300, 2)],
        );
        conn.outvec[0].written = 5;

        assert_eq!(conn.msg.in_size, [4, 0, 0, 0]);
        assert_eq!(conn.msg.out_size, [8, 2, 0, 0]);
        assert_eq!(conn.outvec[0].space(), 3);

        let reply = conn.call_reply(PsaStatus::SUCCESS);
        assert_eq!(reply.out_len, [5, 0, 0, 0]);
    }

    #[test]
    fn test_reply_releases_mapped_vectors() {
        let mut conn = connection();
        conn.set_vectors(
            &[InVec::new(0x100, 4)],
            &[OutVec::new(0x200, 8), OutVec::new(0x300, 8)],
        );
        conn.invec[0].status = IovecStatus::MAPPED;
        conn.outvec[0].status = IovecStatus::MAPPED;
        conn.outvec[0].written = 6;
        conn.outvec[1].status = IovecStatus::MAPPED | IovecStatus::UNMAPPED;
        conn.outvec[1].written = 3;

        conn.release_mappings();

        assert!(!conn.invec[0].status.is_mapped());
        assert_eq!(conn.call_reply(PsaStatus::SUCCESS).out_len, [0, 3, 0, 0]);
    }

    #[test]
    fn test_disconnect_clears_vectors() {
        let mut conn = connection();
        conn.set_vectors(&[InVec::new(0x100, 4)], &[]);
        conn.begin(MessageType::Disconnect).unwrap();
        assert_eq!(conn.msg.in_size, [0; MAX_IOVEC]);
        assert_eq!(conn.invec[0], InCursor::default());
    }

    #[test]
    fn test_message_carries_rhandle() {
        let mut conn = connection();
        conn.rhandle = Some(42);
        assert_eq!(conn.message().rhandle, Some(42));
        assert_eq!(conn.message().client_id, ClientId::new(7));
    }

    #[test]
    fn test_poison_marks_record() {
        let mut conn = connection();
        conn.poison();
        assert!(conn.terminated);
        assert!(conn.service.is_none());
        assert_eq!(conn.invec[0].base, POISON_WORD);
    }
}
