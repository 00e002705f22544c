//! The message envelope delivered to services

use crate::handle::Handle;
use crate::ids::ClientId;
use crate::iovec::MAX_IOVEC;
use crate::status::PsaStatus;
use serde::{Deserialize, Serialize};

/// Kind of request carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A client asks to open a connection
    Connect,
    /// A request on an open connection or a stateless service
    Call(i16),
    /// A client closed its connection
    Disconnect,
}

impl MessageType {
    pub const CONNECT_RAW: i32 = -1;
    pub const DISCONNECT_RAW: i32 = -2;

    /// Framework encoding of the type
    pub const fn as_raw(&self) -> i32 {
        match self {
            MessageType::Connect => Self::CONNECT_RAW,
            MessageType::Disconnect => Self::DISCONNECT_RAW,
            MessageType::Call(t) => *t as i32,
        }
    }

    /// Decodes a framework type value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::CONNECT_RAW => Some(MessageType::Connect),
            Self::DISCONNECT_RAW => Some(MessageType::Disconnect),
            t if (0..=i16::MAX as i32).contains(&t) => Some(MessageType::Call(t as i16)),
            _ => None,
        }
    }

    pub const fn is_call(&self) -> bool {
        matches!(self, MessageType::Call(_))
    }
}

/// Snapshot of a request as returned to the service by `get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    /// Message handle used with read, write and reply
    pub handle: Handle,
    pub client_id: ClientId,
    /// Value set earlier with `set_rhandle` on this connection
    pub rhandle: Option<usize>,
    pub in_size: [usize; MAX_IOVEC],
    pub out_size: [usize; MAX_IOVEC],
}

impl Message {
    pub fn new(msg_type: MessageType, handle: Handle, client_id: ClientId) -> Self {
        Self {
            msg_type,
            handle,
            client_id,
            rhandle: None,
            in_size: [0; MAX_IOVEC],
            out_size: [0; MAX_IOVEC],
        }
    }
}

/// What a client receives once its request has been answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReply {
    pub status: PsaStatus,
    /// Bytes written by the service into each output vector
    pub out_len: [usize; MAX_IOVEC],
}

impl CallReply {
    pub const fn status(status: PsaStatus) -> Self {
        Self {
            status,
            out_len: [0; MAX_IOVEC],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_encoding() {
        assert_eq!(MessageType::Connect.as_raw(), -1);
        assert_eq!(MessageType::Disconnect.as_raw(), -2);
        assert_eq!(MessageType::Call(0).as_raw(), 0);
        assert_eq!(MessageType::from_raw(7), Some(MessageType::Call(7)));
        assert_eq!(MessageType::from_raw(-5), None);
    }

    #[test]
    fn test_only_call_types_are_calls() {
        assert!(MessageType::Call(3).is_call());
        assert!(!MessageType::Connect.is_call());
        assert!(!MessageType::Disconnect.is_call());
    }
}
