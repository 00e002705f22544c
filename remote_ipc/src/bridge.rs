use crate::mailbox::Mailbox;
use crate::{encode_response, RemoteIpcError, RemoteReply, ResponseFrame};
use core_types::{CallReply, ClientId};
use psa_api::{RpcClientData, RpcOrigin};
use spm::RpcOps;
use std::sync::Arc;

/// Maps the client ids of one remote source into a block of non-secure ids
///
/// Remote id `n` becomes `max - n`, for `n` in `0..span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeTranslator {
    source: u32,
    max: i32,
    span: u32,
}

impl RangeTranslator {
    pub fn new(source: u32, max: ClientId, span: u32) -> Result<Self, RemoteIpcError> {
        if !max.is_non_secure() {
            return Err(RemoteIpcError::InvalidRange(format!(
                "{} is not a non-secure client id",
                max
            )));
        }
        let lowest = i64::from(max.as_raw()) - i64::from(span) + 1;
        if span == 0 || lowest < i64::from(i32::MIN) {
            return Err(RemoteIpcError::InvalidRange(format!(
                "{} ids below {} do not fit",
                span, max
            )));
        }
        Ok(Self {
            source,
            max: max.as_raw(),
            span,
        })
    }

    pub fn translate(&self, origin: RpcOrigin) -> Option<ClientId> {
        if origin.source != self.source {
            return None;
        }
        let offset = u32::try_from(origin.client_id).ok()?;
        if offset >= self.span {
            return None;
        }
        Some(ClientId::new(self.max - offset as i32))
    }
}

/// Delivers replies for admitted remote requests back into the mailbox
#[derive(Debug)]
pub struct MailboxBridge {
    mailbox: Arc<Mailbox>,
    translator: RangeTranslator,
}

impl MailboxBridge {
    pub fn new(mailbox: Arc<Mailbox>, translator: RangeTranslator) -> Self {
        Self {
            mailbox,
            translator,
        }
    }
}

impl RpcOps for MailboxBridge {
    fn translate_client_id(&self, origin: RpcOrigin) -> Option<ClientId> {
        self.translator.translate(origin)
    }

    fn reply(&self, client_data: RpcClientData, reply: CallReply) {
        respond(&self.mailbox, client_data.0, RemoteReply::Status(reply));
    }
}

pub(crate) fn respond(mailbox: &Mailbox, request_id: u64, reply: RemoteReply) {
    let frame = ResponseFrame { request_id, reply };
    match encode_response(&frame) {
        Ok(bytes) => mailbox.post_response(request_id, bytes),
        Err(err) => log::error!("dropping reply to request {}: {}", request_id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_response;
    use core_types::PsaStatus;

    fn origin(source: u32, client_id: i32) -> RpcOrigin {
        RpcOrigin { source, client_id }
    }

    #[test]
    fn test_translation_stays_in_range() {
        let translator = RangeTranslator::new(1, ClientId::new(-0x100), 16).unwrap();

        assert_eq!(
            translator.translate(origin(1, 0)),
            Some(ClientId::new(-0x100))
        );
        assert_eq!(
            translator.translate(origin(1, 15)),
            Some(ClientId::new(-0x10f))
        );
        assert_eq!(translator.translate(origin(1, 16)), None);
        assert_eq!(translator.translate(origin(1, -1)), None);
        assert_eq!(translator.translate(origin(2, 0)), None);
    }

    #[test]
    fn test_range_must_be_non_secure() {
        assert!(RangeTranslator::new(0, ClientId::new(5), 1).is_err());
        assert!(RangeTranslator::new(0, ClientId::new(-1), 0).is_err());
        assert!(RangeTranslator::new(0, ClientId::new(i32::MIN), 2).is_err());
    }

    #[test]
    fn test_reply_lands_in_mailbox() {
        let mailbox = Arc::new(Mailbox::new());
        let bridge = MailboxBridge::new(
            Arc::clone(&mailbox),
            RangeTranslator::new(0, ClientId::new(-1), 4).unwrap(),
        );

        bridge.reply(RpcClientData(7), CallReply::status(PsaStatus::BAD_STATE));

        let frame = decode_response(&mailbox.try_response(7).unwrap()).unwrap();
        assert_eq!(
            frame.reply,
            RemoteReply::Status(CallReply::status(PsaStatus::BAD_STATE))
        );
    }
}
