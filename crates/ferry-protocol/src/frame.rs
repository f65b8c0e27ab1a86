//! Control frame header
//!
//! Every control frame starts with an 11-byte header:
//!
//! | bytes | field |
//! |-------|-------|
//! | 4 | request id (u32, big-endian) |
//! | 1 | message type, `0x01` request or `0x02` reply |
//! | 1 | flags, bit 0 is `want_reply` on requests and `ok` on replies |
//! | 1 | length of the request kind, always zero on replies |
//! | 4 | payload length (u32, big-endian) |
//!
//! The UTF-8 request kind follows the header, then the payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use crate::request::RequestId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 11;

/// Longest request kind the header can describe
pub const MAX_KIND_LEN: usize = u8::MAX as usize;

/// Largest payload accepted on the control channel (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// `want_reply` on requests, `ok` on replies
const FLAG_BIT: u8 = 0x01;

/// Parsed and validated frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Request this frame belongs to
    pub request_id: RequestId,
    /// Request or reply
    pub message_type: MessageType,
    /// `want_reply` for requests, `ok` for replies
    pub flag: bool,
    /// Length of the request kind following the header
    pub kind_length: u8,
    /// Length of the payload following the kind
    pub payload_length: u32,
}

impl FrameHeader {
    /// Describe `message`, rejecting messages the header cannot carry
    pub fn for_message(request_id: RequestId, message: &Message) -> Result<Self, ProtocolError> {
        let (message_type, flag, kind_len, payload_len) = match message {
            Message::Request {
                kind,
                want_reply,
                payload,
            } => (MessageType::Request, *want_reply, kind.len(), payload.len()),
            Message::Reply { ok, payload } => (MessageType::Reply, *ok, 0, payload.len()),
        };

        if kind_len > MAX_KIND_LEN {
            return Err(ProtocolError::KindTooLong(kind_len));
        }
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = Self {
            request_id,
            message_type,
            flag,
            kind_length: kind_len as u8,
            payload_length: payload_len as u32,
        };
        header.validate()?;
        Ok(header)
    }

    /// Total frame length, header included
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.kind_length as usize + self.payload_length as usize
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.request_id.as_u32());
        dst.put_u8(self.message_type.as_u8());
        dst.put_u8(if self.flag { FLAG_BIT } else { 0 });
        dst.put_u8(self.kind_length);
        dst.put_u32(self.payload_length);
    }

    /// Parse a header from the front of `src` without consuming it
    ///
    /// Returns `None` until a whole header is buffered.
    pub fn peek(src: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut buf = &src[..HEADER_SIZE];
        let request_id = RequestId::new(buf.get_u32());
        let type_byte = buf.get_u8();
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;
        let flags = buf.get_u8();
        if flags & !FLAG_BIT != 0 {
            return Err(ProtocolError::InvalidFrame("unknown flag bits"));
        }
        let kind_length = buf.get_u8();
        let payload_length = buf.get_u32();
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = Self {
            request_id,
            message_type,
            flag: flags & FLAG_BIT != 0,
            kind_length,
            payload_length,
        };
        header.validate()?;
        Ok(Some(header))
    }

    /// Rules shared by the encoder and the decoder
    fn validate(&self) -> Result<(), ProtocolError> {
        match self.message_type {
            MessageType::Request if self.kind_length == 0 => {
                Err(ProtocolError::InvalidFrame("request without a kind"))
            }
            MessageType::Request if self.flag && self.request_id == RequestId::UNSOLICITED => {
                Err(ProtocolError::InvalidFrame("request wants a reply but has no request id"))
            }
            MessageType::Reply if self.kind_length != 0 => {
                Err(ProtocolError::InvalidFrame("reply carries a request kind"))
            }
            MessageType::Reply if self.request_id == RequestId::UNSOLICITED => {
                Err(ProtocolError::InvalidFrame("reply to the unsolicited request id"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(header: &FrameHeader) -> BytesMut {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf
    }

    #[test]
    fn test_header_layout() {
        let message = Message::request("config", true, Bytes::from_static(b"{}"));
        let header = FrameHeader::for_message(RequestId::new(42), &message).unwrap();
        let buf = encoded(&header);

        assert_eq!(&buf[..], &[0, 0, 0, 42, 0x01, 0x01, 6, 0, 0, 0, 2]);
        assert_eq!(header.frame_length(), HEADER_SIZE + 6 + 2);
        assert_eq!(FrameHeader::peek(&buf).unwrap(), Some(header));
    }

    #[test]
    fn test_peek_needs_whole_header() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(FrameHeader::peek(&buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_message_type() {
        let buf = [0, 0, 0, 1, 0xFE, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::peek(&buf),
            Err(ProtocolError::UnknownMessageType(0xFE))
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let buf = [0, 0, 0, 1, 0x02, 0x80, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::peek(&buf),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_reply_with_kind_rejected() {
        // Reply header claiming a 4-byte kind
        let buf = [0, 0, 0, 1, 0x02, 0x01, 4, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::peek(&buf),
            Err(ProtocolError::InvalidFrame("reply carries a request kind"))
        ));
    }

    #[test]
    fn test_request_without_kind_rejected() {
        let buf = [0, 0, 0, 1, 0x01, 0x01, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameHeader::peek(&buf),
            Err(ProtocolError::InvalidFrame("request without a kind"))
        ));
    }

    #[test]
    fn test_unsolicited_id_rules() {
        let wants_reply = Message::request("ping", true, Bytes::new());
        assert!(FrameHeader::for_message(RequestId::UNSOLICITED, &wants_reply).is_err());

        let fire_and_forget = Message::request("ping", false, Bytes::new());
        assert!(FrameHeader::for_message(RequestId::UNSOLICITED, &fire_and_forget).is_ok());

        let reply = Message::reply(true, Bytes::new());
        assert!(FrameHeader::for_message(RequestId::UNSOLICITED, &reply).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let buf = [0, 0, 0, 1, 0x02, 0x01, 0, 0x01, 0, 0, 1];
        assert!(matches!(
            FrameHeader::peek(&buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));

        let message = Message::reply(true, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            FrameHeader::for_message(RequestId::new(1), &message),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_kind_too_long() {
        let message = Message::request("k".repeat(MAX_KIND_LEN + 1), true, Bytes::new());
        assert!(matches!(
            FrameHeader::for_message(RequestId::new(1), &message),
            Err(ProtocolError::KindTooLong(256))
        ));
    }
}
