//! Tokio codec for control frames

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::message::{Message, MessageType};
use crate::request::RequestId;

/// A decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request this frame belongs to
    pub request_id: RequestId,
    /// Request or reply carried by the frame
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(request_id: RequestId, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }
}

/// Codec for control frames
///
/// Nothing is consumed from the read buffer until a whole frame is
/// available, so the codec itself holds no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = FrameHeader::peek(src)? else {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        };

        let frame_len = header.frame_length();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let kind = src.split_to(header.kind_length as usize);
        let payload = src.split_to(header.payload_length as usize).freeze();

        let message = match header.message_type {
            MessageType::Request => {
                let kind = std::str::from_utf8(&kind)
                    .map_err(|_| ProtocolError::InvalidFrame("request kind is not UTF-8"))?;
                Message::request(kind, header.flag, payload)
            }
            MessageType::Reply => Message::reply(header.flag, payload),
        };

        Ok(Some(Frame::new(header.request_id, message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = FrameHeader::for_message(frame.request_id, &frame.message)?;
        dst.reserve(header.frame_length());
        header.encode(dst);

        match frame.message {
            Message::Request { kind, payload, .. } => {
                dst.extend_from_slice(kind.as_bytes());
                dst.extend_from_slice(&payload);
            }
            Message::Reply { payload, .. } => dst.extend_from_slice(&payload),
        }
        Ok(())
    }
}
