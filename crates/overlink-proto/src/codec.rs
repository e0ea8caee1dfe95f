//! Wire framing for control messages
//!
//! Every frame is `[length: u32][tag: u8][body]`. Control traffic
//! (register, heartbeat, routes, status) is rare and rides bincode under
//! `TAG_CONTROL`. Relay datagrams are the hot path — one frame per IP
//! packet — so `TAG_PACKET` lays the fields out directly:
//!
//! ```text
//! [session_id len: u8][session_id]
//! [source_agent_id len: u8][source_agent_id]
//! [destination_agent_id len: u8][destination_agent_id]   (0 = unset)
//! [payload: rest of frame]
//! ```
//!
//! The payload needs no length of its own; it runs to the end of the
//! frame, so a packet costs three id copies and a memcpy instead of a
//! serializer pass.

use crate::messages::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Identifier too long: {0} bytes")]
    IdentifierTooLong(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),
}

const TAG_CONTROL: u8 = 0x01;
const TAG_PACKET: u8 = 0x02;

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum frame size. Relay frames carry at most one IP datagram
    /// (MTU + header margin), so anything near this limit is malformed.
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Session and agent ids are length-prefixed with a single byte.
    const MAX_ID_LEN: usize = u8::MAX as usize;

    /// Encode a control message into a single frame.
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        match msg {
            ControlMessage::Packet {
                session_id,
                source_agent_id,
                destination_agent_id,
                payload,
            } => Self::encode_packet(
                session_id,
                source_agent_id,
                destination_agent_id.as_deref().unwrap_or(""),
                payload,
            ),
            other => Self::encode_control(other),
        }
    }

    fn encode_control(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let body = bincode::serialize(msg)?;

        let frame_len = 1 + body.len();
        if frame_len > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(frame_len));
        }

        let mut buf = BytesMut::with_capacity(4 + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(TAG_CONTROL);
        buf.extend_from_slice(&body);

        Ok(buf.freeze())
    }

    fn encode_packet(
        session_id: &str,
        source_agent_id: &str,
        destination_agent_id: &str,
        payload: &[u8],
    ) -> Result<Bytes, CodecError> {
        for id in [session_id, source_agent_id, destination_agent_id] {
            if id.len() > Self::MAX_ID_LEN {
                return Err(CodecError::IdentifierTooLong(id.len()));
            }
        }

        let frame_len = 1
            + 1
            + session_id.len()
            + 1
            + source_agent_id.len()
            + 1
            + destination_agent_id.len()
            + payload.len();
        if frame_len > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(frame_len));
        }

        let mut buf = BytesMut::with_capacity(4 + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(TAG_PACKET);
        for id in [session_id, source_agent_id, destination_agent_id] {
            buf.put_u8(id.len() as u8);
            buf.extend_from_slice(id.as_bytes());
        }
        buf.extend_from_slice(payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from the buffer.
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        // Need at least the length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(frame_len));
        }
        if frame_len == 0 {
            return Err(CodecError::MalformedFrame("empty frame"));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(frame_len);

        match frame.get_u8() {
            TAG_CONTROL => Ok(Some(bincode::deserialize(&frame)?)),
            TAG_PACKET => Self::decode_packet(frame).map(Some),
            _ => Err(CodecError::MalformedFrame("unknown frame tag")),
        }
    }

    fn decode_packet(mut frame: BytesMut) -> Result<ControlMessage, CodecError> {
        let session_id = Self::read_id(&mut frame)?;
        let source_agent_id = Self::read_id(&mut frame)?;
        let destination = Self::read_id(&mut frame)?;

        Ok(ControlMessage::Packet {
            session_id,
            source_agent_id,
            destination_agent_id: (!destination.is_empty()).then_some(destination),
            payload: frame.to_vec(),
        })
    }

    fn read_id(frame: &mut BytesMut) -> Result<String, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::MalformedFrame("truncated identifier"));
        }
        let len = frame.get_u8() as usize;
        if frame.len() < len {
            return Err(CodecError::MalformedFrame("truncated identifier"));
        }
        let raw = frame.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::MalformedFrame("identifier is not utf-8"))
    }
}
