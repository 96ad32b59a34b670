//! MongoDB wire message framing: the common message header, `OP_MSG` for
//! commands, `OP_REPLY` plus the legacy request opcodes for
//! backward-compatible operations.
//!
//! Messages encode into a caller-supplied scatter/gather segment list so a
//! cluster can reuse one buffer list across sends.
use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::Display;

use crate::error::{Error, Result};

pub mod legacy;
pub mod op_msg;
pub mod op_reply;

pub use legacy::LegacyRequest;
pub use op_msg::{MessageFlags, OpMsg};
pub use op_reply::{OpReply, ReplyFlags};

/// Size of the common message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Protocol default for the largest accepted BSON document.
pub const DEFAULT_MAX_BSON_OBJ_SIZE: i32 = 16 * 1024 * 1024;
/// Protocol default for the largest accepted wire message.
pub const DEFAULT_MAX_MSG_SIZE: i32 = 48_000_000;
/// Protocol default for the largest write batch.
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: i32 = 100_000;

/// Wire opcodes. The legacy opcodes survive only for maximally
/// backward-compatible writes and reads; everything else flows as `Msg`.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Compressed,
    Msg,
}

impl From<OpCode> for i32 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Compressed => 2012,
            OpCode::Msg => 2013,
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Msg),
            opcode => Err(Error::General(format!("Unknown opcode: {}", opcode))),
        }
    }
}

/// Common 16-byte header carried by every wire message, little-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code.into());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<MessageHeader> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::General("Message shorter than its header".into()));
        }

        let message_length = buf.get_i32_le();
        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = OpCode::try_from(buf.get_i32_le())?;

        if message_length < HEADER_LEN as i32 {
            return Err(Error::General(format!(
                "Invalid message length: {}",
                message_length
            )));
        }

        Ok(MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }
}

/// Serializes a document into freshly allocated BSON bytes.
pub(crate) fn document_to_bytes(document: &Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    Ok(bytes)
}

/// Writes a NUL-terminated string; interior NULs are a caller bug surfaced
/// as a general error rather than silent truncation.
pub(crate) fn put_cstring(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::General(format!(
            "String contains an interior NUL byte: {:?}",
            value
        )));
    }

    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Finishes a message under construction: patches the length field and
/// appends the frame to the segment list.
pub(crate) fn finish_segment(mut frame: BytesMut, segments: &mut Vec<Bytes>) {
    let length = frame.len() as i32;
    frame[0..4].copy_from_slice(&length.to_le_bytes());
    segments.push(frame.freeze());
}
