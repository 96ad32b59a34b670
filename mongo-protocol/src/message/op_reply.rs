//! `OP_REPLY` - the response to legacy `OP_QUERY`/`OP_GET_MORE` requests.
use bitflags::bitflags;
use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::{document_to_bytes, finish_segment, MessageHeader, OpCode, HEADER_LEN};

bitflags! {
    /// `OP_REPLY` response flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u32 {
        const CURSOR_NOT_FOUND = 0b0001;
        const QUERY_FAILURE = 0b0010;
        const AWAIT_CAPABLE = 0b1000;
    }
}

/// A decoded legacy reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpReply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    /// Decodes a whole received frame (header included).
    pub fn decode(frame: &[u8]) -> Result<(MessageHeader, OpReply)> {
        let mut buf = frame;
        let header = MessageHeader::decode(&mut buf)?;

        if header.op_code != OpCode::Reply {
            return Err(Error::General(format!(
                "Expected OP_REPLY, got {}",
                header.op_code
            )));
        }

        if header.message_length as usize != frame.len() {
            return Err(Error::General(format!(
                "Message length {} does not match frame size {}",
                header.message_length,
                frame.len()
            )));
        }

        if buf.remaining() < 20 {
            return Err(Error::General("Truncated OP_REPLY".into()));
        }

        let flags = ReplyFlags::from_bits_truncate(buf.get_u32_le());
        let cursor_id = buf.get_i64_le();
        let starting_from = buf.get_i32_le();
        let number_returned = buf.get_i32_le();

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        for _ in 0..number_returned {
            documents.push(super::op_msg::read_document_slice(&mut buf)?);
        }

        if buf.has_remaining() {
            return Err(Error::General(
                "OP_REPLY carries bytes past its last document".into(),
            ));
        }

        Ok((
            header,
            OpReply {
                flags,
                cursor_id,
                starting_from,
                documents,
            },
        ))
    }

    /// Encodes a reply frame; the form servers (and test doubles) produce.
    pub fn encode_frame_into(
        &self,
        request_id: i32,
        response_to: i32,
        segments: &mut Vec<Bytes>,
    ) -> Result<()> {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + 20);
        MessageHeader {
            message_length: 0, // patched by finish_segment
            request_id,
            response_to,
            op_code: OpCode::Reply,
        }
        .encode(&mut frame);

        frame.put_u32_le(self.flags.bits());
        frame.put_i64_le(self.cursor_id);
        frame.put_i32_le(self.starting_from);
        frame.put_i32_le(self.documents.len() as i32);
        for document in &self.documents {
            frame.put_slice(&document_to_bytes(document)?);
        }

        finish_segment(frame, segments);
        Ok(())
    }
}
