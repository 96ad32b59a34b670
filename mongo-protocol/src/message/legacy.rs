//! Legacy pre-command requests, kept for maximally backward-compatible
//! operations such as unacknowledged writes. They share the message header
//! and request-id sequencing with `OP_MSG` traffic.
use bitflags::bitflags;
use bson::Document;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::message::{
    document_to_bytes, finish_segment, put_cstring, MessageHeader, OpCode, HEADER_LEN,
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        const CONTINUE_ON_ERROR = 0b0001;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u32 {
        const UPSERT = 0b0001;
        const MULTI_UPDATE = 0b0010;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct DeleteFlags: u32 {
        const SINGLE_REMOVE = 0b0001;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct QueryFlags: u32 {
        const TAILABLE_CURSOR = 0b0000_0010;
        const SECONDARY_OK = 0b0000_0100;
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        const AWAIT_DATA = 0b0010_0000;
        const EXHAUST = 0b0100_0000;
    }
}

/// A legacy wire request. `collection` is the full namespace
/// (`database.collection`).
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyRequest {
    Insert {
        collection: String,
        flags: InsertFlags,
        documents: Vec<Document>,
    },
    Update {
        collection: String,
        flags: UpdateFlags,
        selector: Document,
        update: Document,
    },
    Delete {
        collection: String,
        flags: DeleteFlags,
        selector: Document,
    },
    Query {
        collection: String,
        flags: QueryFlags,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        fields: Option<Document>,
    },
    GetMore {
        collection: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl LegacyRequest {
    pub fn op_code(&self) -> OpCode {
        match self {
            LegacyRequest::Insert { .. } => OpCode::Insert,
            LegacyRequest::Update { .. } => OpCode::Update,
            LegacyRequest::Delete { .. } => OpCode::Delete,
            LegacyRequest::Query { .. } => OpCode::Query,
            LegacyRequest::GetMore { .. } => OpCode::GetMore,
            LegacyRequest::KillCursors { .. } => OpCode::KillCursors,
        }
    }

    /// Only queries and cursor advances produce an `OP_REPLY`; writes on
    /// this path are fire-and-forget.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            LegacyRequest::Query { .. } | LegacyRequest::GetMore { .. }
        )
    }

    /// Encodes the request as one frame appended to `segments`.
    pub fn encode_into(&self, request_id: i32, segments: &mut Vec<Bytes>) -> Result<()> {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + 32);
        MessageHeader {
            message_length: 0, // patched by finish_segment
            request_id,
            response_to: 0,
            op_code: self.op_code(),
        }
        .encode(&mut frame);

        match self {
            LegacyRequest::Insert {
                collection,
                flags,
                documents,
            } => {
                frame.put_u32_le(flags.bits());
                put_cstring(&mut frame, collection)?;
                for document in documents {
                    frame.put_slice(&document_to_bytes(document)?);
                }
            }
            LegacyRequest::Update {
                collection,
                flags,
                selector,
                update,
            } => {
                frame.put_i32_le(0); // reserved
                put_cstring(&mut frame, collection)?;
                frame.put_u32_le(flags.bits());
                frame.put_slice(&document_to_bytes(selector)?);
                frame.put_slice(&document_to_bytes(update)?);
            }
            LegacyRequest::Delete {
                collection,
                flags,
                selector,
            } => {
                frame.put_i32_le(0); // reserved
                put_cstring(&mut frame, collection)?;
                frame.put_u32_le(flags.bits());
                frame.put_slice(&document_to_bytes(selector)?);
            }
            LegacyRequest::Query {
                collection,
                flags,
                number_to_skip,
                number_to_return,
                query,
                fields,
            } => {
                frame.put_u32_le(flags.bits());
                put_cstring(&mut frame, collection)?;
                frame.put_i32_le(*number_to_skip);
                frame.put_i32_le(*number_to_return);
                frame.put_slice(&document_to_bytes(query)?);
                if let Some(fields) = fields {
                    frame.put_slice(&document_to_bytes(fields)?);
                }
            }
            LegacyRequest::GetMore {
                collection,
                number_to_return,
                cursor_id,
            } => {
                frame.put_i32_le(0); // reserved
                put_cstring(&mut frame, collection)?;
                frame.put_i32_le(*number_to_return);
                frame.put_i64_le(*cursor_id);
            }
            LegacyRequest::KillCursors { cursor_ids } => {
                frame.put_i32_le(0); // reserved
                frame.put_i32_le(cursor_ids.len() as i32);
                for cursor_id in cursor_ids {
                    frame.put_i64_le(*cursor_id);
                }
            }
        }

        finish_segment(frame, segments);
        Ok(())
    }
}
