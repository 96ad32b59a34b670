//! `OP_MSG` - the command message carrying a BSON body section plus optional
//! document-sequence sections.
use bitflags::bitflags;
use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::message::{
    document_to_bytes, finish_segment, put_cstring, MessageHeader, OpCode, HEADER_LEN,
};

bitflags! {
    /// `OP_MSG` flag bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b0000_0001;
        const MORE_TO_COME = 0b0000_0010;
        const EXHAUST_ALLOWED = 0b0001_0000_0000_0000_0000;
    }
}

/// A kind-1 section: documents streamed outside the body under a named
/// identifier (e.g. `documents` for inserts).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// One command message. Exactly one kind-0 body section, any number of
/// kind-1 document sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: MessageFlags,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn new(body: Document) -> Self {
        OpMsg {
            flags: MessageFlags::empty(),
            body,
            sequences: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the peer should answer this message at all.
    #[inline]
    pub fn expects_response(&self) -> bool {
        !self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Encodes the message as one frame appended to `segments`.
    pub fn encode_into(&self, request_id: i32, segments: &mut Vec<Bytes>) -> Result<()> {
        self.encode_frame_into(request_id, 0, segments)
    }

    /// Encodes a frame with an explicit `response_to`, the form servers use
    /// when replying.
    pub fn encode_frame_into(
        &self,
        request_id: i32,
        response_to: i32,
        segments: &mut Vec<Bytes>,
    ) -> Result<()> {
        let body = document_to_bytes(&self.body)?;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + 5 + body.len());
        MessageHeader {
            message_length: 0, // patched by finish_segment
            request_id,
            response_to,
            op_code: OpCode::Msg,
        }
        .encode(&mut frame);

        frame.put_u32_le(self.flags.bits());
        frame.put_u8(0);
        frame.put_slice(&body);

        for sequence in &self.sequences {
            let mut payload = BytesMut::new();
            put_cstring(&mut payload, &sequence.identifier)?;
            for document in &sequence.documents {
                payload.put_slice(&document_to_bytes(document)?);
            }

            frame.put_u8(1);
            frame.put_i32_le(4 + payload.len() as i32);
            frame.put_slice(&payload);
        }

        finish_segment(frame, segments);
        Ok(())
    }

    /// Decodes a whole received frame (header included) into its header and
    /// message. Reply shape violations surface as `Protocol`-style general
    /// errors for the caller to attribute to an address.
    pub fn decode(frame: &[u8]) -> Result<(MessageHeader, OpMsg)> {
        let mut buf = frame;
        let header = MessageHeader::decode(&mut buf)?;

        if header.op_code != OpCode::Msg {
            return Err(Error::General(format!(
                "Expected OP_MSG reply, got {}",
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

        if buf.remaining() < 4 {
            return Err(Error::General("OP_MSG missing flag bits".into()));
        }
        let flags = MessageFlags::from_bits_truncate(buf.get_u32_le());

        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };

        let mut body = None;
        let mut sequences = Vec::new();

        while buf.remaining() > checksum_len {
            let kind = buf.get_u8();
            match kind {
                0 => {
                    let document = read_document_slice(&mut buf)?;
                    if body.replace(document).is_some() {
                        return Err(Error::General("OP_MSG with two body sections".into()));
                    }
                }
                1 => {
                    if buf.remaining() < 4 {
                        return Err(Error::General("Truncated OP_MSG sequence section".into()));
                    }
                    let section_len = buf.get_i32_le() as usize;
                    if section_len < 4 || buf.remaining() < section_len - 4 {
                        return Err(Error::General("Truncated OP_MSG sequence section".into()));
                    }

                    let mut section = &buf[..section_len - 4];
                    buf.advance(section_len - 4);

                    let identifier = read_cstring(&mut section)?;
                    let mut documents = Vec::new();
                    while section.has_remaining() {
                        documents.push(read_document_slice(&mut section)?);
                    }
                    sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                }
                kind => {
                    return Err(Error::General(format!(
                        "Unknown OP_MSG section kind: {}",
                        kind
                    )))
                }
            }
        }

        let body = body.ok_or_else(|| Error::General("OP_MSG without a body section".into()))?;

        Ok((
            header,
            OpMsg {
                flags,
                body,
                sequences,
            },
        ))
    }
}

pub(crate) fn read_document_slice(buf: &mut &[u8]) -> Result<Document> {
    if buf.remaining() < 4 {
        return Err(Error::General("Truncated BSON document".into()));
    }

    let length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length < 5 || buf.remaining() < length {
        return Err(Error::General("Truncated BSON document".into()));
    }

    let document = Document::from_reader(Cursor::new(&buf[..length]))?;
    buf.advance(length);
    Ok(document)
}

fn read_cstring(buf: &mut &[u8]) -> Result<String> {
    let end = buf
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| Error::General("Unterminated string in OP_MSG section".into()))?;

    let value = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::General("Invalid UTF-8 in OP_MSG section identifier".into()))?
        .to_string();
    buf.advance(end + 1);
    Ok(value)
}
