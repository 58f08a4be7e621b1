/*!
 * @file wire_protocol.rs
 * @brief MongoDB wire protocol framing and OP_MSG / OP_QUERY codecs
 */

use bson::{Bson, Document};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DoppelError, Result};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;
pub const MAX_MESSAGE_SIZE: i32 = 48_000_000;
pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;

pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }
}

/// Reads one framed message. `Ok(None)` is a clean end of stream; a short
/// read mid-message is a protocol error and tears the connection down.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<(MessageHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = MessageHeader::parse(&header_buf);

    if header.message_length < HEADER_LEN as i32 {
        return Err(DoppelError::WireProtocol(format!(
            "invalid message length {}",
            header.message_length
        )));
    }
    if header.message_length > MAX_MESSAGE_SIZE {
        return Err(DoppelError::WireProtocol(format!(
            "message length {} exceeds maximum {}",
            header.message_length, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    stream.read_exact(&mut body).await.map_err(|e| {
        DoppelError::WireProtocol(format!("truncated message body: {}", e))
    })?;
    Ok(Some((header, body)))
}

pub async fn write_message<W>(stream: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone)]
pub struct OpMsg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(DoppelError::WireProtocol("OP_MSG too short".into()));
        }
        let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        // A trailing CRC-32C is accepted but not validated.
        let end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
            payload.len().saturating_sub(4)
        } else {
            payload.len()
        };

        let mut offset = 4;
        let mut body = None;
        let mut sequences = Vec::new();

        while offset < end {
            let kind = payload[offset];
            offset += 1;
            match kind {
                0 => {
                    let len = document_length(&payload[offset..end])?;
                    let doc = decode_document(&payload[offset..offset + len])?;
                    if body.is_some() {
                        return Err(DoppelError::WireProtocol(
                            "OP_MSG has more than one body section".into(),
                        ));
                    }
                    body = Some(doc);
                    offset += len;
                }
                1 => {
                    if end - offset < 4 {
                        return Err(DoppelError::WireProtocol(
                            "truncated OP_MSG section".into(),
                        ));
                    }
                    let section_len = i32::from_le_bytes([
                        payload[offset],
                        payload[offset + 1],
                        payload[offset + 2],
                        payload[offset + 3],
                    ]) as usize;
                    if section_len < 4 || offset + section_len > end {
                        return Err(DoppelError::WireProtocol(
                            "invalid OP_MSG section length".into(),
                        ));
                    }
                    let section_end = offset + section_len;
                    let mut cursor = offset + 4;
                    let identifier = read_cstring(payload, &mut cursor, section_end)?;
                    let mut documents = Vec::new();
                    while cursor < section_end {
                        let len = document_length(&payload[cursor..section_end])?;
                        documents.push(decode_document(&payload[cursor..cursor + len])?);
                        cursor += len;
                    }
                    sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                    offset = section_end;
                }
                other => {
                    return Err(DoppelError::WireProtocol(format!(
                        "unknown OP_MSG section kind {}",
                        other
                    )))
                }
            }
        }

        let body = body.ok_or_else(|| {
            DoppelError::WireProtocol("OP_MSG is missing its body section".into())
        })?;
        Ok(Self {
            flags,
            body,
            sequences,
        })
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & FLAG_MORE_TO_COME != 0
    }

    /// The command document with kind-1 sequences folded back in as arrays,
    /// the shape the dispatcher works with.
    pub fn into_command(self) -> Document {
        let mut doc = self.body;
        for seq in self.sequences {
            let array: Vec<Bson> = seq.documents.into_iter().map(Bson::Document).collect();
            doc.insert(seq.identifier, Bson::Array(array));
        }
        doc
    }
}

fn document_length(slice: &[u8]) -> Result<usize> {
    if slice.len() < 4 {
        return Err(DoppelError::WireProtocol("truncated BSON document".into()));
    }
    let len = i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);
    if len < 5 || len as usize > slice.len() {
        return Err(DoppelError::WireProtocol(format!(
            "invalid BSON document length {}",
            len
        )));
    }
    Ok(len as usize)
}

fn decode_document(bytes: &[u8]) -> Result<Document> {
    let doc = Document::from_reader(&mut std::io::Cursor::new(bytes))?;
    Ok(doc)
}

fn read_cstring(payload: &[u8], cursor: &mut usize, end: usize) -> Result<String> {
    let start = *cursor;
    while *cursor < end && payload[*cursor] != 0 {
        *cursor += 1;
    }
    if *cursor >= end {
        return Err(DoppelError::WireProtocol("unterminated cstring".into()));
    }
    let s = std::str::from_utf8(&payload[start..*cursor])
        .map_err(|_| DoppelError::WireProtocol("invalid cstring".into()))?
        .to_string();
    *cursor += 1;
    Ok(s)
}

/// Encodes a single-body OP_MSG reply.
pub fn encode_op_msg(doc: &Document, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    doc.to_writer(&mut body)?;

    let header = MessageHeader {
        message_length: (HEADER_LEN + 4 + 1 + body.len()) as i32,
        request_id,
        response_to,
        op_code: OP_MSG,
    };
    let mut out = Vec::with_capacity(header.message_length as usize);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.push(0); // section kind 0
    out.extend_from_slice(&body);
    Ok(out)
}

/// Legacy OP_QUERY, tolerated only for the initial handshake.
#[derive(Debug, Clone)]
pub struct OpQuery {
    pub full_collection_name: String,
    pub query: Document,
}

impl OpQuery {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = 4; // flags, ignored
        if payload.len() < 5 {
            return Err(DoppelError::WireProtocol("OP_QUERY too short".into()));
        }
        let full_collection_name = read_cstring(payload, &mut cursor, payload.len())?;
        cursor += 8; // numberToSkip, numberToReturn
        if cursor >= payload.len() {
            return Err(DoppelError::WireProtocol("OP_QUERY too short".into()));
        }
        let len = document_length(&payload[cursor..])?;
        let query = decode_document(&payload[cursor..cursor + len])?;
        Ok(Self {
            full_collection_name,
            query,
        })
    }

    /// The handshake is the only legal OP_QUERY traffic.
    pub fn is_handshake(&self) -> bool {
        if !self.full_collection_name.ends_with(".$cmd") {
            return false;
        }
        matches!(
            self.query.keys().next().map(String::as_str),
            Some("hello") | Some("isMaster") | Some("ismaster")
        )
    }
}

/// Encodes an OP_REPLY carrying one document, for OP_QUERY handshakes.
pub fn encode_op_reply(doc: &Document, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    doc.to_writer(&mut body)?;

    let header = MessageHeader {
        message_length: (HEADER_LEN + 20 + body.len()) as i32,
        request_id,
        response_to,
        op_code: OP_REPLY,
    };
    let mut out = Vec::with_capacity(header.message_length as usize);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&8i32.to_le_bytes()); // responseFlags: AwaitCapable
    out.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    out.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    out.extend_from_slice(&1i32.to_le_bytes()); // numberReturned
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn op_msg_round_trip() {
        let body = doc! {"ping": 1, "$db": "admin"};
        let bytes = encode_op_msg(&body, 7, 3).unwrap();
        let header = MessageHeader::parse(&bytes[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.op_code, OP_MSG);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.message_length as usize, bytes.len());

        let msg = OpMsg::parse(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(msg.body, body);
        assert!(msg.sequences.is_empty());
    }

    #[test]
    fn op_msg_kind1_sequence_folds_into_command() {
        // Build: flags + kind0 body + kind1 "documents" sequence.
        let body = doc! {"insert": "c", "$db": "t"};
        let mut body_bytes = Vec::new();
        body.to_writer(&mut body_bytes).unwrap();

        let d1 = doc! {"_id": 1};
        let d2 = doc! {"_id": 2};
        let mut seq_docs = Vec::new();
        d1.to_writer(&mut seq_docs).unwrap();
        d2.to_writer(&mut seq_docs).unwrap();

        let identifier = b"documents\0";
        let section_len = 4 + identifier.len() + seq_docs.len();

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&body_bytes);
        payload.push(1);
        payload.extend_from_slice(&(section_len as i32).to_le_bytes());
        payload.extend_from_slice(identifier);
        payload.extend_from_slice(&seq_docs);

        let msg = OpMsg::parse(&payload).unwrap();
        assert_eq!(msg.sequences.len(), 1);
        let cmd = msg.into_command();
        let docs = cmd.get_array("documents").unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn rejects_unknown_section_kind() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(9);
        assert!(OpMsg::parse(&payload).is_err());
    }
}
