//! Wire format between client and server.
//!
//! Requests are a single command byte: `b` begin, `c` commit, `r` rollback,
//! or `q` followed by a NUL-terminated UTF-8 query. A response is its payload
//! terminated by NUL, then a status byte: `s` for success, or `e` followed by
//! a NUL-terminated UTF-8 error message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{QuillStoreError, QuillStoreResult};

pub const CMD_BEGIN: u8 = b'b';
pub const CMD_COMMIT: u8 = b'c';
pub const CMD_ROLLBACK: u8 = b'r';
pub const CMD_QUERY: u8 = b'q';
pub const STATUS_SUCCESS: u8 = b's';
pub const STATUS_ERROR: u8 = b'e';
const NUL: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Begin,
    Commit,
    Rollback,
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(Bytes),
    Error(String),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|b| *b == NUL)
        .map(|pos| pos + from)
}

fn check_len(len: usize, max_payload: usize) -> QuillStoreResult<()> {
    if len > max_payload {
        return Err(QuillStoreError::Protocol(format!(
            "payload of {} bytes exceeds the {} byte limit",
            len, max_payload
        )));
    }
    Ok(())
}

fn check_no_nul(what: &str, bytes: &[u8]) -> QuillStoreResult<()> {
    if bytes.contains(&NUL) {
        return Err(QuillStoreError::Protocol(format!("{} contains a NUL byte", what)));
    }
    Ok(())
}

fn utf8(bytes: &[u8]) -> QuillStoreResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|err| QuillStoreError::Protocol(format!("invalid utf-8: {}", err)))
}

/// Server side: decodes commands, encodes responses.
#[derive(derive_new::new, Debug, Clone)]
pub struct ServerCodec {
    max_payload: usize,
}

impl Decoder for ServerCodec {
    type Item = Command;
    type Error = QuillStoreError;

    fn decode(&mut self, src: &mut BytesMut) -> QuillStoreResult<Option<Command>> {
        let Some(&code) = src.first() else {
            return Ok(None);
        };
        let command = match code {
            CMD_BEGIN => Command::Begin,
            CMD_COMMIT => Command::Commit,
            CMD_ROLLBACK => Command::Rollback,
            CMD_QUERY => {
                let Some(end) = find_nul(&src[..], 1) else {
                    check_len(src.len() - 1, self.max_payload)?;
                    return Ok(None);
                };
                check_len(end - 1, self.max_payload)?;
                let frame = src.split_to(end + 1);
                return Ok(Some(Command::Query(utf8(&frame[1..end])?)));
            }
            other => {
                return Err(QuillStoreError::Protocol(format!(
                    "unknown command byte 0x{:02x}",
                    other
                )))
            }
        };
        src.advance(1);
        Ok(Some(command))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = QuillStoreError;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> QuillStoreResult<()> {
        match response {
            Response::Success(payload) => {
                check_no_nul("response payload", &payload)?;
                dst.reserve(payload.len() + 2);
                dst.put_slice(&payload);
                dst.put_u8(NUL);
                dst.put_u8(STATUS_SUCCESS);
            }
            Response::Error(message) => {
                // the message is NUL-terminated, so it cannot carry one
                let message = message.replace('\0', " ");
                dst.reserve(message.len() + 3);
                dst.put_u8(NUL);
                dst.put_u8(STATUS_ERROR);
                dst.put_slice(message.as_bytes());
                dst.put_u8(NUL);
            }
        }
        Ok(())
    }
}

/// Client side: encodes commands, decodes responses.
#[derive(derive_new::new, Debug, Clone)]
pub struct ClientCodec {
    max_payload: usize,
}

impl Encoder<Command> for ClientCodec {
    type Error = QuillStoreError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> QuillStoreResult<()> {
        match command {
            Command::Begin => dst.put_u8(CMD_BEGIN),
            Command::Commit => dst.put_u8(CMD_COMMIT),
            Command::Rollback => dst.put_u8(CMD_ROLLBACK),
            Command::Query(query) => {
                check_no_nul("query", query.as_bytes())?;
                check_len(query.len(), self.max_payload)?;
                dst.reserve(query.len() + 2);
                dst.put_u8(CMD_QUERY);
                dst.put_slice(query.as_bytes());
                dst.put_u8(NUL);
            }
        }
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = QuillStoreError;

    fn decode(&mut self, src: &mut BytesMut) -> QuillStoreResult<Option<Response>> {
        let Some(end) = find_nul(&src[..], 0) else {
            check_len(src.len(), self.max_payload)?;
            return Ok(None);
        };
        check_len(end, self.max_payload)?;
        let Some(&status) = src.get(end + 1) else {
            return Ok(None);
        };
        match status {
            STATUS_SUCCESS => {
                let mut frame = src.split_to(end + 2);
                frame.truncate(end);
                Ok(Some(Response::Success(frame.freeze())))
            }
            STATUS_ERROR => {
                let Some(message_end) = find_nul(&src[..], end + 2) else {
                    check_len(src.len() - end - 2, self.max_payload)?;
                    return Ok(None);
                };
                let frame = src.split_to(message_end + 1);
                Ok(Some(Response::Error(utf8(&frame[end + 2..message_end])?)))
            }
            other => Err(QuillStoreError::Protocol(format!(
                "unknown status byte 0x{:02x}",
                other
            ))),
        }
    }
}
