//! Control protocol opcodes and wire encoding.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! request:  [u8: opcode] [fixed-width args]
//! response: [fixed-width result]
//! ```
//!
//! | Opcode | Request             | Args       | Result                            |
//! |--------|---------------------|------------|-----------------------------------|
//! | `0x01` | `CreateServer`      | none       | `u32 handle`                      |
//! | `0x02` | `StartServer`       | `u32`      | `i32 status`                      |
//! | `0x03` | `Up`                | `u32`      | `i32 status`                      |
//! | `0x05` | `FetchErrorMessage` | `u32`      | `i32 status`, `u32 prepared_len`  |
//! | `0x06` | `ReadErrorMessage`  | `u32`      | `u32 len`, `len` bytes            |
//! | `0xFF` | `CloseServer`       | `u32`      | `i32 status`; worker then exits   |
//!
//! There are no request IDs and no lengths outside `ReadErrorMessage`, so
//! requests and responses must strictly alternate. An unknown opcode cannot
//! be skipped and ends the session.

// Rust guideline compliant 2026-02

use std::io::{self, Read, Write};

use crate::constants::{HANDLE_WIDTH, MAX_ERROR_TEXT, STATUS_WIDTH};
use crate::handle::Handle;

// ─── Opcode constants ──────────────────────────────────────────────────────

/// Opcode byte constants for the control protocol.
pub mod opcode {
    /// Create a server; returns its handle.
    pub const CREATE_SERVER: u8 = 0x01;
    /// Start a server in the background; returns a status.
    pub const START_SERVER: u8 = 0x02;
    /// Start a server and wait until usable; returns a status.
    pub const UP: u8 = 0x03;
    /// Snapshot the server's last error; returns status and length.
    pub const FETCH_ERROR_MESSAGE: u8 = 0x05;
    /// Transfer the snapshot taken by `FETCH_ERROR_MESSAGE`.
    pub const READ_ERROR_MESSAGE: u8 = 0x06;
    /// Close the server and end the session.
    pub const CLOSE_SERVER: u8 = 0xFF;
}

/// Failure decoding a request.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Opcode byte not in this protocol version.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Length prefix beyond the protocol maximum.
    #[error("error text of {0} bytes exceeds limit of {MAX_ERROR_TEXT}")]
    TooLong(u32),

    /// Pipe failure or short read.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Create a server.
    CreateServer,
    /// Start a server.
    StartServer(Handle),
    /// Bring a server up.
    Up(Handle),
    /// Snapshot a server's last error message.
    FetchErrorMessage(Handle),
    /// Read the snapshotted error message.
    ReadErrorMessage(Handle),
    /// Close a server and end the session.
    CloseServer(Handle),
}

impl Request {
    /// Opcode byte for this request.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::CreateServer => opcode::CREATE_SERVER,
            Self::StartServer(_) => opcode::START_SERVER,
            Self::Up(_) => opcode::UP,
            Self::FetchErrorMessage(_) => opcode::FETCH_ERROR_MESSAGE,
            Self::ReadErrorMessage(_) => opcode::READ_ERROR_MESSAGE,
            Self::CloseServer(_) => opcode::CLOSE_SERVER,
        }
    }

    /// Handle argument, if the opcode takes one.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::CreateServer => None,
            Self::StartServer(h)
            | Self::Up(h)
            | Self::FetchErrorMessage(h)
            | Self::ReadErrorMessage(h)
            | Self::CloseServer(h) => Some(*h),
        }
    }

    /// Encode as `[opcode][args]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + HANDLE_WIDTH);
        buf.push(self.opcode());
        if let Some(h) = self.handle() {
            buf.extend_from_slice(&h.as_raw().to_le_bytes());
        }
        buf
    }

    /// Read one request.
    ///
    /// Returns `Ok(None)` on a clean end of stream before the opcode byte.
    /// EOF inside the argument block is an `UnexpectedEof` I/O error.
    pub fn read_from(r: &mut impl Read) -> Result<Option<Self>, ProtocolError> {
        let mut op = [0u8; 1];
        loop {
            match r.read(&mut op) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let req = match op[0] {
            opcode::CREATE_SERVER => Self::CreateServer,
            opcode::START_SERVER => Self::StartServer(read_handle(r)?),
            opcode::UP => Self::Up(read_handle(r)?),
            opcode::FETCH_ERROR_MESSAGE => Self::FetchErrorMessage(read_handle(r)?),
            opcode::READ_ERROR_MESSAGE => Self::ReadErrorMessage(read_handle(r)?),
            opcode::CLOSE_SERVER => Self::CloseServer(read_handle(r)?),
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(Some(req))
    }
}

// ─── Fixed-width fields ────────────────────────────────────────────────────

/// Read a `u32` handle.
pub fn read_handle(r: &mut impl Read) -> io::Result<Handle> {
    let mut buf = [0u8; HANDLE_WIDTH];
    r.read_exact(&mut buf)?;
    Ok(Handle::from_raw(u32::from_le_bytes(buf)))
}

/// Read an `i32` status.
pub fn read_status(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; STATUS_WIDTH];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read a `u32` length.
pub fn read_len(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a `u32`-length-prefixed error text.
pub fn read_text(r: &mut impl Read) -> Result<String, ProtocolError> {
    let len = read_len(r)?;
    if len as usize > MAX_ERROR_TEXT {
        return Err(ProtocolError::TooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Encode a `u32`-length-prefixed error text, cut to [`MAX_ERROR_TEXT`].
#[must_use]
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut end = text.len().min(MAX_ERROR_TEXT);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &text.as_bytes()[..end];
    let mut buf = Vec::with_capacity(4 + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Write a complete response in one call and flush.
pub fn write_response(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_wire_layout() {
        assert_eq!(Request::CreateServer.encode(), vec![0x01]);
        assert_eq!(
            Request::StartServer(Handle::from_raw(0x0102_0304)).encode(),
            vec![0x02, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Request::CloseServer(Handle::from_raw(1)).encode()[0], 0xFF);
    }

    #[test]
    fn test_read_request() {
        let mut wire = Cursor::new(Request::Up(Handle::from_raw(77)).encode());
        assert_eq!(
            Request::read_from(&mut wire).unwrap(),
            Some(Request::Up(Handle::from_raw(77)))
        );
        assert_eq!(Request::read_from(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut wire = Cursor::new(vec![0x04, 0, 0, 0, 0]);
        assert!(matches!(
            Request::read_from(&mut wire),
            Err(ProtocolError::UnknownOpcode(0x04))
        ));
    }

    #[test]
    fn test_short_argument_block_is_eof() {
        let mut wire = Cursor::new(vec![opcode::START_SERVER, 1, 0]);
        match Request::read_from(&mut wire) {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    #[test]
    fn test_text_is_capped() {
        let long = "x".repeat(MAX_ERROR_TEXT + 10);
        let wire = encode_text(&long);
        assert_eq!(wire.len(), 4 + MAX_ERROR_TEXT);
        assert_eq!(read_text(&mut Cursor::new(wire)).unwrap().len(), MAX_ERROR_TEXT);

        let mut oversized = ((MAX_ERROR_TEXT + 1) as u32).to_le_bytes().to_vec();
        oversized.extend(std::iter::repeat(b'x').take(MAX_ERROR_TEXT + 1));
        assert!(matches!(
            read_text(&mut Cursor::new(oversized)),
            Err(ProtocolError::TooLong(_))
        ));
    }
}
