//! Device message framing
//!
//! Every message starts with an 8-byte header in network byte order:
//!
//! ```text
//!  0        1        2                 4                                 8
//! +--------+--------+-----------------+---------------------------------+
//! | version|  type  |  length (u16)   |        transaction id (u32)     |
//! +--------+--------+-----------------+---------------------------------+
//! ```
//!
//! `length` covers the header. Error frames carry a u16 category, a u16
//! code and free-text diagnostic bytes.

use std::fmt;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 8;

pub const HELLO: u8 = 0;
pub const ERROR: u8 = 1;
pub const ECHO_REQUEST: u8 = 2;
pub const ECHO_REPLY: u8 = 3;

/// Error category for a failed hello exchange
pub const HELLO_FAILED: u16 = 0;
/// Hello-failed code: no common version
pub const INCOMPATIBLE: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0] = self.version;
        b[1] = self.msg_type;
        b[2..4].copy_from_slice(&self.length.to_be_bytes());
        b[4..8].copy_from_slice(&self.xid.to_be_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        let b: &[u8; HEADER_LEN] = b.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            version: b[0],
            msg_type: b[1],
            length: u16::from_be_bytes([b[2], b[3]]),
            xid: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        })
    }
}

/// A complete device message, header included
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    /// Build a message; the header length is filled in
    pub fn new(version: u8, msg_type: u8, xid: u32, body: &[u8]) -> Result<Self> {
        let length = u16::try_from(HEADER_LEN + body.len())
            .map_err(|_| Error::protocol("message body too long"))?;
        let mut bytes = Vec::with_capacity(length as usize);
        bytes.extend_from_slice(&Header { version, msg_type, length, xid }.encode());
        bytes.extend_from_slice(body);
        Ok(Self { bytes })
    }

    /// Wrap received bytes; the header must agree with the buffer length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = Header::decode(&bytes).ok_or_else(|| Error::protocol("message shorter than header"))?;
        if header.length as usize != bytes.len() {
            return Err(Error::protocol(format!(
                "header length {} does not match {} received bytes",
                header.length,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn hello(version: u8, xid: u32) -> Self {
        Self::header_only(version, HELLO, xid)
    }

    pub fn echo_request(version: u8, xid: u32) -> Self {
        Self::header_only(version, ECHO_REQUEST, xid)
    }

    /// Reply to `request` carrying its transaction id and payload
    pub fn echo_reply(request: &Message) -> Self {
        let mut bytes = request.bytes.clone();
        bytes[1] = ECHO_REPLY;
        Self { bytes }
    }

    pub fn error(version: u8, xid: u32, kind: u16, code: u16, text: &str) -> Result<Self> {
        let mut body = Vec::with_capacity(4 + text.len());
        body.extend_from_slice(&kind.to_be_bytes());
        body.extend_from_slice(&code.to_be_bytes());
        body.extend_from_slice(text.as_bytes());
        Self::new(version, ERROR, xid, &body)
    }

    fn header_only(version: u8, msg_type: u8, xid: u32) -> Self {
        let length = HEADER_LEN as u16;
        Self { bytes: Header { version, msg_type, length, xid }.encode().to_vec() }
    }

    pub fn header(&self) -> Header {
        let b = &self.bytes;
        Header {
            version: b[0],
            msg_type: b[1],
            length: u16::from_be_bytes([b[2], b[3]]),
            xid: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        }
    }

    pub fn version(&self) -> u8 {
        self.bytes[0]
    }

    pub fn msg_type(&self) -> u8 {
        self.bytes[1]
    }

    pub fn xid(&self) -> u32 {
        self.header().xid
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode an error frame into `Error::PeerError`
    pub fn peer_error(&self) -> Option<Error> {
        if self.msg_type() != ERROR {
            return None;
        }
        let body = self.body();
        let kind = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?);
        let code = u16::from_be_bytes(body.get(2..4)?.try_into().ok()?);
        let text = String::from_utf8_lossy(&body[4..]).into_owned();
        Some(Error::PeerError { kind, code, text })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header();
        f.debug_struct("Message")
            .field("version", &format_args!("{:#04x}", h.version))
            .field("type", &type_name(h.msg_type))
            .field("length", &h.length)
            .field("xid", &format_args!("{:#010x}", h.xid))
            .finish()
    }
}

pub fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        HELLO => "hello",
        ERROR => "error",
        ECHO_REQUEST => "echo_request",
        ECHO_REPLY => "echo_reply",
        _ => "other",
    }
}
