//! Netlink message composition and header access
//!
//! A message is a 16-byte header in host byte order followed by a payload
//! padded to 4-byte alignment:
//!
//! ```text
//!  0                4        6        8               12              16
//! +----------------+--------+--------+---------------+---------------+
//! |   length u32   | type   | flags  |  sequence u32 |    pid u32    |
//! +----------------+--------+--------+---------------+---------------+
//! ```
//!
//! Attributes are `{len u16, type u16}` followed by the value; `len`
//! covers the 4-byte attribute header but not the padding.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;
pub const GENL_HDRLEN: usize = 4;
/// Largest attribute value the 16-bit length field can describe
pub const NLA_MAX_VALUE: usize = u16::MAX as usize - NLA_HDRLEN;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_MULTI: u16 = 0x2;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_ECHO: u16 = 0x8;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

/// Round up to netlink alignment
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlHeader {
    pub fn encode(&self) -> [u8; NLMSG_HDRLEN] {
        let mut b = [0u8; NLMSG_HDRLEN];
        b[0..4].copy_from_slice(&self.len.to_ne_bytes());
        b[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        b[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        b[8..12].copy_from_slice(&self.seq.to_ne_bytes());
        b[12..16].copy_from_slice(&self.pid.to_ne_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        let b = b.get(..NLMSG_HDRLEN)?;
        Some(Self {
            len: u32::from_ne_bytes(b[0..4].try_into().ok()?),
            msg_type: u16::from_ne_bytes(b[4..6].try_into().ok()?),
            flags: u16::from_ne_bytes(b[6..8].try_into().ok()?),
            seq: u32::from_ne_bytes(b[8..12].try_into().ok()?),
            pid: u32::from_ne_bytes(b[12..16].try_into().ok()?),
        })
    }
}

/// Generic-netlink header following the netlink header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenlHeader {
    pub cmd: u8,
    pub version: u8,
}

/// Anything attributes can be appended to
pub trait AttrWriter {
    /// Append raw, already aligned bytes
    fn extend(&mut self, bytes: &[u8]);

    /// Append attribute `ty` with `value`, padded to alignment
    ///
    /// Panics if `value` is longer than [`NLA_MAX_VALUE`].
    fn put(&mut self, ty: u16, value: &[u8]) {
        assert!(
            value.len() <= NLA_MAX_VALUE,
            "attribute {ty} value of {} bytes exceeds {NLA_MAX_VALUE}",
            value.len()
        );
        let len = (NLA_HDRLEN + value.len()) as u16;
        let mut attr = Vec::with_capacity(align(NLA_HDRLEN + value.len()));
        attr.extend_from_slice(&len.to_ne_bytes());
        attr.extend_from_slice(&ty.to_ne_bytes());
        attr.extend_from_slice(value);
        attr.resize(align(attr.len()), 0);
        self.extend(&attr);
    }

    fn put_flag(&mut self, ty: u16) {
        self.put(ty, &[]);
    }

    fn put_u8(&mut self, ty: u16, v: u8) {
        self.put(ty, &[v]);
    }

    fn put_u16(&mut self, ty: u16, v: u16) {
        self.put(ty, &v.to_ne_bytes());
    }

    fn put_u32(&mut self, ty: u16, v: u32) {
        self.put(ty, &v.to_ne_bytes());
    }

    fn put_u64(&mut self, ty: u16, v: u64) {
        self.put(ty, &v.to_ne_bytes());
    }

    /// Duration as a u64 count of milliseconds
    fn put_msecs(&mut self, ty: u16, d: Duration) {
        self.put_u64(ty, u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    }

    /// String without terminator
    fn put_string(&mut self, ty: u16, s: &str) {
        self.put(ty, s.as_bytes());
    }

    /// String with a trailing nul
    fn put_nul_string(&mut self, ty: u16, s: &str) {
        let mut v = Vec::with_capacity(s.len() + 1);
        v.extend_from_slice(s.as_bytes());
        v.push(0);
        self.put(ty, &v);
    }

    fn put_binary(&mut self, ty: u16, data: &[u8]) {
        self.put(ty, data);
    }

    fn put_nested(&mut self, ty: u16, attrs: &Attrs) {
        self.put(ty, attrs.as_bytes());
    }
}

/// A standalone attribute list, for nesting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    buf: Vec<u8>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl AttrWriter for Attrs {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// A netlink message, header included
#[derive(Clone, PartialEq, Eq)]
pub struct NlMessage {
    buf: Vec<u8>,
}

impl NlMessage {
    pub fn new(msg_type: u16, flags: u16, seq: u32, pid: u32) -> Self {
        let header = NlHeader { len: NLMSG_HDRLEN as u32, msg_type, flags, seq, pid };
        Self { buf: header.encode().to_vec() }
    }

    /// Generic-netlink message for `family`
    pub fn genl(family: u16, flags: u16, cmd: u8, version: u8, seq: u32, pid: u32) -> Self {
        let mut m = Self::new(family, flags, seq, pid);
        m.extend(&[cmd, version, 0, 0]);
        m
    }

    /// Parse a received datagram
    ///
    /// Bytes past the header's length are dropped.
    pub fn from_bytes(mut buf: Vec<u8>) -> Result<Self> {
        let header = NlHeader::decode(&buf)
            .ok_or_else(|| Error::protocol(format!("netlink message of {} bytes too short", buf.len())))?;
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(Error::protocol(format!(
                "netlink length {len} invalid for {} received bytes",
                buf.len()
            )));
        }
        buf.truncate(len);
        Ok(Self { buf })
    }

    pub fn header(&self) -> NlHeader {
        // The constructor guarantees a whole header.
        NlHeader::decode(&self.buf).unwrap_or(NlHeader { len: 0, msg_type: 0, flags: 0, seq: 0, pid: 0 })
    }

    pub fn msg_type(&self) -> u16 {
        self.header().msg_type
    }

    pub fn flags(&self) -> u16 {
        self.header().flags
    }

    pub fn seq(&self) -> u32 {
        self.header().seq
    }

    pub fn pid(&self) -> u32 {
        self.header().pid
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.buf[6..8].copy_from_slice(&flags.to_ne_bytes());
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Everything after the netlink header
    pub fn payload(&self) -> &[u8] {
        &self.buf[NLMSG_HDRLEN..]
    }

    pub fn genl_header(&self) -> Option<GenlHeader> {
        let p = self.payload();
        (p.len() >= GENL_HDRLEN).then(|| GenlHeader { cmd: p[0], version: p[1] })
    }

    /// Attributes after the generic-netlink header
    pub fn genl_payload(&self) -> Option<&[u8]> {
        self.payload().get(GENL_HDRLEN..)
    }

    /// The errno carried by an `NLMSG_ERROR` message; 0 is an ack
    pub fn error_code(&self) -> Option<i32> {
        if self.msg_type() != NLMSG_ERROR {
            return None;
        }
        let b = self.payload().get(..4)?;
        Some(i32::from_ne_bytes(b.try_into().ok()?))
    }

    /// An `NLMSG_ERROR` reply to `request` carrying `-errno`
    pub fn error_reply(request: &NlMessage, errno: i32) -> Self {
        let h = request.header();
        let mut m = Self::new(NLMSG_ERROR, 0, h.seq, h.pid);
        m.extend(&(-errno).to_ne_bytes());
        m.extend(&request.buf[..NLMSG_HDRLEN]);
        m
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl AttrWriter for NlMessage {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.buf.resize(align(self.buf.len()), 0);
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }
}

impl fmt::Display for NlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header();
        write!(f, "nl(len:{}, type={}", h.len, h.msg_type)?;
        match h.msg_type {
            NLMSG_NOOP => f.write_str("(no-op)")?,
            NLMSG_ERROR => f.write_str("(error)")?,
            NLMSG_DONE => f.write_str("(done)")?,
            NLMSG_OVERRUN => f.write_str("(overrun)")?,
            _ => {}
        }
        write!(f, ", flags={:x}", h.flags)?;
        for (bit, name) in [
            (NLM_F_REQUEST, "[REQUEST]"),
            (NLM_F_MULTI, "[MULTI]"),
            (NLM_F_ACK, "[ACK]"),
            (NLM_F_ECHO, "[ECHO]"),
        ] {
            if h.flags & bit != 0 {
                f.write_str(name)?;
            }
        }
        write!(f, ", seq={:x}, pid={})", h.seq, h.pid)
    }
}

impl fmt::Debug for NlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_are_padded_and_counted() {
        let mut m = NlMessage::new(20, NLM_F_REQUEST, 7, 99);
        m.put_u8(1, 0xab);
        assert_eq!(m.len(), NLMSG_HDRLEN + 8);
        assert_eq!(m.header().len as usize, m.len());
        assert_eq!(&m.payload()[..5], &[5, 0, 1, 0, 0xab][..]);
        m.put_nul_string(2, "abc");
        assert_eq!(m.len(), NLMSG_HDRLEN + 8 + 8);
        assert_eq!(m.header().len as usize, m.len());
    }

    #[test]
    fn test_largest_attribute_fits() {
        let mut a = Attrs::new();
        a.put_binary(1, &vec![7u8; NLA_MAX_VALUE]);
        assert_eq!(u16::from_ne_bytes([a.as_bytes()[0], a.as_bytes()[1]]), u16::MAX);
        assert_eq!(a.as_bytes().len(), align(u16::MAX as usize));
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_oversized_attribute_panics() {
        let mut m = NlMessage::new(20, 0, 1, 2);
        m.put_binary(1, &[7u8; 70_000]);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(NlMessage::from_bytes(vec![0; 8]).is_err());
        let m = NlMessage::new(20, 0, 1, 2);
        let mut bytes = m.as_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        assert_eq!(NlMessage::from_bytes(bytes).unwrap(), m);

        let mut bad = m.into_bytes();
        bad[0..4].copy_from_slice(&64u32.to_ne_bytes());
        assert!(NlMessage::from_bytes(bad).is_err());
    }

    #[test]
    fn test_genl_and_error_reply() {
        let req = NlMessage::genl(0x10, NLM_F_REQUEST, 3, 2, 5, 6);
        assert_eq!(req.genl_header(), Some(GenlHeader { cmd: 3, version: 2 }));
        assert_eq!(req.genl_payload(), Some(&[][..]));

        let err = NlMessage::error_reply(&req, libc::ENOENT);
        assert_eq!(err.seq(), 5);
        assert_eq!(err.error_code(), Some(-libc::ENOENT));
        assert_eq!(req.error_code(), None);
    }

    #[test]
    fn test_display() {
        let m = NlMessage::new(NLMSG_ERROR, NLM_F_REQUEST | NLM_F_ACK, 0x1f, 42);
        assert_eq!(m.to_string(), "nl(len:16, type=2(error), flags=5[REQUEST][ACK], seq=1f, pid=42)");
    }
}
