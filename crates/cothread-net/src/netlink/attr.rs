//! Attribute policies
//!
//! A [`Policy`] lists the attributes a message may carry, their kind and
//! allowed length, and which are required. Parsing fails closed: one bad
//! attribute rejects the whole payload. Attribute types the policy does not
//! mention are skipped.
//!
//! ```ignore
//! let policy = Policy::new(vec![
//!     AttrSpec::u32(DP_IDX).required(),
//!     AttrSpec::string(PORT_NAME, 1, 15),
//! ]);
//! let attrs = policy.parse(msg.genl_payload().unwrap_or_default())?;
//! let idx = attrs.u32(DP_IDX);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use super::message::{align, NLA_HDRLEN};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Unspec,
    U8,
    U16,
    U32,
    U64,
    Msecs,
    String,
    NulString,
    Flag,
    Binary,
    Nested,
}

/// Policy entry for one attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    pub ty: u16,
    pub kind: AttrKind,
    pub min_len: usize,
    pub max_len: usize,
    pub required: bool,
}

impl AttrSpec {
    const fn new(ty: u16, kind: AttrKind, min_len: usize, max_len: usize) -> Self {
        Self { ty, kind, min_len, max_len, required: false }
    }

    pub const fn unspec(ty: u16, min_len: usize, max_len: usize) -> Self {
        Self::new(ty, AttrKind::Unspec, min_len, max_len)
    }

    pub const fn u8(ty: u16) -> Self {
        Self::new(ty, AttrKind::U8, 1, 1)
    }

    pub const fn u16(ty: u16) -> Self {
        Self::new(ty, AttrKind::U16, 2, 2)
    }

    pub const fn u32(ty: u16) -> Self {
        Self::new(ty, AttrKind::U32, 4, 4)
    }

    pub const fn u64(ty: u16) -> Self {
        Self::new(ty, AttrKind::U64, 8, 8)
    }

    pub const fn msecs(ty: u16) -> Self {
        Self::new(ty, AttrKind::Msecs, 8, 8)
    }

    /// String of `min_len..=max_len` bytes, no terminator
    pub const fn string(ty: u16, min_len: usize, max_len: usize) -> Self {
        Self::new(ty, AttrKind::String, min_len, max_len)
    }

    /// Nul-terminated string of `min_len..=max_len` bytes before the nul
    pub const fn nul_string(ty: u16, min_len: usize, max_len: usize) -> Self {
        Self::new(ty, AttrKind::NulString, min_len + 1, max_len + 1)
    }

    pub const fn flag(ty: u16) -> Self {
        Self::new(ty, AttrKind::Flag, 0, 0)
    }

    pub const fn binary(ty: u16, min_len: usize, max_len: usize) -> Self {
        Self::new(ty, AttrKind::Binary, min_len, max_len)
    }

    /// Nested attribute list, parsed separately with its own policy
    pub const fn nested(ty: u16) -> Self {
        Self::new(ty, AttrKind::Nested, 0, usize::MAX)
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    specs: HashMap<u16, AttrSpec>,
    n_required: usize,
}

impl Policy {
    /// # Panics
    ///
    /// If two entries name the same attribute type.
    pub fn new(specs: impl IntoIterator<Item = AttrSpec>) -> Self {
        let mut map = HashMap::new();
        let mut n_required = 0;
        for spec in specs {
            if spec.required {
                n_required += 1;
            }
            let dup = map.insert(spec.ty, spec);
            assert!(dup.is_none(), "attribute type {} listed twice in policy", spec.ty);
        }
        Self { specs: map, n_required }
    }

    pub fn spec(&self, ty: u16) -> Option<&AttrSpec> {
        self.specs.get(&ty)
    }

    /// Validate `payload` against the policy
    pub fn parse<'a>(&self, payload: &'a [u8]) -> Result<ParsedAttrs<'a>> {
        let mut found: HashMap<u16, &'a [u8]> = HashMap::new();
        let mut still_required = self.n_required;
        let mut rest = payload;
        while !rest.is_empty() {
            if rest.len() < NLA_HDRLEN {
                warn!(bytes = rest.len(), "attribute shorter than header");
                return Err(Error::protocol("truncated attribute header"));
            }
            let nla_len = u16::from_ne_bytes([rest[0], rest[1]]) as usize;
            let ty = u16::from_ne_bytes([rest[2], rest[3]]);
            if nla_len < NLA_HDRLEN {
                warn!(nla_len, "attribute length shorter than header");
                return Err(Error::protocol(format!("attribute {ty} length {nla_len} too short")));
            }
            let len = nla_len - NLA_HDRLEN;
            let body = &rest[NLA_HDRLEN..];
            if len > body.len() {
                warn!(ty, len, left = body.len(), "attribute data longer than message");
                return Err(Error::protocol(format!("attribute {ty} overruns message")));
            }
            let value = &body[..len];

            if let Some(spec) = self.specs.get(&ty) {
                if len < spec.min_len || len > spec.max_len {
                    warn!(ty, len, min = spec.min_len, max = spec.max_len, "attribute length not in allowed range");
                    return Err(Error::protocol(format!(
                        "attribute {ty} length {len} not in {}..={}",
                        spec.min_len, spec.max_len
                    )));
                }
                if spec.kind == AttrKind::NulString && value.last() != Some(&0) {
                    warn!(ty, "attribute lacks nul terminator");
                    return Err(Error::protocol(format!("attribute {ty} lacks nul terminator")));
                }
                if found.insert(ty, value).is_none() && spec.required {
                    still_required -= 1;
                }
            }

            // The last attribute may omit its padding.
            rest = &body[align(len).min(body.len())..];
        }
        if still_required > 0 {
            warn!(missing = still_required, "required attributes missing");
            return Err(Error::protocol(format!("{still_required} required attributes missing")));
        }
        Ok(ParsedAttrs { found })
    }
}

/// Attributes that passed a [`Policy`]
///
/// Getters return `None` for absent attributes; present ones already have
/// the length their kind needs.
#[derive(Debug, Clone, Default)]
pub struct ParsedAttrs<'a> {
    found: HashMap<u16, &'a [u8]>,
}

impl<'a> ParsedAttrs<'a> {
    pub fn get(&self, ty: u16) -> Option<&'a [u8]> {
        self.found.get(&ty).copied()
    }

    pub fn flag(&self, ty: u16) -> bool {
        self.found.contains_key(&ty)
    }

    pub fn u8(&self, ty: u16) -> Option<u8> {
        self.get(ty)?.first().copied()
    }

    pub fn u16(&self, ty: u16) -> Option<u16> {
        Some(u16::from_ne_bytes(self.get(ty)?.try_into().ok()?))
    }

    pub fn u32(&self, ty: u16) -> Option<u32> {
        Some(u32::from_ne_bytes(self.get(ty)?.try_into().ok()?))
    }

    pub fn u64(&self, ty: u16) -> Option<u64> {
        Some(u64::from_ne_bytes(self.get(ty)?.try_into().ok()?))
    }

    pub fn msecs(&self, ty: u16) -> Option<Duration> {
        self.u64(ty).map(Duration::from_millis)
    }

    pub fn string(&self, ty: u16) -> Option<String> {
        Some(String::from_utf8_lossy(self.get(ty)?).into_owned())
    }

    /// String value without its terminator
    pub fn nul_string(&self, ty: u16) -> Option<String> {
        let v = self.get(ty)?;
        Some(String::from_utf8_lossy(v.strip_suffix(&[0]).unwrap_or(v)).into_owned())
    }

    pub fn binary(&self, ty: u16) -> Option<&'a [u8]> {
        self.get(ty)
    }

    /// Parse nested attribute `ty` with `policy`
    pub fn nested(&self, ty: u16, policy: &Policy) -> Option<Result<ParsedAttrs<'a>>> {
        self.get(ty).map(|v| policy.parse(v))
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }
}
