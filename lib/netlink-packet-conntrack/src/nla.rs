//! Netlink attribute (TLV) codec.
//!
//! Attributes are `u16 length | u16 type | payload`, padded to four bytes.
//! Header fields are host order, payloads are copied verbatim, so integers
//! must already be in network order.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::attribute::{self, AttributeKind};
use crate::constants::{NLA_F_NESTED, NLA_TYPE_MASK};
use crate::Error;

pub const NLA_ALIGNTO: usize = 4;
pub const NLA_HDRLEN: usize = 4;

#[inline]
pub const fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// A typed attribute value, `data` holds the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnAttr {
    pub kind: AttributeKind,
    pub data: Vec<u8>,
}

impl ConnAttr {
    pub fn new(kind: AttributeKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn u8(kind: AttributeKind, value: u8) -> Self {
        Self::new(kind, [value])
    }

    pub fn u16(kind: AttributeKind, value: u16) -> Self {
        Self::new(kind, value.to_be_bytes())
    }

    pub fn u32(kind: AttributeKind, value: u32) -> Self {
        Self::new(kind, value.to_be_bytes())
    }

    pub fn u64(kind: AttributeKind, value: u64) -> Self {
        Self::new(kind, value.to_be_bytes())
    }

    pub fn ipv4(kind: AttributeKind, addr: Ipv4Addr) -> Self {
        Self::new(kind, addr.octets())
    }

    pub fn ipv6(kind: AttributeKind, addr: Ipv6Addr) -> Self {
        Self::new(kind, addr.octets())
    }

    /// Build an attribute from text, see [`AttributeKind::parse_value`].
    pub fn parse(kind: AttributeKind, text: &str) -> Result<Self, Error> {
        kind.parse_value(text).map(|data| Self { kind, data })
    }

    fn check(&self) -> Result<(), Error> {
        let expected = self.kind.width();
        if self.data.len() != expected {
            return Err(Error::InvalidAttributeLength {
                kind: self.kind,
                expected,
                actual: self.data.len(),
            });
        }

        Ok(())
    }
}

/// Encode `attrs` into a nested attribute stream.
///
/// Attributes are written in [`AttributeKind`] order. Attributes sharing a
/// parent nest are wrapped into one nested attribute, nests appear in the
/// order of their first member.
pub fn encode(attrs: &[ConnAttr]) -> Result<Vec<u8>, Error> {
    let mut buf = BytesMut::with_capacity(attrs.len() * 16);
    encode_into(attrs, &mut buf)?;
    Ok(buf.to_vec())
}

pub fn encode_into(attrs: &[ConnAttr], buf: &mut BytesMut) -> Result<(), Error> {
    for attr in attrs {
        attr.check()?;
    }

    let mut sorted = attrs.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|attr| attr.kind);

    emit_level(buf, &sorted, 0)
}

fn emit_level(buf: &mut BytesMut, attrs: &[&ConnAttr], depth: usize) -> Result<(), Error> {
    // group by the nest at this depth, keeping first occurrence order
    let mut groups: Vec<(Option<u16>, Vec<&ConnAttr>)> = Vec::new();
    for attr in attrs {
        let path = attr.kind.info().path;
        if path.len() == depth {
            groups.push((None, vec![*attr]));
            continue;
        }

        let nest = path[depth];
        match groups.iter_mut().find(|(key, _)| *key == Some(nest)) {
            Some((_, members)) => members.push(attr),
            None => groups.push((Some(nest), vec![*attr])),
        }
    }

    for (nest, members) in groups {
        match nest {
            None => {
                for attr in members {
                    emit_attr(buf, attr.kind.info().attr, &attr.data)?;
                }
            }
            Some(nest) => {
                let start = buf.len();
                buf.put_u32(0);
                emit_level(buf, &members, depth + 1)?;

                let len = u16::try_from(buf.len() - start)
                    .map_err(|_| Error::malformed("nested attribute exceeds 65535 bytes"))?;
                buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
                buf[start + 2..start + 4].copy_from_slice(&(nest | NLA_F_NESTED).to_ne_bytes());
            }
        }
    }

    Ok(())
}

fn emit_attr(buf: &mut BytesMut, typ: u16, data: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(NLA_HDRLEN + data.len())
        .map_err(|_| Error::malformed("attribute exceeds 65535 bytes"))?;

    buf.put_u16_ne(len);
    buf.put_u16_ne(typ);
    buf.put_slice(data);
    buf.put_bytes(0, align(len as usize) - len as usize);

    Ok(())
}

/// One attribute as found by [`NlaIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nla<'a> {
    /// Attribute number, with the flag bits cleared.
    pub attr: u16,
    pub nested: bool,
    pub payload: &'a [u8],
}

/// Walks one level of an attribute stream.
///
/// Iteration ends when less than a header is left, so trailing padding is
/// ignored. A header that declares less than its own size, or more than
/// what is left, yields an error and ends the iteration.
pub struct NlaIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NlaIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for NlaIterator<'a> {
    type Item = Result<Nla<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().saturating_sub(self.pos);
        if remaining < NLA_HDRLEN {
            return None;
        }

        let header = &self.data[self.pos..self.pos + NLA_HDRLEN];
        let len = u16::from_ne_bytes([header[0], header[1]]) as usize;
        let typ = u16::from_ne_bytes([header[2], header[3]]);

        if len < NLA_HDRLEN || len > remaining {
            self.pos = self.data.len();
            return Some(Err(Error::malformed(format!(
                "attribute {} declares length {len} with {remaining} bytes left",
                typ & NLA_TYPE_MASK
            ))));
        }

        let payload = &self.data[self.pos + NLA_HDRLEN..self.pos + len];
        self.pos += align(len);

        Some(Ok(Nla {
            attr: typ & NLA_TYPE_MASK,
            nested: typ & NLA_F_NESTED != 0,
            payload,
        }))
    }
}

/// Decode an attribute stream into the registered attributes it carries.
///
/// Unknown attributes are skipped. Any malformed header aborts the whole
/// decode.
pub fn decode(data: &[u8]) -> Result<Vec<ConnAttr>, Error> {
    let mut attrs = Vec::new();
    let mut path = Vec::with_capacity(attribute::MAX_NESTING + 1);
    decode_level(data, &mut path, &mut attrs)?;
    Ok(attrs)
}

fn decode_level(data: &[u8], path: &mut Vec<u16>, attrs: &mut Vec<ConnAttr>) -> Result<(), Error> {
    for nla in NlaIterator::new(data) {
        let nla = nla?;

        path.push(nla.attr);
        // Older kernels do not flag ctnetlink nests, so the registry decides.
        if attribute::is_nest(path) {
            decode_level(nla.payload, path, attrs)?;
        } else if !nla.nested {
            match attribute::lookup(&path[..path.len() - 1], nla.attr) {
                Some(kind) => {
                    let attr = ConnAttr::new(kind, nla.payload);
                    attr.check().map_err(|err| Error::malformed(err.to_string()))?;
                    attrs.push(attr);
                }
                None => trace!(message = "skip unknown attribute", ?path),
            }
        } else {
            trace!(message = "skip unknown nest", ?path);
        }
        path.pop();
    }

    Ok(())
}

/// Exact width accessors for attribute payloads.
pub(crate) mod get {
    use super::*;

    fn array<const N: usize>(data: &[u8]) -> Result<[u8; N], Error> {
        data.try_into().map_err(|_| {
            Error::malformed(format!("want {N} bytes payload, got {}", data.len()))
        })
    }

    pub fn u8(data: &[u8]) -> Result<u8, Error> {
        array::<1>(data).map(|b| b[0])
    }

    pub fn be_u16(data: &[u8]) -> Result<u16, Error> {
        array(data).map(u16::from_be_bytes)
    }

    pub fn be_u32(data: &[u8]) -> Result<u32, Error> {
        array(data).map(u32::from_be_bytes)
    }

    pub fn be_u64(data: &[u8]) -> Result<u64, Error> {
        array(data).map(u64::from_be_bytes)
    }

    pub fn ipv4(data: &[u8]) -> Result<Ipv4Addr, Error> {
        array::<4>(data).map(Ipv4Addr::from)
    }

    pub fn ipv6(data: &[u8]) -> Result<Ipv6Addr, Error> {
        array::<16>(data).map(Ipv6Addr::from)
    }
}
