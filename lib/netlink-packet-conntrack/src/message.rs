//! Netlink framing for ctnetlink requests and replies.

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::*;
use crate::nla::{self, ConnAttr};
use crate::Error;

pub const NETLINK_HEADER_LEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;
/// `int error` followed by the header of the offending request.
pub const ERROR_REPLY_LEN: usize = 4 + NETLINK_HEADER_LEN;

const NLMSG_ALIGNTO: usize = 4;

#[inline]
fn align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// `struct nlmsghdr`, every field in host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetlinkHeader {
    pub length: u32,
    pub typ: u16,
    pub flags: u16,
    pub sequence: u32,
    pub pid: u32,
}

impl NetlinkHeader {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < NETLINK_HEADER_LEN {
            return Err(Error::MalformedMessage(format!(
                "netlink header needs {NETLINK_HEADER_LEN} bytes, got {}",
                data.len()
            )));
        }

        let mut buf = &data[..NETLINK_HEADER_LEN];
        Ok(Self {
            length: buf.get_u32_ne(),
            typ: buf.get_u16_ne(),
            flags: buf.get_u16_ne(),
            sequence: buf.get_u32_ne(),
            pid: buf.get_u32_ne(),
        })
    }

    pub fn emit(&self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.length);
        buf.put_u16_ne(self.typ);
        buf.put_u16_ne(self.flags);
        buf.put_u32_ne(self.sequence);
        buf.put_u32_ne(self.pid);
    }
}

/// `struct nfgenmsg`, the header every nfnetlink payload starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackRequest {
    pub family: u8,
    pub version: u8,
    /// Written in network order.
    pub res_id: u16,
}

impl Default for ConntrackRequest {
    fn default() -> Self {
        Self {
            family: Family::Ipv4.as_u8(),
            version: NFNETLINK_V0,
            res_id: 0,
        }
    }
}

impl ConntrackRequest {
    pub fn new(family: Family, res_id: u16) -> Self {
        Self {
            family: family.as_u8(),
            version: NFNETLINK_V0,
            res_id,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < NFGENMSG_LEN {
            return Err(Error::MalformedMessage(format!(
                "nfgenmsg needs {NFGENMSG_LEN} bytes, got {}",
                data.len()
            )));
        }

        Ok(Self {
            family: data[0],
            version: data[1],
            res_id: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    pub fn emit(&self, buf: &mut BytesMut) {
        buf.put_u8(self.family);
        buf.put_u8(self.version);
        buf.put_u16(self.res_id);
    }
}

/// A request ready to be sent, minus sequence number and port id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub table: Table,
    pub msg: u8,
    pub flags: u16,
    pub header: ConntrackRequest,
    /// Encoded attribute body.
    pub attrs: Vec<u8>,
}

impl Request {
    fn bare(table: Table, family: Family, msg: u8, flags: u16) -> Self {
        Self {
            table,
            msg,
            flags,
            header: ConntrackRequest::new(family, 0),
            attrs: Vec::new(),
        }
    }

    fn with_attrs(
        table: Table,
        family: Family,
        msg: u8,
        flags: u16,
        attrs: &[ConnAttr],
    ) -> Result<Self, Error> {
        Ok(Self {
            table,
            msg,
            flags,
            header: ConntrackRequest::new(family, table.subsystem() as u16),
            attrs: nla::encode(attrs)?,
        })
    }

    /// Remove every entry of `family` from `table`.
    pub fn flush(table: Table, family: Family) -> Self {
        Self::bare(table, family, IPCTNL_MSG_CT_DELETE, NLM_F_REQUEST | NLM_F_ACK)
    }

    /// List every entry of `family` in `table`.
    pub fn dump(table: Table, family: Family) -> Self {
        Self::bare(table, family, IPCTNL_MSG_CT_GET, NLM_F_REQUEST | NLM_F_DUMP)
    }

    /// Look up the single entry identified by `attrs`.
    pub fn get(table: Table, family: Family, attrs: &[ConnAttr]) -> Result<Self, Error> {
        Self::with_attrs(table, family, IPCTNL_MSG_CT_GET, NLM_F_REQUEST | NLM_F_ACK, attrs)
    }

    /// Insert a new entry, failing if it already exists.
    pub fn create(table: Table, family: Family, attrs: &[ConnAttr]) -> Result<Self, Error> {
        Self::with_attrs(
            table,
            family,
            IPCTNL_MSG_CT_NEW,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_ACK | NLM_F_EXCL,
            attrs,
        )
    }

    /// Change an existing entry.
    pub fn update(table: Table, family: Family, attrs: &[ConnAttr]) -> Result<Self, Error> {
        Self::with_attrs(table, family, IPCTNL_MSG_CT_NEW, NLM_F_REQUEST | NLM_F_ACK, attrs)
    }

    /// Remove the single entry identified by `attrs`.
    pub fn delete(table: Table, family: Family, attrs: &[ConnAttr]) -> Result<Self, Error> {
        Self::with_attrs(table, family, IPCTNL_MSG_CT_DELETE, NLM_F_REQUEST | NLM_F_ACK, attrs)
    }

    #[inline]
    pub fn message_type(&self) -> u16 {
        self.table.message_type(self.msg)
    }

    pub fn buffer_len(&self) -> usize {
        NETLINK_HEADER_LEN + NFGENMSG_LEN + self.attrs.len()
    }

    pub fn serialize(&self, sequence: u32, pid: u32) -> Vec<u8> {
        let len = self.buffer_len();
        let mut buf = BytesMut::with_capacity(len);

        NetlinkHeader {
            length: len as u32,
            typ: self.message_type(),
            flags: self.flags,
            sequence,
            pid,
        }
        .emit(&mut buf);
        self.header.emit(&mut buf);
        buf.put_slice(&self.attrs);

        buf.to_vec()
    }
}

/// One message out of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub header: NetlinkHeader,
    /// Everything after the netlink header, up to the declared length.
    pub payload: &'a [u8],
}

impl Message<'_> {
    #[inline]
    pub fn is_multi(&self) -> bool {
        self.header.flags & NLM_F_MULTI != 0
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.header.flags & NLM_F_DUMP_INTR != 0
    }

    /// The nfnetlink subsystem this message belongs to.
    #[inline]
    pub fn subsystem(&self) -> u8 {
        (self.header.typ >> 8) as u8
    }
}

/// Walks the messages of a receive buffer.
///
/// Stops once less than a header is left. A header whose length is smaller
/// than itself, or larger than the rest of the buffer, yields an error and
/// ends the iteration.
pub struct MessageIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for MessageIterator<'a> {
    type Item = Result<Message<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().saturating_sub(self.pos);
        if remaining < NETLINK_HEADER_LEN {
            return None;
        }

        let header = match NetlinkHeader::parse(&self.data[self.pos..]) {
            Ok(header) => header,
            Err(err) => {
                self.pos = self.data.len();
                return Some(Err(err));
            }
        };

        let len = header.length as usize;
        if len < NETLINK_HEADER_LEN || len > remaining {
            self.pos = self.data.len();
            return Some(Err(Error::MalformedMessage(format!(
                "message declares length {len} with {remaining} bytes left"
            ))));
        }

        let payload = &self.data[self.pos + NETLINK_HEADER_LEN..self.pos + len];
        self.pos += align(len);

        Some(Ok(Message { header, payload }))
    }
}

/// `struct nlmsgerr` without any extended ack attributes.
///
/// A zero code is a plain acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorReply {
    /// Negative errno, or zero.
    pub code: i32,
    /// Header of the request this reply belongs to.
    pub header: NetlinkHeader,
}

impl ErrorReply {
    /// Decode the fixed prefix of an `NLMSG_ERROR` payload. The code is not
    /// interpreted, see [`ErrorReply::check`].
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < ERROR_REPLY_LEN {
            return Err(Error::TruncatedReply {
                want: ERROR_REPLY_LEN,
                got: data.len(),
            });
        }

        let mut buf = data;
        let code = buf.get_i32_ne();
        let header = NetlinkHeader::parse(buf)?;

        Ok(Self { code, header })
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.code == 0
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.code == 0 {
            Ok(())
        } else {
            Err(Error::KernelReported { code: self.code })
        }
    }
}
