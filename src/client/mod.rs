mod socket;

use std::io;

use netlink_packet_conntrack::constants::{NLM_F_DUMP, NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP, NLMSG_OVERRUN};
use netlink_packet_conntrack::{
    ConnAttr, ConnectionRecord, ErrorReply, Family, FilterEntry, Message, MessageIterator,
    Request, Table, compile,
};

pub use socket::Socket;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] netlink_packet_conntrack::Error),

    #[error("sequence mismatched, want {want} but got {got}")]
    SequenceMismatched { want: u32, got: u32 },

    #[error("dump was interrupted by a concurrent table change")]
    Interrupted,

    #[error("no entry found")]
    NotFound,
}

impl Error {
    /// The errno behind this error, from the socket or from the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            Error::Protocol(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// A conntrack netlink session. Requests are sent one at a time, `&self`
/// methods must not be polled concurrently.
pub struct Client {
    socket: Socket,
}

impl Client {
    /// Open a netlink socket, must be called from within a tokio runtime.
    pub async fn open() -> Result<Self, Error> {
        let socket = Socket::open()?;

        Ok(Client { socket })
    }

    pub fn close(self) {
        debug!(message = "closing netlink socket", pid = self.socket.pid());
    }

    /// Remove every entry of `family` from `table`.
    pub async fn flush(&self, table: Table, family: Family) -> Result<(), Error> {
        self.execute(&Request::flush(table, family), |_| Ok(())).await
    }

    /// List every entry of `family` in `table`.
    pub async fn dump(&self, table: Table, family: Family) -> Result<Vec<ConnectionRecord>, Error> {
        let mut records = Vec::new();

        self.execute(&Request::dump(table, family), |msg| {
            collect(msg, &mut records);
            Ok(())
        })
        .await?;

        Ok(records)
    }

    /// Like [`Client::dump`], but the kernel drops entries not matching
    /// `filters` before they are copied to userspace.
    pub async fn dump_filter(
        &self,
        table: Table,
        family: Family,
        filters: &[FilterEntry],
    ) -> Result<Vec<ConnectionRecord>, Error> {
        let program = compile(table, filters)?;
        self.socket.attach_filter(&program)?;

        let result = self.dump(table, family).await;

        if let Err(err) = self.socket.detach_filter() {
            warn!(message = "detach filter failed", %err);
            if result.is_ok() {
                return Err(err.into());
            }
        }

        result
    }

    /// Fetch the single entry identified by `attrs`.
    pub async fn get(
        &self,
        table: Table,
        family: Family,
        attrs: &[ConnAttr],
    ) -> Result<ConnectionRecord, Error> {
        let request = Request::get(table, family, attrs)?;
        let mut records = Vec::with_capacity(1);

        self.execute(&request, |msg| {
            collect(msg, &mut records);
            Ok(())
        })
        .await?;

        records.pop().ok_or(Error::NotFound)
    }

    pub async fn create(&self, table: Table, family: Family, attrs: &[ConnAttr]) -> Result<(), Error> {
        let request = Request::create(table, family, attrs)?;
        self.execute(&request, |_| Ok(())).await
    }

    pub async fn update(&self, table: Table, family: Family, attrs: &[ConnAttr]) -> Result<(), Error> {
        let request = Request::update(table, family, attrs)?;
        self.execute(&request, |_| Ok(())).await
    }

    pub async fn delete(&self, table: Table, family: Family, attrs: &[ConnAttr]) -> Result<(), Error> {
        let request = Request::delete(table, family, attrs)?;
        self.execute(&request, |_| Ok(())).await
    }

    async fn execute<F>(&self, request: &Request, mut handle: F) -> Result<(), Error>
    where
        F: FnMut(Message<'_>) -> Result<(), Error>,
    {
        let seq = self.socket.next_seq();
        let buf = request.serialize(seq, self.socket.pid());

        debug!(
            message = "send request",
            typ = request.message_type(),
            flags = request.flags,
            seq,
            len = buf.len(),
        );

        self.socket.send(&buf).await?;

        let dump = request.flags & NLM_F_DUMP == NLM_F_DUMP;
        let mut state = Exchange::new(seq);
        loop {
            let resp = self.socket.receive().await?;
            if state.process(&resp, &mut handle)? {
                break;
            }
        }

        if dump && state.interrupted {
            return Err(Error::Interrupted);
        }

        Ok(())
    }
}

fn collect(msg: Message<'_>, records: &mut Vec<ConnectionRecord>) {
    match ConnectionRecord::parse(msg.payload) {
        Ok(record) => records.push(record),
        Err(err) => {
            warn!(message = "skip malformed record", seq = msg.header.sequence, %err);
        }
    }
}

/// Reply bookkeeping for one request.
struct Exchange {
    seq: u32,
    interrupted: bool,
}

impl Exchange {
    fn new(seq: u32) -> Self {
        Exchange {
            seq,
            interrupted: false,
        }
    }

    /// Handle every message of one receive buffer, returns true once the
    /// request is complete.
    fn process<F>(&mut self, buf: &[u8], handle: &mut F) -> Result<bool, Error>
    where
        F: FnMut(Message<'_>) -> Result<(), Error>,
    {
        for msg in MessageIterator::new(buf) {
            let msg = msg?;

            if msg.header.sequence != self.seq {
                return Err(Error::SequenceMismatched {
                    want: self.seq,
                    got: msg.header.sequence,
                });
            }

            self.interrupted |= msg.is_interrupted();

            match msg.header.typ {
                NLMSG_NOOP => continue,
                NLMSG_OVERRUN => return Err(io::Error::from_raw_os_error(libc::ENOBUFS).into()),
                NLMSG_DONE => return Ok(true),
                NLMSG_ERROR => {
                    let reply = ErrorReply::parse(msg.payload)?;
                    trace!(message = "error reply", code = reply.code, seq = reply.header.sequence);
                    reply.check()?;
                    return Ok(true);
                }
                _ => handle(msg)?,
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use netlink_packet_conntrack::AttributeKind::*;
    use netlink_packet_conntrack::constants::{NLM_F_DUMP_INTR, NLM_F_MULTI};

    use super::*;

    fn message(typ: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let len = 16 + payload.len();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&(len as u32).to_ne_bytes());
        buf.extend_from_slice(&typ.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    fn error(seq: u32, code: i32) -> Vec<u8> {
        let mut payload = code.to_ne_bytes().to_vec();
        payload.extend(message(0x0100, 0x05, seq, &[]));
        message(NLMSG_ERROR, 0, seq, &payload)
    }

    fn record() -> Vec<u8> {
        let attrs = netlink_packet_conntrack::nla::encode(&[
            ConnAttr::ipv4(OrigIpv4Src, [10, 0, 0, 1].into()),
            ConnAttr::ipv4(OrigIpv4Dst, [10, 0, 0, 2].into()),
            ConnAttr::u8(OrigL4Proto, 17),
            ConnAttr::u16(OrigPortSrc, 5353),
            ConnAttr::u16(OrigPortDst, 53),
            ConnAttr::u32(Timeout, 30),
        ])
        .unwrap();

        let mut payload = vec![2, 0, 0, 0];
        payload.extend(attrs);
        payload
    }

    #[test]
    fn ack_completes() {
        let mut exchange = Exchange::new(7);
        let mut calls = 0;

        let done = exchange
            .process(&error(7, 0), &mut |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert!(done);
        assert_eq!(calls, 0);
    }

    #[test]
    fn kernel_error() {
        let mut exchange = Exchange::new(3);

        let err = exchange
            .process(&error(3, -libc::ENOENT), &mut |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(matches!(
            err,
            Error::Protocol(netlink_packet_conntrack::Error::KernelReported { code }) if code == -libc::ENOENT
        ));
    }

    #[test]
    fn dump_spans_buffers() {
        let mut exchange = Exchange::new(9);
        let mut records = Vec::new();
        let mut handle = |msg: Message<'_>| {
            collect(msg, &mut records);
            Ok(())
        };

        let mut first = message(0x0100, NLM_F_MULTI, 9, &record());
        first.extend(message(0x0100, NLM_F_MULTI, 9, &record()));
        assert!(!exchange.process(&first, &mut handle).unwrap());

        let mut second = message(0x0100, NLM_F_MULTI, 9, &record());
        second.extend(message(NLMSG_DONE, NLM_F_MULTI, 9, &0i32.to_ne_bytes()));
        assert!(exchange.process(&second, &mut handle).unwrap());

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].orig.dst_port, Some(53));
        assert!(!exchange.interrupted);
    }

    #[test]
    fn malformed_record_is_skipped() {
        let mut exchange = Exchange::new(1);
        let mut records = Vec::new();

        let mut broken = record();
        // first attribute claims more than the buffer holds
        broken[4] = 0xff;

        let mut buf = message(0x0100, NLM_F_MULTI, 1, &broken);
        buf.extend(message(0x0100, NLM_F_MULTI, 1, &record()));
        buf.extend(message(NLMSG_DONE, NLM_F_MULTI, 1, &[]));

        let done = exchange
            .process(&buf, &mut |msg| {
                collect(msg, &mut records);
                Ok(())
            })
            .unwrap();
        assert!(done);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn noop_is_ignored() {
        let mut exchange = Exchange::new(2);
        let mut buf = message(NLMSG_NOOP, 0, 2, &[]);
        buf.extend(error(2, 0));

        assert!(exchange.process(&buf, &mut |_| Ok(())).unwrap());
    }

    #[test]
    fn sequence_mismatch() {
        let mut exchange = Exchange::new(5);

        let err = exchange.process(&error(4, 0), &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::SequenceMismatched { want: 5, got: 4 }));
    }

    #[test]
    fn interrupted_dump() {
        let mut exchange = Exchange::new(6);
        let mut buf = message(0x0100, NLM_F_MULTI | NLM_F_DUMP_INTR, 6, &record());
        buf.extend(message(NLMSG_DONE, NLM_F_MULTI, 6, &[]));

        assert!(exchange.process(&buf, &mut |_| Ok(())).unwrap());
        assert!(exchange.interrupted);
    }

    #[test]
    fn overrun() {
        let mut exchange = Exchange::new(8);

        let err = exchange
            .process(&message(NLMSG_OVERRUN, 0, 8, &[]), &mut |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
    }

    #[test]
    fn truncated_error_reply() {
        let mut exchange = Exchange::new(1);

        let err = exchange
            .process(&message(NLMSG_ERROR, 0, 1, &[0, 0, 0, 0]), &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(netlink_packet_conntrack::Error::TruncatedReply { want: 20, got: 4 })
        ));
    }

    // The tests below talk to the running kernel and need CAP_NET_ADMIN.

    fn flow() -> Vec<ConnAttr> {
        vec![
            ConnAttr::ipv4(OrigIpv4Src, [192, 0, 2, 1].into()),
            ConnAttr::ipv4(OrigIpv4Dst, [192, 0, 2, 2].into()),
            ConnAttr::u8(OrigL4Proto, 6),
            ConnAttr::u16(OrigPortSrc, 40000),
            ConnAttr::u16(OrigPortDst, 8080),
            ConnAttr::u8(TcpState, 3),
            ConnAttr::u32(Timeout, 100),
        ]
    }

    #[ignore]
    #[tokio::test]
    async fn create_get_delete() {
        let client = Client::open().await.unwrap();
        let attrs = flow();

        client
            .create(Table::Conntrack, Family::Ipv4, &attrs)
            .await
            .unwrap();

        let record = client
            .get(Table::Conntrack, Family::Ipv4, &attrs[..5])
            .await
            .unwrap();
        assert_eq!(record.orig.dst_port, Some(8080));

        let mut updated = attrs.clone();
        updated.push(ConnAttr::u32(Mark, 42));
        client
            .update(Table::Conntrack, Family::Ipv4, &updated)
            .await
            .unwrap();

        let filtered = client
            .dump_filter(
                Table::Conntrack,
                Family::Ipv4,
                &[FilterEntry::new(OrigPortDst, 8080u16.to_be_bytes().to_vec())],
            )
            .await
            .unwrap();
        assert!(filtered.iter().all(|r| r.orig.dst_port == Some(8080)));
        assert!(!filtered.is_empty());

        client
            .delete(Table::Conntrack, Family::Ipv4, &attrs[..5])
            .await
            .unwrap();

        let err = client
            .delete(Table::Conntrack, Family::Ipv4, &attrs[..5])
            .await
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        client.close();
    }

    #[ignore]
    #[tokio::test]
    async fn flush_and_dump() {
        let client = Client::open().await.unwrap();

        client.flush(Table::Conntrack, Family::Ipv6).await.unwrap();
        let records = client.dump(Table::Conntrack, Family::Ipv6).await.unwrap();
        assert!(records.iter().all(|r| r.family == Family::Ipv6.as_u8()));
    }
}
