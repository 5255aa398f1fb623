//! Userspace side of the Linux conntrack netlink protocol.
//!
//! The crate does no I/O. It builds requests, compiles dump filters and
//! decodes replies; sending and receiving is left to the caller.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate tracing;

pub mod attribute;
pub mod constants;
mod error;
pub mod filter;
pub mod message;
pub mod nla;
pub mod record;

pub use attribute::AttributeKind;
pub use constants::{Family, Table};
pub use error::Error;
pub use filter::{FilterEntry, Instruction, compile};
pub use message::{ErrorReply, Message, MessageIterator, NetlinkHeader, Request};
pub use nla::ConnAttr;
pub use record::{ConnectionRecord, Status, TcpState};
