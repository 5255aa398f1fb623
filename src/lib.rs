#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
