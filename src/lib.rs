// resilient, line-oriented, bidirectional messaging link between a wired
// server and a fleet of wireless clients. read/write on either end just
// pause during an outage instead of erroring; reconnection, keepalives,
// dedup, and acks are handled underneath. radio/watchdog/LED/CLI concerns
// live outside this crate.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod line_queue;
pub mod mid;
pub mod pending_acks;
pub mod server;
pub mod state;

pub use client::ClientEngine;
pub use config::{ClientConfig, ServerConfig};
pub use error::{LinkError, Result};
pub use server::{Connection as ServerConnection, Server};
