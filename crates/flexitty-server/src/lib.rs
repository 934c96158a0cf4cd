//! flexitty-server: shares PTY-backed terminal sessions with WebSocket clients.
//!
//! The `flexitty` binary is a thin wrapper around [`server::FlexiServer`];
//! the session engine is usable on its own through [`session::SessionBroker`].

pub mod config;
pub mod server;
pub mod session;
pub mod transport;
