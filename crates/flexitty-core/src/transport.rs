//! The sink contract implemented by every attached client connection.
//!
//! A sink is bidirectional: terminal output is pushed into it with `send`,
//! and client input is pulled out of it with `receive`. Both take `&self`
//! so one `Arc<dyn Sink>` can be shared by the broadcast group (sending)
//! and the input pump (receiving) at the same time.

use crate::error::FlexiResult;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Sink`] methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = FlexiResult<T>> + Send + 'a>>;

/// Something received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Raw bytes destined for the terminal's input.
    Input(Vec<u8>),
    /// The client's terminal geometry changed.
    Resize { cols: u16, rows: u16 },
}

/// An attached client connection.
pub trait Sink: Send + Sync {
    /// Deliver a chunk of terminal output to the client.
    fn send<'a>(&'a self, data: &'a [u8]) -> SinkFuture<'a, ()>;

    /// Wait for the next event from the client. `Ok(None)` means the client
    /// closed the connection cleanly.
    fn receive(&self) -> SinkFuture<'_, Option<SinkEvent>>;

    /// Short human-readable label for logs (e.g. the remote address).
    fn label(&self) -> String {
        "sink".to_string()
    }
}
