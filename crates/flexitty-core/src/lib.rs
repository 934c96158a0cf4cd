//! flexitty-core: shared types for the multiplayer terminal server.
//!
//! Provides the error taxonomy, opaque session identifiers, the sink contract
//! that attached clients implement, and the JSON control messages exchanged
//! alongside raw terminal bytes.

pub mod control;
pub mod error;
pub mod session_id;
pub mod transport;

// Re-export commonly used items at crate root.
pub use control::ControlMessage;
pub use error::{FlexiError, FlexiResult};
pub use session_id::SessionId;
pub use transport::{Sink, SinkEvent, SinkFuture};
