//! Session engine: PTY-backed terminals, output history, fan-out, registry.

pub mod broadcast;
pub mod broker;
pub mod pty;
pub mod ring_buffer;

pub use broadcast::{BroadcastGroup, SinkId};
pub use broker::{BrokerOptions, Session, SessionBroker};
pub use pty::TerminalSession;
pub use ring_buffer::RingBuffer;
