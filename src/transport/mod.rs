//! Multiplexing transport over the relay's polling RPC

mod queue;
mod stream;
#[allow(clippy::module_inception)]
mod transport;

pub use stream::{Stream, StreamEvent};
pub use transport::{Transport, TransportEvent};
