//! WebRTC session layer: Perfect Negotiation over a transport stream

mod batcher;
mod restart;
#[allow(clippy::module_inception)]
mod session;

pub use session::{Session, SessionEvent};
