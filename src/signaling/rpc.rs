//! The relay RPC seam
//!
//! The relay exposes three operations: `Prepare` (ICE server list), `Send`
//! (one outbound message) and `Recv` (server-streamed long poll keyed by
//! the caller's own identity). The generated client is injected behind
//! [`SignalingRpc`]; this crate only relies on error classification via
//! [`Error::is_retryable`](crate::Error::is_retryable) and per-call
//! timeout/cancellation.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::signaling::{IceServer, Message, PeerInfo};
use crate::Result;

/// Per-call options for the relay RPC.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Upper bound on the call, including the long-poll hold time.
    pub timeout: Duration,
    /// Cancels the call when fired.
    pub cancel: CancellationToken,
}

/// Messages produced by one long-poll receive call. The stream ends when
/// the server closes the poll or the call is cancelled or times out.
pub type MessageStream = BoxStream<'static, Result<Message>>;

/// Client boundary to the relay's signaling service.
///
/// Implementations map their transport failures onto [`Error`](crate::Error)
/// variants; transient faults must classify as retryable so the receive
/// loop polls through them.
#[async_trait]
pub trait SignalingRpc: Send + Sync + 'static {
    /// Fetch the ICE server list. Called once before building sessions.
    async fn prepare(&self, opts: RpcOptions) -> Result<Vec<IceServer>>;

    /// Deliver one message to the relay.
    async fn send(&self, msg: Message, opts: RpcOptions) -> Result<()>;

    /// Open a long poll for messages addressed to `src`.
    async fn recv(&self, src: PeerInfo, opts: RpcOptions) -> Result<MessageStream>;
}
