//! WebRTC peer client over relay-polled signaling
//!
//! This crate connects two endpoints that cannot signal directly: all
//! signaling flows through a relay reached only via a polling RPC (no
//! WebSocket, no server push). On top of that unreliable, high-latency,
//! at-least-once link it builds a deduplicated per-peer signaling channel
//! and drives WebRTC's offer/answer/ICE machinery through network churn.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  embedder                                            │
//! │  ├─ Transport (long-poll loop, discovery, demux)     │
//! │  │   └─ Stream per remote (dedup + priority queue)   │
//! │  └─ Session per stream (Perfect Negotiation,         │
//! │      candidate batching, debounced ICE restart)      │
//! │      ↓                                               │
//! │  webrtc::RTCPeerConnection (data channels, tracks)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The relay's generated client is injected behind the
//! [`SignalingRpc`] trait; the crate only assumes retryable-vs-fatal
//! error classification and abortable per-call timeouts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relaylink_peer::{
//!     Session, SessionConfig, SignalingRpc, Transport, TransportEvent, TransportOptions,
//! };
//!
//! # async fn example(rpc: Arc<dyn SignalingRpc>) -> relaylink_peer::Result<()> {
//! let transport = Transport::new(rpc, TransportOptions {
//!     group_id: "demo".to_string(),
//!     peer_id: "alice".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let mut events = transport.events()?;
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         if let TransportEvent::StreamOpened(stream) = event {
//!             let session = Session::new(stream, SessionConfig::default()).await?;
//!             let channel = session.create_data_channel("control", None).await?;
//!             let _ = channel;
//!         }
//!     }
//!     Ok::<_, relaylink_peer::Error>(())
//! });
//!
//! transport.listen().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{RecoverablePredicate, SessionConfig, TransportOptions};
pub use error::{Error, Result};
pub use session::{Session, SessionEvent};
pub use signaling::{
    IceServer, Message, MessageHeader, MessagePayload, PeerInfo, RpcOptions, Sdp, SdpKind, Signal,
    SignalData, SignalingRpc,
};
pub use transport::{Stream, StreamEvent, Transport, TransportEvent};
