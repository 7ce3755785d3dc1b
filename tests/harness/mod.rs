//! In-memory relay bus shared by the integration tests
//!
//! Routes messages between registered peers the way the real relay does:
//! delivery is keyed on the destination's `(group, peer)` pair, and the
//! connection-id filtering is left to the receiving transport. Fault
//! injection covers duplicate delivery (at-least-once retransmission) and
//! hard send failures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

use relaylink_peer::signaling::MessageStream;
use relaylink_peer::{
    Error, IceServer, Message, PeerInfo, Result, RpcOptions, SignalingRpc, Stream, Transport,
    TransportEvent, TransportOptions,
};

#[derive(Clone, Default)]
pub struct RelayBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    mailboxes: Mutex<HashMap<(String, String), Vec<mpsc::UnboundedSender<Message>>>>,
    sent: Mutex<Vec<Message>>,
    duplicate: AtomicBool,
    fail_sends: AtomicBool,
}

impl RelayBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out one client handle; every transport gets its own.
    pub fn client(&self) -> Arc<dyn SignalingRpc> {
        Arc::new(RelayClient {
            bus: self.inner.clone(),
        })
    }

    /// Deliver every message twice, like an at-least-once relay under
    /// retransmission.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate.store(enabled, Ordering::SeqCst);
    }

    /// Make every send fail with a non-retryable error.
    pub fn set_fail_sends(&self, enabled: bool) {
        self.inner.fail_sends.store(enabled, Ordering::SeqCst);
    }

    /// All messages accepted so far from `peer_id`, in send order.
    pub fn sent_by(&self, peer_id: &str) -> Vec<Message> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|m| {
                m.header
                    .as_ref()
                    .is_some_and(|h| h.src.peer_id == peer_id)
            })
            .cloned()
            .collect()
    }
}

struct RelayClient {
    bus: Arc<BusInner>,
}

#[async_trait]
impl SignalingRpc for RelayClient {
    async fn prepare(&self, _opts: RpcOptions) -> Result<Vec<IceServer>> {
        Ok(Vec::new())
    }

    async fn send(&self, msg: Message, _opts: RpcOptions) -> Result<()> {
        if self.bus.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("relay rejected the send".to_string()));
        }

        self.bus.sent.lock().push(msg.clone());

        let Some(header) = msg.header.as_ref() else {
            return Ok(());
        };
        let key = (header.dst.group_id.clone(), header.dst.peer_id.clone());
        let copies = if self.bus.duplicate.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        let mailboxes = self.bus.mailboxes.lock();
        if let Some(senders) = mailboxes.get(&key) {
            for sender in senders {
                for _ in 0..copies {
                    let _ = sender.send(msg.clone());
                }
            }
        }
        Ok(())
    }

    async fn recv(&self, src: PeerInfo, _opts: RpcOptions) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .mailboxes
            .lock()
            .entry((src.group_id, src.peer_id))
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }
}

/// Transport options tuned for tests: fixed conn id, fast join retries.
pub fn test_options(peer_id: &str, conn_id: u32) -> TransportOptions {
    TransportOptions {
        group_id: "default".to_string(),
        peer_id: peer_id.to_string(),
        conn_id: Some(conn_id),
        join_retry_delay: Duration::from_millis(50),
        stream_gc_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Build a transport on the bus and start its listen loop.
pub fn spawn_transport(bus: &RelayBus, peer_id: &str, conn_id: u32) -> Arc<Transport> {
    let transport =
        Arc::new(Transport::new(bus.client(), test_options(peer_id, conn_id)).unwrap());
    {
        let transport = transport.clone();
        tokio::spawn(async move { transport.listen().await });
    }
    transport
}

/// Wait for the next `StreamOpened` event, failing the test on timeout or
/// on any other event.
pub async fn expect_stream(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Stream {
    match timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a stream")
        .expect("transport event channel closed")
    {
        TransportEvent::StreamOpened(stream) => stream,
        other => panic!("expected StreamOpened, got {:?}", other),
    }
}

/// Poll `cond` until it holds or five seconds elapse.
pub async fn wait_for(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaylink_peer=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
