//! One multiplexed conversation with a single remote endpoint

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::signaling::{Message, MessageHeader, MessagePayload, PeerInfo, Signal};
use crate::transport::queue::ReceiveQueue;
use crate::transport::transport::TransportCore;
use crate::{Error, Result};

/// Events a stream emits to its consumer, usually the session built on it.
#[derive(Debug)]
pub enum StreamEvent {
    /// A signaling payload from the remote endpoint.
    Signal(Signal),
    /// The stream is closed; no further events follow.
    Closed(String),
}

/// One logical, ordered conversation with exactly one remote
/// `(group, peer, conn)` triple, multiplexed over the transport.
///
/// Created by the transport — implicitly on the first inbound message from
/// an unrecognized remote, or as a result of [`Transport::connect`]
/// (crate::Transport::connect). Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    transport: Weak<TransportCore>,
    info: PeerInfo,
    other: PeerInfo,
    cancel: CancellationToken,
    queue: Mutex<ReceiveQueue>,
    next_seqnum: AtomicU32,
    closing: AtomicBool,
    closed_at: Mutex<Option<Instant>>,
    gc_grace: Duration,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl Stream {
    pub(crate) fn new(
        transport: Weak<TransportCore>,
        info: PeerInfo,
        other: PeerInfo,
        cancel: CancellationToken,
        gc_grace: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StreamInner {
                transport,
                info,
                other,
                cancel,
                queue: Mutex::new(ReceiveQueue::new()),
                next_seqnum: AtomicU32::new(0),
                closing: AtomicBool::new(false),
                closed_at: Mutex::new(None),
                gc_grace,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// This side's identity.
    pub fn info(&self) -> &PeerInfo {
        &self.inner.info
    }

    /// The remote endpoint. Never changes after creation.
    pub fn other(&self) -> &PeerInfo {
        &self.inner.other
    }

    /// Take the event receiver. Yields `Err` on the second call — the
    /// stream has exactly one consumer.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        self.inner.events_rx.lock().take().ok_or_else(|| {
            Error::InvalidState("stream event receiver already taken".to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// A token that fires when this stream (or its transport) closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Send one payload to the remote, stamped with this stream's identity
    /// and the next sequence number.
    pub async fn send(&self, payload: MessagePayload, reliable: bool) -> Result<()> {
        let transport = self
            .inner
            .transport
            .upgrade()
            .ok_or_else(|| Error::TransportClosed("transport dropped".to_string()))?;

        let seqnum = self.inner.next_seqnum.fetch_add(1, Ordering::SeqCst);
        let msg = Message {
            header: Some(MessageHeader {
                src: self.inner.info.clone(),
                dst: self.inner.other.clone(),
                seqnum,
                reliable,
            }),
            payload: Some(payload),
        };

        transport.send_message(&self.inner.cancel, msg).await
    }

    /// Accept one demultiplexed inbound message. Silently dropped when the
    /// stream is already closed.
    pub(crate) async fn enqueue(&self, msg: Message) {
        if self.inner.cancel.is_cancelled() {
            debug!(other = %self.inner.other, "message for a closed stream, ignoring");
            return;
        }

        {
            let mut queue = self.inner.queue.lock();
            if !queue.push(msg) {
                debug!(other = %self.inner.other, "duplicate reliable message dropped");
                return;
            }
            if !queue.begin_drain() {
                return;
            }
        }

        // Single-drain loop: one message at a time, lock released across
        // the handler so demultiplexing never blocks on it.
        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                match queue.pop_next() {
                    Some(msg) => msg,
                    None => {
                        queue.end_drain();
                        break;
                    }
                }
            };
            self.handle_message(next).await;
        }
    }

    async fn handle_message(&self, msg: Message) {
        let Some(payload) = msg.payload else {
            warn!(other = %self.inner.other, "stream message without payload");
            return;
        };

        match payload {
            MessagePayload::Signal(signal) => {
                let _ = self.inner.events_tx.send(StreamEvent::Signal(signal));
            }
            MessagePayload::Bye => {
                debug!(other = %self.inner.other, "remote closed the stream");
                self.close_internal("received bye from remote", true).await;
            }
            // its only purpose was to cause stream creation
            MessagePayload::Join => {}
            other => {
                debug!(other = %self.inner.other, payload = ?other, "dropping unexpected stream payload");
            }
        }
    }

    /// Close this stream, attempting a best-effort `bye` first. Idempotent.
    pub async fn close(&self, reason: Option<&str>) {
        self.close_internal(reason.unwrap_or("stream is closed"), false)
            .await;
    }

    async fn close_internal(&self, reason: &str, skip_bye: bool) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if !skip_bye {
            // give the remote a chance to tear down before we stop listening
            if let Err(err) = self.send(MessagePayload::Bye, false).await {
                warn!(other = %self.inner.other, error = %err, "failed to send bye");
            }
        }

        self.inner.cancel.cancel();
        *self.inner.closed_at.lock() = Some(Instant::now());
        let _ = self
            .inner
            .events_tx
            .send(StreamEvent::Closed(reason.to_string()));
        debug!(other = %self.inner.other, reason, "stream closed");
    }

    /// Whether the collector may drop this stream: closed and past the
    /// grace period during which late remote messages are still absorbed.
    pub(crate) fn is_gc_ready(&self) -> bool {
        if !self.inner.cancel.is_cancelled() {
            return false;
        }
        match *self.inner.closed_at.lock() {
            Some(at) => at.elapsed() > self.inner.gc_grace,
            None => true,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("info", &self.inner.info)
            .field("other", &self.inner.other)
            .field("closed", &self.is_closed())
            .finish()
    }
}
