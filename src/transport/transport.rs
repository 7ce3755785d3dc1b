//! Transport: identity, receive loop, discovery, and stream lifecycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::TransportOptions;
use crate::retry::{retry, RetryPolicy};
use crate::signaling::{
    Message, MessageHeader, MessagePayload, PeerInfo, RpcOptions, SignalingRpc,
};
use crate::transport::stream::Stream;
use crate::{Error, Result};

/// Events a transport emits to its embedder.
#[derive(Debug)]
pub enum TransportEvent {
    /// A stream to a newly discovered remote endpoint. Wrap it in a
    /// [`Session`](crate::Session) to negotiate a connection.
    StreamOpened(Stream),
    /// The transport is closed; no further events follow.
    Closed(String),
}

/// Multiplexing signaling transport over the relay's polling RPC.
///
/// Owns this peer's network identity, runs the long-poll receive loop,
/// discovers remote peers, and demultiplexes inbound traffic into one
/// [`Stream`] per remote `(group, peer, conn)` triple. Single-use: once
/// closed it cannot be restarted.
pub struct Transport {
    core: Arc<TransportCore>,
}

pub(crate) struct TransportCore {
    rpc: Arc<dyn SignalingRpc>,
    info: PeerInfo,
    opts: TransportOptions,
    cancel: CancellationToken,
    streams: RwLock<Vec<Stream>>,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Transport {
    /// Create a transport with the given identity options.
    ///
    /// # Errors
    ///
    /// Returns an error if the options fail validation.
    pub fn new(rpc: Arc<dyn SignalingRpc>, opts: TransportOptions) -> Result<Self> {
        opts.validate()?;

        let conn_id = opts.conn_id.unwrap_or_else(|| {
            rand::thread_rng().gen_range(PeerInfo::RESERVED_CONN_ID_MAX..=u32::MAX)
        });
        let info = PeerInfo {
            group_id: opts.group_id.clone(),
            peer_id: opts.peer_id.clone(),
            conn_id,
        };
        debug!(info = %info, "transport created");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            core: Arc::new(TransportCore {
                rpc,
                info,
                opts,
                cancel: CancellationToken::new(),
                streams: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        })
    }

    /// This transport's identity, including the drawn connection id.
    pub fn info(&self) -> &PeerInfo {
        &self.core.info
    }

    /// Take the event receiver. Yields `Err` on the second call.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.core.events_rx.lock().take().ok_or_else(|| {
            Error::InvalidState("transport event receiver already taken".to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Run the receive and collector loops until the transport closes.
    ///
    /// Returns when [`close`](Self::close) is called or when the receive
    /// loop hits an unrecoverable RPC error (which force-closes the
    /// transport) — the only path that ends this before an explicit close.
    pub async fn listen(&self) {
        tokio::join!(self.core.poll_loop(), self.core.gc_loop());
    }

    /// Best-effort rendezvous with `(other_group_id, other_peer_id)`.
    ///
    /// Repeats a discovery `join` until a stream for that endpoint appears
    /// or either `signal` or the transport fires. Supplies no timeout of
    /// its own; the caller owns timeout policy through `signal`.
    pub async fn connect(
        &self,
        other_group_id: &str,
        other_peer_id: &str,
        signal: &CancellationToken,
    ) {
        self.core.connect(other_group_id, other_peer_id, signal).await;
    }

    /// Close every stream, abort the receive loop, and emit
    /// [`TransportEvent::Closed`]. Idempotent.
    pub async fn close(&self, reason: Option<&str>) {
        self.core.close(reason.unwrap_or("transport is closed")).await;
    }
}

impl TransportCore {
    async fn poll_once(self: &Arc<Self>) -> Result<()> {
        let opts = RpcOptions {
            timeout: self.opts.poll_timeout,
            cancel: self.cancel.clone(),
        };
        let mut messages = self.rpc.recv(self.info.clone(), opts).await?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled("transport closed".to_string()));
                }
                item = messages.next() => match item {
                    Some(Ok(msg)) => self.handle_message(msg).await,
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                }
            }
        }
    }

    pub(crate) async fn poll_loop(self: &Arc<Self>) {
        let policy = RetryPolicy::unbounded(self.opts.retry_base_delay, self.opts.retry_max_delay);
        let recoverable = self.opts.recoverable_predicate();

        while !self.cancel.is_cancelled() {
            let result = {
                let core = self.clone();
                retry(&policy, &self.cancel, |err| recoverable(err), move || {
                    let core = core.clone();
                    async move { core.poll_once().await }
                })
                .await
            };

            match result {
                // poll drained normally; open the next one
                Ok(()) => {}
                Err(Error::Cancelled(_)) => break,
                Err(err) => {
                    error!(error = %err, "unrecoverable receive error, force closing");
                    self.close("unrecoverable receive error").await;
                    return;
                }
            }
        }
        debug!("poll loop closed");
    }

    pub(crate) async fn gc_loop(self: &Arc<Self>) {
        while !self.cancel.is_cancelled() {
            // closed streams linger for a grace period so the remote's
            // in-flight messages land on the closed stream instead of
            // resurrecting the conversation
            self.streams.write().await.retain(|s| !s.is_gc_ready());

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opts.stream_gc_interval) => {}
            }
        }
        debug!("gc loop closed");
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        trace!(?msg, "received message");
        if self.cancel.is_cancelled() {
            return;
        }

        let Some(header) = msg.header.as_ref() else {
            if let Some(payload) = msg.payload {
                self.handle_control_message(payload);
            }
            return;
        };
        let src = header.src.clone();
        let dst = header.dst.clone();

        if dst.conn_id >= PeerInfo::RESERVED_CONN_ID_MAX && dst.conn_id != self.info.conn_id {
            warn!(
                received_conn_id = dst.conn_id,
                "message addressed to a stale connection, ignoring"
            );
            return;
        }

        let existing = {
            let streams = self.streams.read().await;
            streams.iter().find(|s| *s.other() == src).cloned()
        };

        let stream = match existing {
            Some(stream) => stream,
            None => {
                if src.peer_id == self.info.peer_id {
                    warn!("loopback detected, ignoring message");
                    return;
                }

                debug!(other = %src, "no stream for remote, creating one");
                let stream = Stream::new(
                    Arc::downgrade(self),
                    self.info.clone(),
                    src,
                    self.cancel.child_token(),
                    self.opts.stream_gc_grace,
                );
                self.streams.write().await.push(stream.clone());
                let _ = self
                    .events_tx
                    .send(TransportEvent::StreamOpened(stream.clone()));
                stream
            }
        };

        stream.enqueue(msg).await;
    }

    fn handle_control_message(&self, payload: MessagePayload) {
        match payload {
            MessagePayload::Ping => debug!("received ping"),
            other => warn!(payload = ?other, "received unknown control message"),
        }
    }

    pub(crate) async fn connect(
        self: &Arc<Self>,
        other_group_id: &str,
        other_peer_id: &str,
        signal: &CancellationToken,
    ) {
        let header = MessageHeader {
            src: self.info.clone(),
            dst: PeerInfo {
                group_id: other_group_id.to_string(),
                peer_id: other_peer_id.to_string(),
                conn_id: PeerInfo::DISCOVERY_CONN_ID,
            },
            seqnum: 0,
            reliable: false,
        };

        // joined token: fires on caller abort or transport close
        let joined = self.cancel.child_token();
        {
            let joined = joined.clone();
            let caller = signal.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => joined.cancel(),
                    _ = joined.cancelled() => {}
                }
            });
        }
        let _reap_watcher = joined.clone().drop_guard();

        let mut found = false;
        while !joined.is_cancelled() && !found {
            let msg = Message {
                header: Some(header.clone()),
                payload: Some(MessagePayload::Join),
            };
            // best-effort: a fatal send closes the transport, which also
            // cancels the joined token and ends the loop
            let _ = self.send_message(&joined, msg).await;

            tokio::select! {
                _ = joined.cancelled() => {}
                _ = tokio::time::sleep(self.opts.join_retry_delay) => {}
            }

            found = {
                let streams = self.streams.read().await;
                streams.iter().any(|s| {
                    s.other().group_id == other_group_id && s.other().peer_id == other_peer_id
                })
            };
        }
    }

    pub(crate) async fn send_message(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        msg: Message,
    ) -> Result<()> {
        let policy = RetryPolicy::unbounded(self.opts.retry_base_delay, self.opts.retry_max_delay);
        let recoverable = self.opts.recoverable_predicate();

        let result = {
            let rpc = self.rpc.clone();
            let opts = RpcOptions {
                timeout: self.opts.poll_timeout,
                cancel: cancel.clone(),
            };
            retry(&policy, cancel, |err| recoverable(err), move || {
                let rpc = rpc.clone();
                let msg = msg.clone();
                let opts = opts.clone();
                async move { rpc.send(msg, opts).await }
            })
            .await
        };

        match result {
            Ok(()) => Ok(()),
            Err(err @ Error::Cancelled(_)) => {
                warn!("aborted, message dropped from sending");
                Err(err)
            }
            Err(err) => {
                // an outbound failure is a transport-wide fault: every
                // stream shares this identity and link
                error!(error = %err, "unrecoverable send error, force closing");
                spawn_force_close(self.clone());
                Err(err)
            }
        }
    }

    pub(crate) async fn close(self: &Arc<Self>, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let streams: Vec<Stream> = self.streams.read().await.clone();
        // graceful byes go out before the token cancels the send path
        futures::future::join_all(streams.iter().map(|s| s.close(Some(reason)))).await;

        self.cancel.cancel();
        self.streams.write().await.clear();
        let _ = self
            .events_tx
            .send(TransportEvent::Closed(reason.to_string()));
        debug!(reason, "transport closed");
    }
}

/// Spawn a force-close on the transport. Kept as a free function so the
/// spawned future's `Send` obligation lives here rather than inside
/// `send_message`, whose own future would otherwise form a recursive
/// auto-trait cycle (send_message → close → stream send → send_message).
fn spawn_force_close(core: Arc<TransportCore>) {
    tokio::spawn(async move { core.close("unrecoverable send error").await });
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("info", &self.core.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}
