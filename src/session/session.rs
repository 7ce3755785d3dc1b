//! Perfect Negotiation driver for one peer connection

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReport;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::session::batcher::IceCandidateBatcher;
use crate::session::restart::{IceRestartTracker, RestartDecision};
use crate::signaling::{
    IceCandidate, IceCandidateBatch, MessagePayload, PeerInfo, Sdp, SdpKind, Signal, SignalData,
};
use crate::transport::{Stream, StreamEvent};
use crate::{Error, Result};

/// Events a session emits to its embedder.
pub enum SessionEvent {
    /// The remote opened a data channel.
    DataChannel(Arc<RTCDataChannel>),
    /// The remote added a media track.
    Track {
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
        transceiver: Arc<RTCRtpTransceiver>,
    },
    /// Native connection state, proxied 1:1 — plus a synthesized terminal
    /// `Closed` the native connection never fires on `close()`.
    ConnectionStateChange(RTCPeerConnectionState),
    /// The session is closed; no further events follow.
    Closed(String),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::DataChannel(_) => f.debug_tuple("DataChannel").finish(),
            SessionEvent::Track { .. } => f.debug_struct("Track").finish(),
            SessionEvent::ConnectionStateChange(state) => {
                f.debug_tuple("ConnectionStateChange").field(state).finish()
            }
            SessionEvent::Closed(reason) => f.debug_tuple("Closed").field(reason).finish(),
        }
    }
}

/// Internal nudges from the native callbacks into the driver task.
enum Command {
    NegotiationNeeded,
    ConnectionStateChanged(RTCPeerConnectionState),
    SignalingStateChanged(RTCSignalingState),
    TriggerIceRestart,
}

/// Drives exactly one peer connection to a stable media/data state, using
/// its [`Stream`] purely as the signaling carrier.
///
/// Implements the Perfect Negotiation pattern: a fixed polite/impolite
/// role per connection resolves simultaneous-offer races, a generation
/// counter discards signals from before the last ICE restart, and
/// candidates that arrive early are buffered and replayed once a remote
/// description exists.
///
/// The polite collision branch applies a remote offer while a local offer
/// may be outstanding; the underlying binding is required to roll the
/// local offer back implicitly in that case.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    stream: Stream,
    pc: Arc<RTCPeerConnection>,
    impolite: bool,
    cancel: CancellationToken,
    making_offer: AtomicBool,
    first_negotiation_done: AtomicBool,
    generation: AtomicU32,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    restart: Mutex<IceRestartTracker>,
    restart_timer: Mutex<Option<JoinHandle<()>>>,
    batcher: IceCandidateBatcher,
    connection_state: Mutex<RTCPeerConnectionState>,
    close_reason: Mutex<Option<String>>,
    closed: AtomicBool,
    commands_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

/// Higher value is impolite; a `conn_id` tie (degenerate but possible)
/// breaks on the lexicographically larger `peer_id`.
fn is_impolite(info: &PeerInfo, other: &PeerInfo) -> bool {
    if info.conn_id == other.conn_id {
        info.peer_id > other.peer_id
    } else {
        info.conn_id > other.conn_id
    }
}

impl Session {
    /// Build a session over `stream` and start its driver.
    ///
    /// Takes the stream's event receiver; the stream must not have another
    /// consumer.
    pub async fn new(stream: Stream, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let stream_events = stream.events()?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("failed to register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config.rtc_configuration())
                .await
                .map_err(|e| {
                    Error::PeerConnection(format!("failed to create peer connection: {}", e))
                })?,
        );

        let impolite = is_impolite(stream.info(), stream.other());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            stream: stream.clone(),
            pc,
            impolite,
            cancel: CancellationToken::new(),
            making_offer: AtomicBool::new(false),
            first_negotiation_done: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            pending_candidates: Mutex::new(Vec::new()),
            restart: Mutex::new(IceRestartTracker::new(
                config.restart_cooldown,
                config.restart_max_count,
            )),
            restart_timer: Mutex::new(None),
            batcher: IceCandidateBatcher::new(config.batch_delay, flush_tx),
            connection_state: Mutex::new(RTCPeerConnectionState::New),
            close_reason: Mutex::new(None),
            closed: AtomicBool::new(false),
            commands_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });

        inner.register_callbacks();
        debug!(
            other = %stream.other(),
            role = if impolite { "impolite" } else { "polite" },
            "session created"
        );

        {
            let inner = inner.clone();
            tokio::spawn(async move { inner.run(stream_events, commands_rx, flush_rx).await });
        }

        Ok(Self { inner })
    }

    /// The remote endpoint this session negotiates with.
    pub fn other(&self) -> PeerInfo {
        self.inner.stream.other().clone()
    }

    /// Whether this side holds the impolite role.
    pub fn is_impolite(&self) -> bool {
        self.inner.impolite
    }

    /// Current signal epoch; increments on every ICE restart.
    pub fn generation_counter(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Current state of the underlying peer connection.
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.inner.pc.connection_state()
    }

    /// Why the session closed, when it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// Take the event receiver. Yields `Err` on the second call.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        self.inner.events_rx.lock().take().ok_or_else(|| {
            Error::InvalidState("session event receiver already taken".to_string())
        })
    }

    /// Add a media track to the connection.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>> {
        self.inner
            .pc
            .add_track(track)
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to add track: {}", e)))
    }

    /// Remove a previously added track.
    pub async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<()> {
        self.inner
            .pc
            .remove_track(sender)
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to remove track: {}", e)))
    }

    /// Create a data channel through the connection.
    pub async fn create_data_channel(
        &self,
        label: &str,
        init: Option<RTCDataChannelInit>,
    ) -> Result<Arc<RTCDataChannel>> {
        self.inner
            .pc
            .create_data_channel(label, init)
            .await
            .map_err(|e| Error::PeerConnection(format!("failed to create data channel: {}", e)))
    }

    /// Statistics of the underlying connection.
    pub async fn get_stats(&self) -> StatsReport {
        self.inner.pc.get_stats().await
    }

    /// Close the session, its stream, and the native connection.
    /// Idempotent.
    pub async fn close(&self, reason: Option<&str>) {
        self.inner
            .close_with(reason.unwrap_or("session is closed"))
            .await;
    }
}

impl SessionInner {
    /// Native callbacks only forward into channels; everything stateful
    /// runs on the driver task.
    fn register_callbacks(&self) {
        let commands = self.commands_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let commands = commands.clone();
                Box::pin(async move {
                    let _ = commands.send(Command::ConnectionStateChanged(state));
                })
            }));

        let commands = self.commands_tx.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let commands = commands.clone();
            Box::pin(async move {
                let _ = commands.send(Command::NegotiationNeeded);
            })
        }));

        let commands = self.commands_tx.clone();
        self.pc.on_signaling_state_change(Box::new(move |state| {
            let commands = commands.clone();
            Box::pin(async move {
                let _ = commands.send(Command::SignalingStateChanged(state));
            })
        }));

        let batcher = self.batcher.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let batcher = batcher.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match IceCandidate::from_native(&candidate) {
                        Ok(ice) => batcher.add_candidate(Some(ice)),
                        Err(err) => warn!(error = %err, "failed to convert local candidate"),
                    },
                    None => batcher.add_candidate(None),
                }
            })
        }));

        let events = self.events_tx.clone();
        self.pc.on_data_channel(Box::new(move |channel| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(SessionEvent::DataChannel(channel));
            })
        }));

        let events = self.events_tx.clone();
        self.pc
            .on_track(Box::new(move |track, receiver, transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(SessionEvent::Track {
                        track,
                        receiver,
                        transceiver,
                    });
                })
            }));

        self.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                Box::pin(async move {
                    debug!(?state, "ice connection state changed");
                })
            }));
    }

    /// Driver loop. All negotiation steps run here sequentially, so no two
    /// SDP operations of this session ever interleave.
    async fn run(
        self: Arc<Self>,
        mut stream_events: mpsc::UnboundedReceiver<StreamEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut flushes: mpsc::UnboundedReceiver<Vec<IceCandidate>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = stream_events.recv() => match event {
                    Some(StreamEvent::Signal(signal)) => self.handle_signal(signal).await,
                    Some(StreamEvent::Closed(reason)) => {
                        self.close_with(&reason).await;
                        break;
                    }
                    None => {
                        self.close_with("stream event channel closed").await;
                        break;
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(batch) = flushes.recv() => self.send_candidate_batch(batch).await,
            }
        }
        debug!("session driver stopped");
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::NegotiationNeeded => self.negotiate().await,
            Command::ConnectionStateChanged(state) => self.handle_connection_state(state).await,
            Command::SignalingStateChanged(state) => {
                debug!(?state, "signaling state changed");
                self.apply_pending_candidates().await;
            }
            Command::TriggerIceRestart => self.trigger_ice_restart().await,
        }
    }

    async fn handle_connection_state(&self, state: RTCPeerConnectionState) {
        debug!(?state, "connection state changed");
        self.set_connection_state(state);
        match state {
            RTCPeerConnectionState::Connected => {
                self.restart.lock().reset();
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                self.trigger_ice_restart().await;
            }
            _ => {}
        }
    }

    fn set_connection_state(&self, state: RTCPeerConnectionState) {
        let mut current = self.connection_state.lock();
        if *current == state {
            return;
        }
        *current = state;
        let _ = self
            .events_tx
            .send(SessionEvent::ConnectionStateChange(state));
    }

    async fn negotiate(&self) {
        if !self.first_negotiation_done.swap(true, Ordering::SeqCst) && !self.impolite {
            // the impolite side owns the very first offer; opening with a
            // join nudges it into negotiating without risking glare
            if let Err(err) = self.stream.send(MessagePayload::Join, true).await {
                warn!(error = %err, "failed to send initial join");
            }
            return;
        }

        debug!("creating an offer");
        self.making_offer.store(true, Ordering::SeqCst);
        let result = self.send_local_offer(None).await;
        self.making_offer.store(false, Ordering::SeqCst);

        if let Err(err) = result {
            // the connection stays usable; the next negotiation trigger
            // starts over
            error!(error = %err, "negotiation failed");
        }
    }

    async fn send_local_offer(&self, options: Option<RTCOfferOptions>) -> Result<()> {
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| Error::Sdp(format!("failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description after offer".to_string()))?;

        self.send_signal(SignalData::Sdp(Sdp::from_native(&local)?)).await
    }

    async fn send_local_answer(&self) -> Result<()> {
        debug!("creating an answer");
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description after answer".to_string()))?;

        self.send_signal(SignalData::Sdp(Sdp::from_native(&local)?)).await
    }

    async fn send_signal(&self, data: SignalData) -> Result<()> {
        let signal = Signal {
            generation_counter: self.generation.load(Ordering::SeqCst),
            data,
        };
        self.stream
            .send(MessagePayload::Signal(signal), true)
            .await
    }

    async fn send_candidate_batch(&self, candidates: Vec<IceCandidate>) {
        let result = self
            .send_signal(SignalData::IceCandidateBatch(IceCandidateBatch {
                candidates,
            }))
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to send candidate batch");
        }
    }

    async fn handle_signal(&self, signal: Signal) {
        let current = self.generation.load(Ordering::SeqCst);
        if signal.generation_counter < current {
            warn!(
                theirs = signal.generation_counter,
                ours = current,
                "stale generation signal, ignoring"
            );
            return;
        }

        let ahead = signal.generation_counter > current;
        if self.buffer_candidates(&signal) {
            if ahead {
                // nothing to apply them to until the new epoch's offer
                // arrives; they stay in the pending buffer
                warn!(
                    theirs = signal.generation_counter,
                    ours = current,
                    "candidates ahead of the current generation, holding"
                );
                return;
            }
            self.apply_pending_candidates().await;
        }

        if ahead {
            debug!(
                theirs = signal.generation_counter,
                ours = current,
                "resynchronizing generation counter"
            );
            self.generation
                .store(signal.generation_counter, Ordering::SeqCst);
        }

        let SignalData::Sdp(sdp) = signal.data else {
            return;
        };
        debug!(kind = ?sdp.kind, "received sdp signal");

        let offer_collision = sdp.kind == SdpKind::Offer
            && (self.making_offer.load(Ordering::SeqCst)
                || self.pc.signaling_state() != RTCSignalingState::Stable);
        if self.impolite && offer_collision {
            debug!("ignoring colliding offer");
            return;
        }

        // polite branch of a collision: applying the remote offer relies
        // on the binding rolling back our uncommitted local offer
        let desc = match sdp.to_native() {
            Ok(desc) => desc,
            Err(err) => {
                error!(error = %err, "unusable sdp signal");
                return;
            }
        };
        if let Err(err) = self.pc.set_remote_description(desc).await {
            error!(error = %err, "failed to apply remote description");
            return;
        }

        if sdp.kind == SdpKind::Offer {
            if let Err(err) = self.send_local_answer().await {
                error!(error = %err, "failed to answer offer");
            }
        }

        self.apply_pending_candidates().await;
    }

    /// Stash any candidates the signal carries. Returns whether it did.
    fn buffer_candidates(&self, signal: &Signal) -> bool {
        let candidates: Vec<RTCIceCandidateInit> = match &signal.data {
            SignalData::IceCandidate(candidate) => vec![candidate.to_native()],
            SignalData::IceCandidateBatch(batch) => {
                batch.candidates.iter().map(IceCandidate::to_native).collect()
            }
            SignalData::Sdp(_) => return false,
        };
        self.pending_candidates.lock().extend(candidates);
        true
    }

    async fn apply_pending_candidates(&self) {
        let state = self.pc.signaling_state();
        let ready = matches!(
            state,
            RTCSignalingState::Stable
                | RTCSignalingState::HaveLocalOffer
                | RTCSignalingState::HaveRemoteOffer
        );
        if !ready || self.pc.remote_description().await.is_none() {
            debug!(
                signaling_state = ?state,
                pending = self.pending_candidates.lock().len(),
                "not ready for candidates, holding"
            );
            return;
        }

        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if candidate.candidate.is_empty() {
                continue;
            }
            // a dropped candidate costs connectivity robustness, not
            // correctness; ICE has more where it came from
            if let Err(err) = self.pc.add_ice_candidate(candidate.clone()).await {
                warn!(
                    candidate = %candidate.candidate,
                    error = %err,
                    "failed to add ice candidate, skipping"
                );
            }
        }
    }

    async fn trigger_ice_restart(&self) {
        // the impolite peer's restart offer makes the polite peer follow
        if !self.impolite {
            return;
        }

        let decision = self.restart.lock().check(Instant::now());
        match decision {
            RestartDecision::Deferred(delay) => self.schedule_restart(delay),
            RestartDecision::GiveUp => {
                self.close_with("detected sustained network failure").await;
            }
            RestartDecision::Restart => {
                if self.pc.connection_state() == RTCPeerConnectionState::Connected {
                    return;
                }

                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.restart.lock().record(Instant::now());
                debug!(generation, "triggering ice restart");

                self.making_offer.store(true, Ordering::SeqCst);
                let result = self
                    .send_local_offer(Some(RTCOfferOptions {
                        ice_restart: true,
                        ..Default::default()
                    }))
                    .await;
                self.making_offer.store(false, Ordering::SeqCst);
                if let Err(err) = result {
                    error!(error = %err, "ice restart failed");
                }
            }
        }
    }

    fn schedule_restart(&self, delay: Duration) {
        let mut timer = self.restart_timer.lock();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let commands = self.commands_tx.clone();
        let cancel = self.cancel.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::TriggerIceRestart);
                }
            }
        }));
    }

    async fn close_with(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(timer) = self.restart_timer.lock().take() {
            timer.abort();
        }
        self.batcher.close();
        *self.close_reason.lock() = Some(reason.to_string());

        self.stream.close(Some(reason)).await;
        if let Err(err) = self.pc.close().await {
            warn!(error = %err, "failed to close peer connection");
        }

        // the native connection never reports `closed` after close();
        // synthesize the terminal state change
        self.set_connection_state(RTCPeerConnectionState::Closed);
        let _ = self.events_tx.send(SessionEvent::Closed(reason.to_string()));
        debug!(reason, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("other", &self.inner.stream.other())
            .field("impolite", &self.inner.impolite)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(peer_id: &str, conn_id: u32) -> PeerInfo {
        PeerInfo {
            group_id: "g".to_string(),
            peer_id: peer_id.to_string(),
            conn_id,
        }
    }

    #[test]
    fn test_exactly_one_side_is_impolite() {
        let pairs = [
            (peer("a", 100), peer("b", 200)),
            (peer("a", 4000), peer("b", 17)),
            (peer("alice", 42), peer("bob", 42)),
            (peer("zed", 42), peer("bob", 42)),
        ];
        for (a, b) in pairs {
            assert_ne!(
                is_impolite(&a, &b),
                is_impolite(&b, &a),
                "exactly one of {a}/{b} must be impolite"
            );
        }
    }

    #[test]
    fn test_larger_conn_id_is_impolite() {
        assert!(is_impolite(&peer("a", 200), &peer("b", 100)));
        assert!(!is_impolite(&peer("a", 100), &peer("b", 200)));
    }

    #[test]
    fn test_conn_id_tie_breaks_on_peer_id() {
        assert!(is_impolite(&peer("zed", 42), &peer("bob", 42)));
        assert!(!is_impolite(&peer("bob", 42), &peer("zed", 42)));
    }
}
