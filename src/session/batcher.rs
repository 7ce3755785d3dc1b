//! ICE candidate batching

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::signaling::IceCandidate;

/// Coalesces locally gathered candidates to reduce signaling chatter.
///
/// Each candidate (re)arms a quiet-period timer, so a burst flushes as one
/// batch once the burst settles; gathering completion flushes immediately.
#[derive(Clone)]
pub(crate) struct IceCandidateBatcher {
    delay: Duration,
    state: Arc<Mutex<BatchState>>,
    flush_tx: mpsc::UnboundedSender<Vec<IceCandidate>>,
}

#[derive(Default)]
struct BatchState {
    candidates: Vec<IceCandidate>,
    timer: Option<JoinHandle<()>>,
}

impl IceCandidateBatcher {
    pub fn new(delay: Duration, flush_tx: mpsc::UnboundedSender<Vec<IceCandidate>>) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(BatchState::default())),
            flush_tx,
        }
    }

    /// Buffer one candidate and defer the flush by the quiet period.
    /// `None` (or an empty candidate string) means gathering finished for
    /// this negotiation round: flush immediately.
    pub fn add_candidate(&self, candidate: Option<IceCandidate>) {
        match candidate {
            Some(candidate) if !candidate.candidate.is_empty() => {
                let mut state = self.state.lock();
                state.candidates.push(candidate);

                // each new candidate within the window defers the flush
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let this = self.clone();
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(this.delay).await;
                    this.flush_pending();
                }));
            }
            _ => {
                debug!("ice gathering finished, flushing local candidates");
                self.flush();
            }
        }
    }

    /// Emit the buffered batch now, cancelling any pending timer.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        self.flush_pending();
    }

    fn flush_pending(&self) {
        let batch = {
            let mut state = self.state.lock();
            state.timer = None;
            std::mem::take(&mut state.candidates)
        };
        if !batch.is_empty() {
            let _ = self.flush_tx.send(batch);
        }
    }

    /// Cancel any pending timer without flushing. Used on session teardown.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}
