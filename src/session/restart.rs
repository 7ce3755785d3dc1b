//! ICE-restart pacing

use std::time::{Duration, Instant};

/// What to do with an ICE-restart trigger right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// Proceed with a restart.
    Restart,
    /// Inside the cooldown window; retry after the remaining delay.
    Deferred(Duration),
    /// Restart budget exhausted; the session should close.
    GiveUp,
}

/// Debounces and bounds ICE restarts for one session.
///
/// Triggers inside the cooldown window are deferred to the window
/// boundary. The attempt budget only refills when the connection reaches
/// `connected` again.
#[derive(Debug)]
pub(crate) struct IceRestartTracker {
    cooldown: Duration,
    max_count: u32,
    count: u32,
    last: Option<Instant>,
}

impl IceRestartTracker {
    pub fn new(cooldown: Duration, max_count: u32) -> Self {
        Self {
            cooldown,
            max_count,
            count: 0,
            last: None,
        }
    }

    /// Classify a trigger at `now`. Does not commit to anything; call
    /// [`record`](Self::record) once the restart is actually issued.
    pub fn check(&self, now: Instant) -> RestartDecision {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                return RestartDecision::Deferred(self.cooldown - elapsed);
            }
        }
        if self.count >= self.max_count {
            return RestartDecision::GiveUp;
        }
        RestartDecision::Restart
    }

    /// Account for an issued restart.
    pub fn record(&mut self, now: Instant) {
        self.count += 1;
        self.last = Some(now);
    }

    /// The connection recovered; future failures get a fresh budget.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
