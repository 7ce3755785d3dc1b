//! Configuration for the transport and session layers

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::signaling::IceServer;
use crate::{Error, Result};

/// Classifies an error as recoverable (keep retrying) or fatal.
pub type RecoverablePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Options for building a [`Transport`](crate::Transport).
#[derive(Clone)]
pub struct TransportOptions {
    /// Group this peer belongs to; messages never cross groups.
    pub group_id: String,

    /// Stable identity of this peer within the group.
    pub peer_id: String,

    /// Explicit connection id. Drawn at random above the reserved range
    /// when unset; tests pin it to control role assignment.
    pub conn_id: Option<u32>,

    /// Upper bound on one long-poll receive call (default: 15 minutes).
    pub poll_timeout: Duration,

    /// Initial backoff delay for RPC retries (default: 50ms).
    pub retry_base_delay: Duration,

    /// Backoff cap for RPC retries (default: 1s).
    pub retry_max_delay: Duration,

    /// Delay between `join` attempts during rendezvous (default: 1s).
    pub join_retry_delay: Duration,

    /// Cadence of the closed-stream collector (default: 1s).
    pub stream_gc_interval: Duration,

    /// How long a closed stream keeps absorbing late messages before it is
    /// collected (default: 10s). Long enough to avoid a collision with the
    /// remote's in-flight traffic, short enough to allow quick reconnects.
    pub stream_gc_grace: Duration,

    /// Error classifier for the retry layer. Defaults to
    /// [`Error::is_retryable`].
    pub recoverable: Option<RecoverablePredicate>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            peer_id: String::new(),
            conn_id: None,
            poll_timeout: Duration::from_secs(900),
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            join_retry_delay: Duration::from_secs(1),
            stream_gc_interval: Duration::from_secs(1),
            stream_gc_grace: Duration::from_secs(10),
            recoverable: None,
        }
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("group_id", &self.group_id)
            .field("peer_id", &self.peer_id)
            .field("conn_id", &self.conn_id)
            .field("poll_timeout", &self.poll_timeout)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("join_retry_delay", &self.join_retry_delay)
            .field("stream_gc_interval", &self.stream_gc_interval)
            .field("stream_gc_grace", &self.stream_gc_grace)
            .field("recoverable", &self.recoverable.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl TransportOptions {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if `group_id` or `peer_id` is empty, or if an
    /// explicit `conn_id` falls into the reserved range.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::InvalidConfig("group_id must not be empty".to_string()));
        }
        if self.peer_id.is_empty() {
            return Err(Error::InvalidConfig("peer_id must not be empty".to_string()));
        }
        if let Some(conn_id) = self.conn_id {
            if conn_id < crate::signaling::PeerInfo::RESERVED_CONN_ID_MAX {
                return Err(Error::InvalidConfig(format!(
                    "conn_id {} is in the reserved range",
                    conn_id
                )));
            }
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::InvalidConfig(
                "retry_base_delay must not exceed retry_max_delay".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn recoverable_predicate(&self) -> RecoverablePredicate {
        self.recoverable
            .clone()
            .unwrap_or_else(|| Arc::new(Error::is_retryable))
    }
}

/// Options for building a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICE servers from the relay's `Prepare()` call.
    pub ice_servers: Vec<IceServer>,

    /// Quiet period before locally gathered candidates flush as one batch
    /// (default: 100ms).
    pub batch_delay: Duration,

    /// Minimum spacing between ICE restart attempts (default: 5s).
    pub restart_cooldown: Duration,

    /// ICE restarts attempted before the session gives up and closes
    /// (default: 2).
    pub restart_max_count: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            batch_delay: Duration::from_millis(100),
            restart_cooldown: Duration::from_secs(5),
            restart_max_count: 2,
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.batch_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "batch_delay must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the native peer connection configuration.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
