//! Signaling protocol types exchanged through the relay
//!
//! These mirror the relay's wire schema. Payload and signal bodies are
//! tagged sum types so dispatch is an exhaustive `match` instead of a kind
//! string; an unhandled variant is a compile error.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{Error, Result};

/// Identity of one logical endpoint instance.
///
/// `conn_id` disambiguates repeated connection attempts from the same
/// `peer_id` (a process restart draws a new one). It is compared, never
/// trusted as a secret. Immutable for the lifetime of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub group_id: String,
    pub peer_id: String,
    pub conn_id: u32,
}

impl PeerInfo {
    /// Rendezvous address for `join` messages; never a live connection.
    pub const DISCOVERY_CONN_ID: u32 = 0;

    /// Connection ids below this value are reserved and never drawn.
    pub const RESERVED_CONN_ID_MAX: u32 = 16;

    /// Whether two infos name the same `(group, peer)` endpoint, ignoring
    /// the connection instance.
    pub fn same_endpoint(&self, other: &PeerInfo) -> bool {
        self.group_id == other.group_id && self.peer_id == other.peer_id
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.group_id, self.peer_id, self.conn_id)
    }
}

/// Routing header of a multiplexed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub src: PeerInfo,
    pub dst: PeerInfo,
    /// Assigned monotonically by the sender starting at 0. The receiver
    /// uses it as a dedup key for reliable messages only.
    pub seqnum: u32,
    pub reliable: bool,
}

/// The wire unit of the signaling RPC.
///
/// A message without a header is a control message addressed to the
/// transport itself, not to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<MessageHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
}

/// Payload of a [`Message`]; exactly one case per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// SDP/ICE envelope for a session.
    Signal(Signal),
    /// Rendezvous marker; its only effect is stream creation on the remote.
    Join,
    /// Graceful close of a stream.
    Bye,
    /// Receipt ranges. Reserved on the wire; the transport neither
    /// produces nor consumes acks today.
    Ack(Ack),
    /// Relay liveness probe (control message).
    Ping,
}

/// Acknowledged sequence number ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack_ranges: Vec<AckRange>,
}

/// Inclusive range of acknowledged sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRange {
    pub seqnum_start: u32,
    pub seqnum_end: u32,
}

/// SDP/ICE envelope.
///
/// The generation counter partitions signals into epochs; it increments on
/// every ICE restart so stale offers and candidates from a prior epoch are
/// distinguishable from current ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub generation_counter: u32,
    pub data: SignalData,
}

/// Body of a [`Signal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalData {
    Sdp(Sdp),
    IceCandidate(IceCandidate),
    IceCandidateBatch(IceCandidateBatch),
}

impl SignalData {
    /// Whether this signal carries candidates only (no description).
    pub fn is_candidate(&self) -> bool {
        matches!(
            self,
            SignalData::IceCandidate(_) | SignalData::IceCandidateBatch(_)
        )
    }
}

/// A session description with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    pub kind: SdpKind,
    pub sdp: String,
}

impl Sdp {
    /// Convert into the native description type.
    ///
    /// Rollback has no native constructor; a received rollback surfaces as
    /// an error which the session treats as a failed negotiation attempt.
    pub fn to_native(&self) -> Result<RTCSessionDescription> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SdpKind::Rollback => {
                return Err(Error::Sdp(
                    "rollback descriptions cannot be constructed natively".to_string(),
                ))
            }
        };
        desc.map_err(|e| Error::Sdp(format!("failed to parse {:?} sdp: {}", self.kind, e)))
    }

    /// Build from a native local description.
    pub fn from_native(desc: &RTCSessionDescription) -> Result<Self> {
        Ok(Self {
            kind: SdpKind::from_native(desc.sdp_type)?,
            sdp: desc.sdp.clone(),
        })
    }
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    /// Map from the native SDP type.
    pub fn from_native(t: RTCSdpType) -> Result<Self> {
        match t {
            RTCSdpType::Offer => Ok(SdpKind::Offer),
            RTCSdpType::Answer => Ok(SdpKind::Answer),
            RTCSdpType::Pranswer => Ok(SdpKind::Pranswer),
            RTCSdpType::Rollback => Ok(SdpKind::Rollback),
            other => Err(Error::Sdp(format!("unexpected sdp type: {:?}", other))),
        }
    }
}

/// One trickled ICE candidate.
///
/// `password` maps to the native candidate's `username_fragment`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl IceCandidate {
    /// Convert into the native candidate init.
    pub fn to_native(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_m_line_index,
            username_fragment: self.password.clone(),
        }
    }

    /// Build from a locally gathered native candidate.
    pub fn from_native(candidate: &RTCIceCandidate) -> Result<Self> {
        let json = candidate
            .to_json()
            .map_err(|e| Error::IceCandidate(format!("failed to serialize candidate: {}", e)))?;
        Ok(Self {
            candidate: json.candidate,
            sdp_m_line_index: json.sdp_mline_index,
            sdp_mid: json.sdp_mid,
            username: None,
            password: json.username_fragment,
        })
    }
}

/// A batch of candidates coalesced into one signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateBatch {
    pub candidates: Vec<IceCandidate>,
}

/// One entry of the relay's `Prepare()` result, consumed as an ICE server
/// for the peer connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
