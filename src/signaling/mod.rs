//! Signaling protocol model and the relay RPC boundary

mod protocol;
mod rpc;

pub use protocol::{
    Ack, AckRange, IceCandidate, IceCandidateBatch, IceServer, Message, MessageHeader,
    MessagePayload, PeerInfo, Sdp, SdpKind, Signal, SignalData,
};
pub use rpc::{MessageStream, RpcOptions, SignalingRpc};
