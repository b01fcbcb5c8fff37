//! Peer-connection construction and ICE bookkeeping.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signaling::CandidatePayload;

/// Public STUN endpoints every peer connection is configured with.
pub const STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc setup failed: {0}")]
    Setup(#[from] webrtc::Error),
}

pub async fn build_peer_connection() -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = InterceptorRegistry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: STUN_SERVERS.iter().map(|url| url.to_string()).collect(),
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

pub fn candidate_init(payload: &CandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: payload.candidate.clone(),
        sdp_mid: payload.sdp_mid.clone(),
        sdp_mline_index: payload.sdp_mline_index,
        username_fragment: None,
    }
}

/// Hands one remote candidate to the peer connection. Failures are logged;
/// a bad candidate never takes the session down.
pub async fn apply_candidate(pc: &Arc<RTCPeerConnection>, payload: &CandidatePayload) {
    if let Err(err) = pc.add_ice_candidate(candidate_init(payload)).await {
        warn!(
            target: "peer",
            error = %err,
            candidate = %payload.candidate,
            "failed to add remote ice candidate"
        );
    }
}

/// Candidates that arrived before the remote description. Flushed in FIFO
/// order once the description is applied.
#[derive(Debug, Default)]
pub struct PendingIce {
    queue: Vec<CandidatePayload>,
}

impl PendingIce {
    pub fn push(&mut self, candidate: CandidatePayload) {
        self.queue.push(candidate);
    }

    pub fn drain(&mut self) -> Vec<CandidatePayload> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
