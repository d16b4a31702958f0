//! webrtc plumbing: peer connection construction and event wiring.
//!
//! Everything the underlying library reports through callbacks is funneled
//! into the owning peer task's command channel as [`RtcEvent`]s, so the
//! task remains the only writer of per-peer state. Callback bodies never
//! block: they clone a sender and return.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use clouddrop_core::protocol::IceServerEntry;
use clouddrop_core::{Error, Result};

/// Label of the single ordered data channel per peer pair.
const DATA_CHANNEL_LABEL: &str = "clouddrop";

/// Events funneled from webrtc callbacks into the peer task.
pub enum RtcEvent {
    /// A local candidate was gathered (already JSON-shaped for signaling).
    CandidateGathered(RTCIceCandidateInit),
    /// Local gathering finished.
    GatheringComplete,
    /// The data channel reached the open state.
    ChannelOpen(Arc<RTCDataChannel>),
    /// A JSON control frame arrived on the data channel.
    ChannelText(String),
    /// A binary (encrypted chunk) frame arrived on the data channel.
    ChannelBinary(Bytes),
    /// The data channel closed.
    ChannelClosed,
    /// ICE connection state moved.
    IceState(RTCIceConnectionState),
}

impl std::fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CandidateGathered(init) => f.debug_tuple("CandidateGathered").field(init).finish(),
            Self::GatheringComplete => write!(f, "GatheringComplete"),
            Self::ChannelOpen(_) => write!(f, "ChannelOpen(..)"),
            Self::ChannelText(text) => f.debug_tuple("ChannelText").field(text).finish(),
            Self::ChannelBinary(bytes) => f.debug_tuple("ChannelBinary").field(bytes).finish(),
            Self::ChannelClosed => write!(f, "ChannelClosed"),
            Self::IceState(state) => f.debug_tuple("IceState").field(state).finish(),
        }
    }
}

/// Build the webrtc API object.
pub fn build_api() -> Result<API> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Default::default(), &mut media)
        .map_err(|e| Error::transport(format!("interceptor registry: {e}")))?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// Create a peer connection with all callbacks wired to `events`.
pub async fn new_peer_connection(
    ice_servers: Vec<RTCIceServer>,
    events: mpsc::UnboundedSender<RtcEvent>,
) -> Result<Arc<RTCPeerConnection>> {
    let api = build_api()?;
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|e| Error::transport(format!("peer connection: {e}")))?;
    let pc = Arc::new(pc);

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(RtcEvent::CandidateGathered(init));
                    }
                    Err(e) => warn!("candidate serialization failed: {e}"),
                },
                None => {
                    let _ = tx.send(RtcEvent::GatheringComplete);
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(RtcEvent::IceState(state));
        })
    }));

    // The answering side receives the channel instead of creating it.
    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(label = dc.label(), "remote data channel announced");
            attach_channel_handlers(&dc, tx);
        })
    }));

    Ok(pc)
}

/// Create the ordered data channel (offering side).
pub async fn create_data_channel(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<RtcEvent>,
) -> Result<Arc<RTCDataChannel>> {
    let dc = pc
        .create_data_channel(
            DATA_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| Error::transport(format!("data channel: {e}")))?;
    attach_channel_handlers(&dc, events);
    Ok(dc)
}

/// Wire open/message/close handlers of one data channel into `events`.
pub fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<RtcEvent>) {
    let tx = events.clone();
    let dc_for_open = Arc::clone(dc);
    dc.on_open(Box::new(move || {
        let _ = tx.send(RtcEvent::ChannelOpen(dc_for_open));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let event = if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => RtcEvent::ChannelText(text),
                Err(_) => {
                    warn!("dropping non-UTF-8 text frame");
                    return Box::pin(async {});
                }
            }
        } else {
            RtcEvent::ChannelBinary(msg.data)
        };
        let _ = tx.send(event);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(RtcEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

/// Roll back a pending local offer (polite side of a collision).
pub async fn rollback_local_description(pc: &Arc<RTCPeerConnection>) -> Result<()> {
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    pc.set_local_description(rollback)
        .await
        .map_err(|e| Error::transport(format!("rollback: {e}")))
}

/// Convert configured ICE server entries into the webrtc form.
pub fn to_rtc_ice_servers(entries: &[IceServerEntry]) -> Vec<RTCIceServer> {
    entries
        .iter()
        .map(|entry| RTCIceServer {
            urls: entry.urls.clone(),
            username: entry.username.clone().unwrap_or_default(),
            credential: entry.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Whether any URL of this entry is a TURN allocation.
pub fn is_turn_entry(entry: &IceServerEntry) -> bool {
    entry
        .urls
        .iter()
        .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(urls: &[&str]) -> IceServerEntry {
        IceServerEntry {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn turn_detection() {
        assert!(is_turn_entry(&entry(&["turn:relay.example:3478"])));
        assert!(is_turn_entry(&entry(&[
            "stun:stun.example",
            "turns:relay.example"
        ])));
        assert!(!is_turn_entry(&entry(&["stun:stun.example:19302"])));
    }

    #[test]
    fn ice_server_conversion_fills_credentials() {
        let mut e = entry(&["turn:relay.example"]);
        e.username = Some("user".into());
        e.credential = Some("pass".into());
        let servers = to_rtc_ice_servers(&[e]);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "pass");
    }
}
