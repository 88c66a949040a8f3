// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! WebRTC media transport built on webrtc-rs.
//!
//! ```text
//! Browser <---- SDP / ICE ----> PeerGateway
//!    |                               |
//!    | H.264 over RTP         RtcConnector::connect
//!    v                               |
//! RTCPeerConnection <---------- RtcPeer (callbacks -> TransportEvent)
//!    | on_track
//!    v
//! RtpVideoTrack (depacketize -> OpenH264 -> RGB)
//!    | snapshot()
//!    v
//! frame bridge
//! ```
//!
//! Only H.264 is offered in answers, since that is what the bundled decoder reads.

mod peer;
mod track;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::transport::{
    PeerConfig, PeerConnection, TransportConnector, TransportError, TransportEvent,
};

pub use peer::RtcPeer;
pub use track::RtpVideoTrack;

const H264_CLOCK_RATE: u32 = 90_000;

/// Constrained baseline and baseline, packetization mode 1: the profiles browsers
/// offer by default that OpenH264 decodes.
const H264_PROFILES: [(u8, &str); 2] = [
    (102, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
    (127, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
];

fn h264_codecs() -> impl Iterator<Item = RTCRtpCodecParameters> {
    H264_PROFILES.into_iter().map(|(payload_type, fmtp)| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: H264_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: vec![
                RTCPFeedback { typ: "nack".to_owned(), parameter: String::new() },
                RTCPFeedback { typ: "nack".to_owned(), parameter: "pli".to_owned() },
                RTCPFeedback { typ: "ccm".to_owned(), parameter: "fir".to_owned() },
            ],
        },
        payload_type,
        ..Default::default()
    })
}

/// Builds a webrtc-rs API that negotiates H.264 video only.
fn build_api() -> Result<API, webrtc::Error> {
    let mut media = MediaEngine::default();
    for codec in h264_codecs() {
        media.register_codec(codec, RTPCodecType::Video)?;
    }
    let registry = register_default_interceptors(Registry::new(), &mut media)?;

    Ok(APIBuilder::new().with_media_engine(media).with_interceptor_registry(registry).build())
}

/// Creates one webrtc-rs peer connection per client.
pub struct RtcConnector {
    api: API,
}

impl std::fmt::Debug for RtcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnector").finish_non_exhaustive()
    }
}

impl RtcConnector {
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] if the media engine cannot be set up.
    pub fn new() -> Result<Self, TransportError> {
        let api = build_api().map_err(|e| {
            TransportError::Unavailable(format!("Failed to set up WebRTC media engine: {e}"))
        })?;
        Ok(Self { api })
    }
}

fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
    let ice_servers = if config.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer { urls: config.ice_servers.clone(), ..Default::default() }]
    };
    RTCConfiguration { ice_servers, ..Default::default() }
}

#[async_trait]
impl TransportConnector for RtcConnector {
    async fn connect(
        &self,
        client_id: &str,
        config: &PeerConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let pc = self.api.new_peer_connection(rtc_configuration(config)).await.map_err(|e| {
            TransportError::Media(format!("Failed to create peer connection: {e}"))
        })?;

        tracing::debug!(%client_id, ice_servers = config.ice_servers.len(), "Peer connection created");
        Ok(Box::new(RtcPeer::attach(client_id, Arc::new(pc), events)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use detkit_api::{SdpType, SessionDescription};
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

    /// Stands in for a browser: one send-only H.264 video section.
    async fn browser_offer() -> (webrtc::peer_connection::RTCPeerConnection, String) {
        let api = build_api().unwrap();
        let browser = api.new_peer_connection(RTCConfiguration::default()).await.unwrap();
        browser
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();
        (browser, offer.sdp)
    }

    #[test]
    fn test_ice_servers_share_one_entry() {
        let config = PeerConfig {
            ice_servers: vec!["stun:a.example:3478".to_string(), "stun:b.example:3478".to_string()],
        };
        let rtc = rtc_configuration(&config);
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls.len(), 2);

        assert!(rtc_configuration(&PeerConfig::default()).ice_servers.is_empty());
    }

    #[tokio::test]
    async fn test_answers_a_video_offer() {
        let connector = RtcConnector::new().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let peer = connector.connect("cam", &PeerConfig::default(), events_tx).await.unwrap();

        let (browser, offer_sdp) = browser_offer().await;
        peer.set_remote_description(&SessionDescription::offer(offer_sdp)).await.unwrap();
        let answer = peer.create_answer().await.unwrap();

        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answer.sdp.contains("m=video"));
        assert!(answer.sdp.contains("H264"));
        assert!(answer.sdp.contains("a=recvonly"));

        // The browser side accepts it.
        let answer = RTCSessionDescription::answer(answer.sdp).unwrap();
        browser.set_remote_description(answer).await.unwrap();

        peer.close().await;
        peer.close().await;
        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_offer_is_rejected() {
        let connector = RtcConnector::new().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let peer = connector.connect("cam", &PeerConfig::default(), events_tx).await.unwrap();

        let err = peer.set_remote_description(&SessionDescription::offer("v=0\r\n")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription(_)));

        let err = peer
            .set_remote_description(&SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription(_)));
        peer.close().await;
    }
}
