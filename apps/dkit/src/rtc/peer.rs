// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use detkit_api::{IceCandidateInit, SdpType, SessionDescription};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::track::RtpVideoTrack;
use crate::transport::{PeerConnection, TransportError, TransportEvent, VideoTrack};

/// Upper bound on waiting for local candidates before answering. Clients that only
/// use HTTP signaling never see trickled candidates, so the answer carries them.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(2);

/// A webrtc-rs peer connection behind the gateway's [`PeerConnection`] seam.
pub struct RtcPeer {
    client_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer").field("client_id", &self.client_id).finish_non_exhaustive()
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: &IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

impl RtcPeer {
    /// Wraps `pc` and routes its callbacks to `events`.
    pub(super) fn attach(
        client_id: &str,
        pc: Arc<RTCPeerConnection>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = TransportEvent::LocalCandidate(from_rtc_candidate(init));
                        let _ = events.send(event).await;
                    },
                    Err(e) => tracing::debug!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        let state_client = client_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let client_id = state_client.clone();
            Box::pin(async move {
                tracing::debug!(%client_id, ?state, "Peer connection state changed");
                // `Disconnected` can recover on its own; only terminal states end the session.
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                    let _ = events.send(TransportEvent::Disconnected).await;
                }
            })
        }));

        let track_client = client_id.to_string();
        let weak_pc = Arc::downgrade(&pc);
        pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let client_id = track_client.clone();
                let pc = weak_pc.clone();
                Box::pin(async move {
                    if remote.kind() != RTPCodecType::Video {
                        tracing::debug!(%client_id, kind = ?remote.kind(), "Ignoring non-video track");
                        return;
                    }
                    let track = RtpVideoTrack::spawn(remote, pc, &client_id);
                    tracing::info!(%client_id, track_id = %track.id(), "Receiving video track");
                    let _ = events.send(TransportEvent::Track(track)).await;
                })
            },
        ));

        Self { client_id: client_id.to_string(), pc }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn set_remote_description(
        &self,
        offer: &SessionDescription,
    ) -> Result<(), TransportError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(TransportError::InvalidDescription(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        let description = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Media(format!("Failed to create answer: {e}")))?;

        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Media(format!("Failed to apply answer: {e}")))?;
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            tracing::debug!(
                client_id = %self.client_id,
                "ICE gathering still running, answering with the candidates found so far"
            );
        }

        let local = self.pc.local_description().await.ok_or(TransportError::Closed)?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(client_id = %self.client_id, error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_fields_carry_over() {
        let ours = IceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.100 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let theirs = to_rtc_candidate(&ours);
        assert_eq!(theirs.sdp_mline_index, Some(0));
        assert_eq!(from_rtc_candidate(theirs), ours);
    }
}
