// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: Defines the HTTP and WebSocket API contract for detkit.
//!
//! All payloads are JSON. Field names follow the browser conventions the clients
//! already speak: session descriptions and ICE candidates keep their WebRTC names
//! (`sdpMid`, `sdpMLineIndex`) and client ids travel as `clientId`. Detection and
//! metrics payloads use snake_case, as defined in `detkit-core`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// Re-export types so client crates can use them
pub use detkit_core::metrics::{
    BandwidthStats, LatencyStats, MetricsSnapshot, RecentStats, SummaryStats,
};
pub use detkit_core::stats::Percentiles;
pub use detkit_core::types::{Detection, DetectionResult, FrameMetricRecord};

// --- Deployment Mode ---

/// Where detection runs.
///
/// The wire names are kept for client compatibility: `wasm` means detection runs
/// next to the capture source, `server` means frames are streamed to this node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, TS)]
#[ts(export)]
pub enum Mode {
    /// Detection runs in the capturing client.
    #[default]
    #[serde(rename = "wasm")]
    Local,
    /// Frames are streamed over a peer connection and detected here.
    #[serde(rename = "server")]
    Remote,
}

impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "wasm",
            Self::Remote => "server",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- WebRTC Payloads ---

/// Kind of a session description, as in the browser's `RTCSdpType`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP offer or answer. The SDP text is passed through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// An ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

// --- HTTP Bodies ---

/// `POST /api/webrtc/offer`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub offer: SessionDescription,
    pub client_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct OfferResponse {
    pub answer: SessionDescription,
}

/// `POST /api/webrtc/ice-candidate`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub candidate: IceCandidateInit,
    pub client_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[ts(export)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub const OK: Self = Self { success: true };
}

/// Body of every non-2xx API response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct ErrorResponse {
    pub error: String,
}

/// `GET /api/health`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct HealthResponse {
    pub status: String,
    pub mode: Mode,
    /// RFC 3339 server time
    pub timestamp: String,
    /// Connected peer sessions
    pub clients: usize,
}

/// `GET /api/mode`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[ts(export)]
pub struct ModeResponse {
    pub mode: Mode,
}

/// `POST /api/metrics/frame`: a client-observed frame timing.
///
/// `displayed_at` defaults to the time the server receives the report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct FrameMetricReport {
    pub frame_id: u64,
    pub capture_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub recv_ts: Option<u64>,
    pub inference_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub displayed_at: Option<u64>,
}

impl FrameMetricReport {
    pub fn into_record(self, received_at: u64) -> FrameMetricRecord {
        FrameMetricRecord::from_timestamps(
            self.frame_id,
            self.capture_ts,
            self.recv_ts,
            self.inference_ts,
            self.displayed_at.unwrap_or(received_at),
        )
    }
}

/// `POST /api/metrics/bandwidth`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, TS)]
#[ts(export)]
pub struct BandwidthReport {
    pub uplink_kbps: f64,
    pub downlink_kbps: f64,
}

/// `POST /api/detect`: one RGB frame, base64 encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct DetectRequest {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub capture_ts: Option<u64>,
    /// Interleaved 8-bit RGB, `width * height * 3` bytes before encoding
    pub data: String,
}

// --- WebSocket Signaling ---

/// Messages a client sends over `/ws`.
///
/// `clientId` may be omitted on `offer` and `ice-candidate`; the socket's own id is
/// used instead.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Offer {
        offer: SessionDescription,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        client_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidateInit,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        client_id: Option<String>,
    },
    /// Requests a `metrics` reply with the current snapshot.
    GetMetrics,
    /// Subscribes this socket to a client's detection results.
    StartStream {
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        client_id: Option<String>,
    },
}

/// Messages the server sends over `/ws`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once after the socket opens.
    Welcome {
        #[serde(rename = "clientId")]
        client_id: String,
        mode: Mode,
    },
    Answer {
        #[serde(rename = "clientId")]
        client_id: String,
        answer: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "clientId")]
        client_id: String,
        candidate: IceCandidateInit,
    },
    DetectionResult {
        #[serde(rename = "clientId")]
        client_id: String,
        result: DetectionResult,
    },
    Metrics {
        metrics: MetricsSnapshot,
    },
    /// Confirms a `start-stream` subscription.
    StreamStarted {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Error {
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        client_id: Option<String>,
        message: String,
    },
}
