// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The seam between the peer gateway and a real-time media transport.
//!
//! The gateway drives negotiation through [`PeerConnection`] and learns about
//! asynchronous happenings (gathered local candidates, arriving tracks,
//! disconnects) as [`TransportEvent`]s on a channel it hands to the connector.
//! Frames are pulled from a [`VideoTrack`] by the bridge, never pushed.

use std::sync::Arc;

use async_trait::async_trait;
use detkit_api::{IceCandidateInit, SessionDescription};
use detkit_core::types::Frame;
use detkit_core::DetkitError;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("media transport error: {0}")]
    Media(String),
    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for DetkitError {
    fn from(err: TransportError) -> Self {
        Self::Negotiation(err.to_string())
    }
}

/// Per-session transport parameters.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// A live incoming video track.
pub trait VideoTrack: Send + Sync {
    fn id(&self) -> &str;

    /// `false` once the track has ended; it never becomes live again.
    fn is_live(&self) -> bool;

    /// The most recent decoded frame, if one has arrived yet.
    fn snapshot(&self) -> Option<Frame>;
}

impl std::fmt::Debug for dyn VideoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoTrack").field("id", &self.id()).field("live", &self.is_live()).finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to relay to the remote client.
    LocalCandidate(IceCandidateInit),
    /// The remote client started sending video.
    Track(Arc<dyn VideoTrack>),
    /// The connection failed or was closed by the remote side.
    Disconnected,
}

/// One transport session with a remote client.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, offer: &SessionDescription)
        -> Result<(), TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), TransportError>;

    /// Idempotent.
    async fn close(&self);
}

/// Creates peer connections. Events for the new connection are sent on `events`
/// until it is closed.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        client_id: &str,
        config: &PeerConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// Connector used when no media transport is compiled in. Every offer fails with a
/// negotiation error, which clients see as an explicit error response.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableConnector;

#[async_trait]
impl TransportConnector for UnavailableConnector {
    async fn connect(
        &self,
        client_id: &str,
        _config: &PeerConfig,
        _events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        tracing::debug!(%client_id, "No media transport configured, rejecting offer");
        Err(TransportError::Unavailable(
            "no real-time media transport is configured on this server".to_string(),
        ))
    }
}
