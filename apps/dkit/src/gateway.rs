// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Peer gateway: one transport session per remote client.
//!
//! Each client moves through `New → Negotiating → Connected → Closed`:
//!
//! - **New**: created by the first message naming the client. An ICE candidate that
//!   arrives here is queued.
//! - **Negotiating**: an offer was accepted. The remote description is set, the
//!   candidate queue is drained in arrival order, and an answer is returned.
//!   Later candidates are applied directly.
//! - **Connected**: a video track is bound to a frame bridge feeding this client's
//!   scheduler; results are published as [`GatewayEvent::Detection`].
//! - **Closed**: removed explicitly or by a transport disconnect. The id is remembered
//!   for a while so stray candidates stay no-ops; a new offer starts over.
//!
//! Every operation on a client holds that client's session lock for its whole
//! duration, including transport calls. That is what keeps a candidate from being
//! applied before the remote description, however candidates and offers interleave.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use detkit_api::{IceCandidateInit, SessionDescription};
use detkit_core::stats::BoundedRing;
use detkit_core::types::DetectionResult;
use detkit_core::DetkitError;
use detkit_engine::{DetectionPipeline, FrameScheduler, MetricsAggregator};
use opentelemetry::{global, KeyValue};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bridge::{run_track_bridge, BridgeSettings};
use crate::config::Config;
use crate::transport::{
    PeerConfig, PeerConnection, TransportConnector, TransportError, TransportEvent, VideoTrack,
};

const TRANSPORT_EVENT_CAPACITY: usize = 64;
const GATEWAY_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The offer could not be turned into an answer. The session keeps its prior state.
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] TransportError),
    /// A candidate was rejected by an established connection.
    #[error("failed to apply ICE candidate: {0}")]
    Candidate(#[source] TransportError),
    #[error("unknown client: {0}")]
    UnknownClient(String),
}

impl From<GatewayError> for DetkitError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UnknownClient(id) => Self::UnknownClient(id),
            other => Self::Negotiation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Held until the remote description is set.
    Queued,
    Applied,
}

/// Things the signaling surface relays to clients.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    LocalCandidate { client_id: String, candidate: IceCandidateInit },
    Detection { client_id: String, result: DetectionResult },
    Closed { client_id: String },
}

impl GatewayEvent {
    pub fn client_id(&self) -> &str {
        match self {
            Self::LocalCandidate { client_id, .. }
            | Self::Detection { client_id, .. }
            | Self::Closed { client_id } => client_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub target_fps: u32,
    pub watchdog_hz: u32,
    pub result_channel_capacity: usize,
    pub closed_client_memory: usize,
    pub ice_servers: Vec<String>,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_fps: config.scheduler.target_fps,
            watchdog_hz: config.gateway.watchdog_hz,
            result_channel_capacity: config.gateway.result_channel_capacity.max(1),
            closed_client_memory: config.gateway.closed_client_memory,
            ice_servers: config.gateway.ice_servers.clone(),
        }
    }
}

struct PeerSession {
    state: SessionState,
    connection: Option<Arc<dyn PeerConnection>>,
    ice_queue: Vec<IceCandidateInit>,
    remote_description_set: bool,
    /// Scope of the current connection's pump, bridge and result forwarder.
    scope: CancellationToken,
    scheduler: Option<Arc<FrameScheduler>>,
}

impl PeerSession {
    fn new() -> Self {
        Self {
            state: SessionState::New,
            connection: None,
            ice_queue: Vec::new(),
            remote_description_set: false,
            scope: CancellationToken::new(),
            scheduler: None,
        }
    }

    /// Tears down the current connection and everything running on its behalf.
    async fn teardown_connection(&mut self) {
        self.scope.cancel();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.close();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.remote_description_set = false;
    }
}

type SessionSlot = Arc<tokio::sync::Mutex<PeerSession>>;

/// Removed ids, oldest forgotten first.
struct ClosedClients {
    order: BoundedRing<String>,
    ids: HashSet<String>,
}

impl ClosedClients {
    fn remember(&mut self, client_id: &str) {
        if self.ids.insert(client_id.to_string()) {
            if let Some(evicted) = self.order.push(client_id.to_string()) {
                self.ids.remove(&evicted);
            }
        }
    }

    /// The id stays in the ring; if it is remembered again, the stale entry may
    /// expire it early. Memory of removals is best-effort.
    fn forget(&mut self, client_id: &str) {
        self.ids.remove(client_id);
    }
}

struct GatewayMetrics {
    active_clients: opentelemetry::metrics::Gauge<u64>,
    offers: opentelemetry::metrics::Counter<u64>,
    candidates: opentelemetry::metrics::Counter<u64>,
}

impl GatewayMetrics {
    fn new() -> Self {
        let meter = global::meter("detkit_gateway");
        Self {
            active_clients: meter
                .u64_gauge("gateway.clients.active")
                .with_description("Clients with a live gateway session")
                .build(),
            offers: meter
                .u64_counter("gateway.offers")
                .with_description("Offers handled, by outcome")
                .build(),
            candidates: meter
                .u64_counter("gateway.candidates")
                .with_description("Remote ICE candidates handled, by outcome")
                .build(),
        }
    }
}

pub struct PeerGateway {
    connector: Arc<dyn TransportConnector>,
    pipeline: Arc<DetectionPipeline>,
    metrics: Arc<MetricsAggregator>,
    settings: GatewaySettings,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    closed: Mutex<ClosedClients>,
    events: broadcast::Sender<GatewayEvent>,
    telemetry: GatewayMetrics,
}

impl std::fmt::Debug for PeerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGateway")
            .field("clients", &self.client_count())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PeerGateway {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        pipeline: Arc<DetectionPipeline>,
        metrics: Arc<MetricsAggregator>,
        settings: GatewaySettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(GATEWAY_EVENT_CAPACITY);
        let closed = ClosedClients {
            order: BoundedRing::new(settings.closed_client_memory),
            ids: HashSet::new(),
        };
        Arc::new(Self {
            connector,
            pipeline,
            metrics,
            settings,
            sessions: Mutex::new(HashMap::new()),
            closed: Mutex::new(closed),
            events,
            telemetry: GatewayMetrics::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().map_or(0, |sessions| sessions.len())
    }

    pub async fn session_state(&self, client_id: &str) -> Option<SessionState> {
        let slot = self.existing_slot(client_id)?;
        let state = slot.lock().await.state;
        Some(state)
    }

    /// Candidates waiting for the remote description.
    pub async fn queued_candidates(&self, client_id: &str) -> Option<usize> {
        let slot = self.existing_slot(client_id)?;
        let queued = slot.lock().await.ice_queue.len();
        Some(queued)
    }

    fn existing_slot(&self, client_id: &str) -> Option<SessionSlot> {
        self.sessions.lock().ok()?.get(client_id).cloned()
    }

    fn slot_or_create(&self, client_id: &str) -> Option<SessionSlot> {
        let mut sessions = self.sessions.lock().ok()?;
        let slot = sessions
            .entry(client_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(%client_id, "New client session");
                Arc::new(tokio::sync::Mutex::new(PeerSession::new()))
            })
            .clone();
        let active = sessions.len() as u64;
        drop(sessions);
        self.telemetry.active_clients.record(active, &[]);
        Some(slot)
    }

    fn is_closed(&self, client_id: &str) -> bool {
        self.closed.lock().is_ok_and(|closed| closed.ids.contains(client_id))
    }

    fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine: nobody is watching this client.
        let _ = self.events.send(event);
    }

    /// Negotiates (or renegotiates) a session and returns the answer.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Negotiation` if the transport cannot create a connection,
    /// rejects the offer, or cannot produce an answer. A previously established
    /// connection for this client is left untouched in that case.
    pub async fn handle_offer(
        self: &Arc<Self>,
        client_id: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, GatewayError> {
        if let Ok(mut closed) = self.closed.lock() {
            closed.forget(client_id);
        }

        let result = self.negotiate(client_id, offer).await;
        let outcome = if result.is_ok() { "answered" } else { "failed" };
        self.telemetry.offers.add(1, &[KeyValue::new("outcome", outcome)]);
        result
    }

    async fn negotiate(
        self: &Arc<Self>,
        client_id: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, GatewayError> {
        let (slot, mut session) = loop {
            let slot = self
                .slot_or_create(client_id)
                .ok_or_else(|| GatewayError::UnknownClient(client_id.to_string()))?;
            let session = slot.clone().lock_owned().await;
            // Lost a race with removal; the next lookup creates a fresh session.
            if session.state != SessionState::Closed {
                break (slot, session);
            }
        };

        tracing::info!(%client_id, renegotiation = session.connection.is_some(), "Handling offer");

        let (event_tx, event_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let peer_config = PeerConfig { ice_servers: self.settings.ice_servers.clone() };
        let negotiated = match self.connector.connect(client_id, &peer_config, event_tx).await {
            Ok(connection) => {
                let connection: Arc<dyn PeerConnection> = connection.into();
                match answer_offer(connection.as_ref(), offer, &session.ice_queue, client_id).await
                {
                    Ok(answer) => Ok((connection, answer)),
                    Err(e) => {
                        connection.close().await;
                        Err(e)
                    },
                }
            },
            Err(e) => Err(e),
        };

        let (connection, answer) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!(%client_id, error = %e, "Negotiation failed");
                self.discard_if_unused(client_id, &slot, &mut session);
                return Err(GatewayError::Negotiation(e));
            },
        };
        drop(slot);

        session.teardown_connection().await;
        session.connection = Some(connection);
        session.remote_description_set = true;
        session.ice_queue.clear();
        session.state = SessionState::Negotiating;
        session.scope = CancellationToken::new();

        tokio::spawn(pump_transport_events(
            Arc::downgrade(self),
            client_id.to_string(),
            event_rx,
            session.scope.clone(),
        ));

        Ok(answer)
    }

    /// Queues or applies a remote ICE candidate.
    ///
    /// # Errors
    ///
    /// - `GatewayError::UnknownClient` if the client was removed recently; callers
    ///   treat this as a no-op
    /// - `GatewayError::Candidate` if the established connection rejects the candidate
    pub async fn handle_candidate(
        &self,
        client_id: &str,
        candidate: IceCandidateInit,
    ) -> Result<CandidateOutcome, GatewayError> {
        let result = self.route_candidate(client_id, candidate).await;
        let outcome = match &result {
            Ok(CandidateOutcome::Queued) => "queued",
            Ok(CandidateOutcome::Applied) => "applied",
            Err(GatewayError::UnknownClient(_)) => "ignored",
            Err(_) => "failed",
        };
        self.telemetry.candidates.add(1, &[KeyValue::new("outcome", outcome)]);
        result
    }

    async fn route_candidate(
        &self,
        client_id: &str,
        candidate: IceCandidateInit,
    ) -> Result<CandidateOutcome, GatewayError> {
        let unknown = || GatewayError::UnknownClient(client_id.to_string());
        if self.is_closed(client_id) {
            tracing::debug!(%client_id, "Candidate for removed client ignored");
            return Err(unknown());
        }

        let slot = self.slot_or_create(client_id).ok_or_else(unknown)?;
        let mut session = slot.lock().await;

        match (&session.connection, session.state) {
            (_, SessionState::Closed) => Err(unknown()),
            (Some(connection), _) if session.remote_description_set => {
                connection.add_ice_candidate(&candidate).await.map_err(GatewayError::Candidate)?;
                tracing::trace!(%client_id, "Applied ICE candidate");
                Ok(CandidateOutcome::Applied)
            },
            _ => {
                session.ice_queue.push(candidate);
                tracing::trace!(%client_id, queued = session.ice_queue.len(), "Queued ICE candidate");
                Ok(CandidateOutcome::Queued)
            },
        }
    }

    /// Closes and forgets a client. Returns `false` if there was nothing to remove.
    ///
    /// Safe while a detection is in flight: its result is discarded.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        let Some(slot) = self.existing_slot(client_id) else {
            tracing::debug!(%client_id, "Remove for unknown client ignored");
            return false;
        };
        self.unregister(client_id, &slot);
        let mut session = slot.lock().await;
        if session.state != SessionState::Closed {
            self.close_session(client_id, &mut session).await;
        }
        true
    }

    /// Removal triggered by the transport of the connection owning `scope`. Ignored if
    /// that connection has since been replaced by a renegotiation.
    async fn handle_disconnect(&self, client_id: &str, scope: &CancellationToken) {
        let Some(slot) = self.existing_slot(client_id) else {
            return;
        };
        let mut session = slot.lock().await;
        if scope.is_cancelled() || session.state == SessionState::Closed {
            return;
        }
        self.unregister(client_id, &slot);
        self.close_session(client_id, &mut session).await;
    }

    /// Drops a session that holds nothing: no connection and no queued candidates.
    /// The id is not remembered as removed, so a later offer or candidate starts over.
    fn discard_if_unused(&self, client_id: &str, slot: &SessionSlot, session: &mut PeerSession) {
        if session.state != SessionState::New
            || session.connection.is_some()
            || !session.ice_queue.is_empty()
        {
            return;
        }
        // A candidate waiting on this slot sees it closed instead of queueing into it.
        session.state = SessionState::Closed;
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(client_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                sessions.remove(client_id);
            }
            self.telemetry.active_clients.record(sessions.len() as u64, &[]);
        }
        tracing::debug!(%client_id, "Discarded session left empty by a failed offer");
    }

    fn unregister(&self, client_id: &str, slot: &SessionSlot) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(client_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                sessions.remove(client_id);
            }
            self.telemetry.active_clients.record(sessions.len() as u64, &[]);
        }
        if let Ok(mut closed) = self.closed.lock() {
            closed.remember(client_id);
        }
    }

    async fn close_session(&self, client_id: &str, session: &mut PeerSession) {
        session.teardown_connection().await;
        session.ice_queue.clear();
        session.state = SessionState::Closed;

        tracing::info!(%client_id, "Client removed");
        self.publish(GatewayEvent::Closed { client_id: client_id.to_string() });
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> =
            self.sessions.lock().map(|s| s.keys().cloned().collect()).unwrap_or_default();
        for id in ids {
            self.remove_client(&id).await;
        }
    }

    async fn bind_track(
        self: &Arc<Self>,
        client_id: &str,
        track: Arc<dyn VideoTrack>,
        scope: &CancellationToken,
    ) {
        let Some(slot) = self.existing_slot(client_id) else {
            return;
        };
        let mut session = slot.lock().await;
        if scope.is_cancelled() || session.state == SessionState::Closed {
            return;
        }
        if session.scheduler.is_some() {
            tracing::debug!(%client_id, track_id = %track.id(), "Additional video track ignored");
            return;
        }

        let (result_tx, result_rx) = mpsc::channel(self.settings.result_channel_capacity);
        let scheduler = Arc::new(FrameScheduler::new(
            client_id,
            self.settings.target_fps,
            Arc::clone(&self.pipeline),
            result_tx,
            Some(Arc::clone(&self.metrics)),
        ));
        session.scheduler = Some(Arc::clone(&scheduler));
        session.state = SessionState::Connected;
        drop(session);

        tracing::info!(%client_id, track_id = %track.id(), "Video track bound to frame bridge");

        let settings = BridgeSettings {
            watchdog_hz: self.settings.watchdog_hz,
            target_fps: self.settings.target_fps,
        };
        tokio::spawn(run_track_bridge(track, scheduler, settings, scope.child_token()));
        tokio::spawn(forward_results(
            Arc::downgrade(self),
            client_id.to_string(),
            result_rx,
            scope.clone(),
        ));
    }
}

/// Sets the remote description, replays queued candidates in arrival order, answers.
async fn answer_offer(
    connection: &dyn PeerConnection,
    offer: &SessionDescription,
    queued: &[IceCandidateInit],
    client_id: &str,
) -> Result<SessionDescription, TransportError> {
    connection.set_remote_description(offer).await?;

    for candidate in queued {
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            tracing::debug!(%client_id, error = %e, "Queued ICE candidate rejected");
        }
    }
    if !queued.is_empty() {
        tracing::debug!(%client_id, count = queued.len(), "Drained queued ICE candidates");
    }

    connection.create_answer().await
}

async fn pump_transport_events(
    gateway: Weak<PeerGateway>,
    client_id: String,
    mut events: mpsc::Receiver<TransportEvent>,
    scope: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = scope.cancelled() => break,
            event = events.recv() => event,
        };
        let (Some(event), Some(gateway)) = (event, gateway.upgrade()) else {
            break;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                gateway.publish(GatewayEvent::LocalCandidate {
                    client_id: client_id.clone(),
                    candidate,
                });
            },
            TransportEvent::Track(track) => gateway.bind_track(&client_id, track, &scope).await,
            TransportEvent::Disconnected => {
                tracing::info!(%client_id, "Transport disconnected");
                gateway.handle_disconnect(&client_id, &scope).await;
                break;
            },
        }
    }
}

async fn forward_results(
    gateway: Weak<PeerGateway>,
    client_id: String,
    mut results: mpsc::Receiver<DetectionResult>,
    scope: CancellationToken,
) {
    while let Some(result) = results.recv().await {
        if scope.is_cancelled() {
            break;
        }
        let Some(gateway) = gateway.upgrade() else {
            break;
        };
        gateway.publish(GatewayEvent::Detection { client_id: client_id.clone(), result });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_clients_forget_oldest() {
        let mut closed = ClosedClients { order: BoundedRing::new(2), ids: HashSet::new() };
        closed.remember("a");
        closed.remember("b");
        closed.remember("c");
        assert!(!closed.ids.contains("a"));
        assert!(closed.ids.contains("b"));
        assert!(closed.ids.contains("c"));

        closed.forget("b");
        assert!(!closed.ids.contains("b"));
    }

    #[test]
    fn test_unknown_client_maps_to_core_error() {
        let err: DetkitError = GatewayError::UnknownClient("cam-1".to_string()).into();
        assert!(matches!(err, DetkitError::UnknownClient(id) if id == "cam-1"));
    }
}
