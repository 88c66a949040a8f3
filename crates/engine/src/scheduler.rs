// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-stream frame admission.
//!
//! A [`FrameScheduler`] sits between a capture source and the detection pipeline.
//! It forwards at most one frame per `1000 / target_fps` ms and keeps at most one
//! detection in flight. Everything else is discarded on arrival:
//!
//! - **skipped**: arrived before the cadence interval elapsed since the last
//!   accepted frame (scheduler-local count only)
//! - **dropped**: a detection was still running, or preprocessing failed (also
//!   reported to the metrics aggregator)
//!
//! `offer` never blocks. Accepted frames run on a spawned task that releases the
//! in-flight permit when detection finishes, then records metrics and delivers the
//! result on the stream's channel. After [`FrameScheduler::close`], late results are
//! discarded instead of delivered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use detkit_core::stats::StreamStats;
use detkit_core::types::{now_ms, DetectionResult, Frame, FrameMetricRecord};
use opentelemetry::{global, KeyValue};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsAggregator;
use crate::pipeline::DetectionPipeline;

/// What happened to an offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Forwarded to the pipeline.
    Accepted,
    /// Discarded because a detection is in flight.
    Busy,
    /// Discarded by the cadence gate.
    TooSoon,
    /// The scheduler has been closed.
    Closed,
}

/// Minimum spacing between accepted frames for `target_fps`. Zero is treated as one.
pub fn frame_interval(target_fps: u32) -> Duration {
    Duration::from_secs(1) / target_fps.max(1)
}

struct Gate {
    last_accepted: Option<Instant>,
    stats: StreamStats,
}

pub struct FrameScheduler {
    stream_id: String,
    min_interval: Duration,
    in_flight: Arc<Semaphore>,
    gate: Arc<Mutex<Gate>>,
    pipeline: Arc<DetectionPipeline>,
    results: mpsc::Sender<DetectionResult>,
    metrics: Option<Arc<MetricsAggregator>>,
    cancel: CancellationToken,
    discarded_counter: opentelemetry::metrics::Counter<u64>,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("stream_id", &self.stream_id)
            .field("min_interval", &self.min_interval)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl FrameScheduler {
    /// Creates a scheduler delivering results on `results`.
    ///
    /// When `metrics` is set, completed frames are recorded with `recorded_at` equal
    /// to the completion time, and dropped frames are tallied.
    pub fn new(
        stream_id: impl Into<String>,
        target_fps: u32,
        pipeline: Arc<DetectionPipeline>,
        results: mpsc::Sender<DetectionResult>,
        metrics: Option<Arc<MetricsAggregator>>,
    ) -> Self {
        let meter = global::meter("detkit_engine");
        let discarded_counter = meter
            .u64_counter("scheduler.discarded")
            .with_description("Frames discarded on arrival by the frame scheduler, by reason")
            .build();

        Self {
            stream_id: stream_id.into(),
            min_interval: frame_interval(target_fps),
            in_flight: Arc::new(Semaphore::new(1)),
            gate: Arc::new(Mutex::new(Gate { last_accepted: None, stats: StreamStats::default() })),
            pipeline,
            results,
            metrics,
            cancel: CancellationToken::new(),
            discarded_counter,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Offers a freshly captured frame. Never blocks; must be called within a Tokio runtime.
    pub fn offer(&self, frame: Frame) -> OfferOutcome {
        if self.cancel.is_cancelled() {
            return OfferOutcome::Closed;
        }

        let permit = {
            let Ok(mut gate) = self.gate.lock() else {
                return OfferOutcome::Closed;
            };
            gate.stats.offered += 1;

            let now = Instant::now();
            if gate.last_accepted.is_some_and(|last| now.duration_since(last) < self.min_interval) {
                gate.stats.skipped_cadence += 1;
                drop(gate);
                self.discarded_counter.add(1, &[KeyValue::new("reason", "cadence")]);
                return OfferOutcome::TooSoon;
            }

            let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
                gate.stats.dropped_busy += 1;
                drop(gate);
                self.discarded_counter.add(1, &[KeyValue::new("reason", "busy")]);
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped();
                }
                tracing::trace!(
                    stream_id = %self.stream_id,
                    frame_id = frame.sequence_id,
                    "Detection in flight, frame dropped"
                );
                return OfferOutcome::Busy;
            };

            gate.last_accepted = Some(now);
            gate.stats.forwarded += 1;
            permit
        };

        let pipeline = Arc::clone(&self.pipeline);
        let results = self.results.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let gate = Arc::clone(&self.gate);
        let stream_id = self.stream_id.clone();

        tokio::spawn(async move {
            let frame_id = frame.sequence_id;
            let outcome = pipeline.detect(frame).await;
            drop(permit);

            match outcome {
                Ok(result) => {
                    if let Ok(mut gate) = gate.lock() {
                        gate.stats.completed += 1;
                    }
                    if cancel.is_cancelled() {
                        tracing::debug!(%stream_id, frame_id, "Stream closed, discarding late result");
                        return;
                    }
                    if let Some(metrics) = &metrics {
                        metrics.record(FrameMetricRecord::from_result(&result, now_ms()));
                    }
                    tokio::select! {
                        () = cancel.cancelled() => {
                            tracing::debug!(%stream_id, frame_id, "Stream closed, discarding late result");
                        }
                        sent = results.send(result) => {
                            if sent.is_err() {
                                tracing::debug!(%stream_id, frame_id, "Result receiver gone");
                            }
                        }
                    }
                },
                Err(e) => {
                    if let Ok(mut gate) = gate.lock() {
                        gate.stats.failed += 1;
                    }
                    if let Some(metrics) = &metrics {
                        metrics.record_dropped();
                    }
                    tracing::debug!(%stream_id, frame_id, error = %e, "Frame dropped");
                },
            }
        });

        OfferOutcome::Accepted
    }

    /// Whether a detection is currently running for this stream.
    pub fn is_busy(&self) -> bool {
        self.in_flight.available_permits() == 0
    }

    pub fn stats(&self) -> StreamStats {
        self.gate.lock().map(|gate| gate.stats.clone()).unwrap_or_default()
    }

    /// Stops accepting frames. An in-flight detection finishes but its result is discarded.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(15), Duration::from_nanos(66_666_666));
        assert_eq!(frame_interval(1), Duration::from_secs(1));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }
}
