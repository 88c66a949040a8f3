// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Live performance aggregation.
//!
//! Appends are O(1) against fixed-capacity rings; snapshots sort copies of the
//! retained samples on demand. The aggregator is shared by every stream, so all
//! state sits behind one short-lived lock.

use std::sync::Mutex;

use detkit_core::geometry::round_to_f64;
use detkit_core::metrics::{
    BandwidthStats, LatencyStats, MetricsSnapshot, RecentStats, SummaryStats,
};
use detkit_core::stats::{BoundedRing, Percentiles};
use detkit_core::types::{now_ms, BandwidthSample, FrameMetricRecord};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::constants::{DEFAULT_BANDWIDTH_CAPACITY, DEFAULT_FRAME_CAPACITY, DEFAULT_RECENT_WINDOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub frame_capacity: usize,
    pub bandwidth_capacity: usize,
    pub recent_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            bandwidth_capacity: DEFAULT_BANDWIDTH_CAPACITY,
            recent_window: DEFAULT_RECENT_WINDOW,
        }
    }
}

#[derive(Debug)]
struct Inner {
    started: Instant,
    frames: BoundedRing<FrameMetricRecord>,
    uplink: BoundedRing<BandwidthSample>,
    downlink: BoundedRing<BandwidthSample>,
    processed: u64,
    dropped: u64,
}

impl Inner {
    fn new(config: &MetricsConfig) -> Self {
        Self {
            started: Instant::now(),
            frames: BoundedRing::new(config.frame_capacity),
            uplink: BoundedRing::new(config.bandwidth_capacity),
            downlink: BoundedRing::new(config.bandwidth_capacity),
            processed: 0,
            dropped: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.processed == 0 && self.dropped == 0 && self.uplink.is_empty()
    }
}

#[derive(Debug)]
pub struct MetricsAggregator {
    config: MetricsConfig,
    inner: Mutex<Inner>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        let inner = Mutex::new(Inner::new(&config));
        Self { config, inner }
    }

    pub const fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Records a frame that completed the full pipeline.
    pub fn record(&self, record: FrameMetricRecord) {
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("Metrics lock poisoned, discarding frame record");
            return;
        };
        inner.processed += 1;
        inner.frames.push(record);
    }

    /// Tallies a frame that was dropped before producing a result.
    pub fn record_dropped(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("Metrics lock poisoned, discarding drop");
            return;
        };
        inner.dropped += 1;
    }

    pub fn record_bandwidth(&self, uplink_kbps: f64, downlink_kbps: f64) {
        let timestamp = now_ms();
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("Metrics lock poisoned, discarding bandwidth sample");
            return;
        };
        inner.uplink.push(BandwidthSample { timestamp, kbps: uplink_kbps });
        inner.downlink.push(BandwidthSample { timestamp, kbps: downlink_kbps });
    }

    /// Starts a new run: counters, rings and the run clock are cleared.
    pub fn reset(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        *inner = Inner::new(&self.config);
    }

    /// Number of frame records currently retained.
    pub fn retained_frames(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.frames.len())
    }

    /// Number of samples currently retained per bandwidth direction.
    pub fn retained_bandwidth_samples(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.uplink.len())
    }

    /// Computes the full snapshot. Before any sample arrives every field is zero.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Ok(inner) = self.inner.lock() else {
            return MetricsSnapshot::default();
        };
        if inner.is_empty() {
            return MetricsSnapshot::default();
        }

        let run_duration_s = inner.started.elapsed().as_secs_f64();
        let total = inner.processed + inner.dropped;
        let processed_fps =
            if run_duration_s > 0.0 { inner.processed as f64 / run_duration_s } else { 0.0 };

        MetricsSnapshot {
            summary: SummaryStats {
                run_duration_s: round_to_f64(run_duration_s, 2),
                total_frames: total,
                processed_frames: inner.processed,
                dropped_frames: inner.dropped,
                processed_fps: round_to_f64(processed_fps, 2),
                drop_rate: round_to_f64(inner.dropped as f64 / total.max(1) as f64, 2),
            },
            latency: latency_stats(inner.frames.iter()),
            bandwidth: BandwidthStats {
                uplink_kbps: kbps_percentiles(inner.uplink.iter()),
                downlink_kbps: kbps_percentiles(inner.downlink.iter()),
            },
        }
    }

    /// Throughput and latency over the last `recent_window` records only.
    ///
    /// Rate is taken over the span of the window's `recorded_at` stamps.
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_stats(&self) -> RecentStats {
        let Ok(inner) = self.inner.lock() else {
            return RecentStats::default();
        };
        let window: Vec<&FrameMetricRecord> = inner.frames.last_n(self.config.recent_window).collect();
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return RecentStats::default();
        };

        let span_ms = last.recorded_at.saturating_sub(first.recorded_at);
        let processed_fps = if window.len() > 1 && span_ms > 0 {
            (window.len() - 1) as f64 * 1000.0 / span_ms as f64
        } else {
            0.0
        };

        RecentStats {
            frames: window.len(),
            processed_fps: round_to_f64(processed_fps, 2),
            latency: latency_stats(window.iter().copied()),
        }
    }
}

fn latency_stats<'a>(records: impl Iterator<Item = &'a FrameMetricRecord> + Clone) -> LatencyStats {
    LatencyStats {
        e2e: Percentiles::from_samples(records.clone().map(|r| r.e2e_latency)).map(f64::round),
        server: Percentiles::from_samples(records.clone().map(|r| r.server_latency))
            .map(f64::round),
        network: Percentiles::from_samples(records.map(|r| r.network_latency)).map(f64::round),
    }
}

fn kbps_percentiles<'a>(samples: impl Iterator<Item = &'a BandwidthSample>) -> Percentiles {
    Percentiles::from_samples(samples.map(|s| s.kbps)).map(|v| round_to_f64(v, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(frame_id: u64, e2e: u64, recorded_at: u64) -> FrameMetricRecord {
        FrameMetricRecord::from_timestamps(
            frame_id,
            recorded_at - e2e,
            None,
            recorded_at - e2e / 2,
            recorded_at,
        )
    }

    #[test]
    fn test_empty_snapshot_is_all_zero() {
        let metrics = MetricsAggregator::default();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.recent_stats(), RecentStats::default());
    }

    #[test]
    fn test_counts_and_drop_rate() {
        let metrics = MetricsAggregator::default();
        for i in 0..3 {
            metrics.record(record(i, 100, 10_000 + i * 66));
        }
        metrics.record_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.summary.total_frames, 4);
        assert_eq!(snap.summary.processed_frames, 3);
        assert_eq!(snap.summary.dropped_frames, 1);
        assert!((snap.summary.drop_rate - 0.25).abs() < f64::EPSILON);
        assert!((snap.latency.e2e.median - 100.0).abs() < f64::EPSILON);
        assert!((snap.latency.server.p95 - 50.0).abs() < f64::EPSILON);
        assert!(snap.latency.network.median.abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_percentiles_are_nearest_rank_and_whole() {
        let metrics = MetricsAggregator::default();
        for (i, e2e) in [10u64, 20, 30, 40, 50].into_iter().enumerate() {
            metrics.record(record(i as u64, e2e, 5_000));
        }
        let snap = metrics.snapshot();
        assert!((snap.latency.e2e.median - 30.0).abs() < f64::EPSILON);
        assert!((snap.latency.e2e.p95 - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bandwidth_percentiles_two_decimals() {
        let metrics = MetricsAggregator::default();
        metrics.record_bandwidth(512.123_4, 1_024.987_6);
        let snap = metrics.snapshot();
        assert!((snap.bandwidth.uplink_kbps.median - 512.12).abs() < 1e-9);
        assert!((snap.bandwidth.downlink_kbps.p95 - 1_024.99).abs() < 1e-9);
    }

    #[test]
    fn test_rings_are_bounded_but_counters_are_not() {
        let metrics = MetricsAggregator::default();
        for i in 0..2_500 {
            metrics.record(record(i, 40, 1_000 + i));
        }
        for _ in 0..250 {
            metrics.record_bandwidth(100.0, 200.0);
        }
        assert_eq!(metrics.retained_frames(), 1000);
        assert_eq!(metrics.retained_bandwidth_samples(), 100);
        assert_eq!(metrics.snapshot().summary.processed_frames, 2_500);
    }

    #[test]
    fn test_recent_stats_uses_last_window() {
        let metrics = MetricsAggregator::default();
        // 40 slow frames followed by 30 fast ones at ~15 fps
        for i in 0..40 {
            metrics.record(record(i, 900, 1_000 + i * 200));
        }
        for i in 0..30 {
            metrics.record(record(100 + i, 60, 20_000 + i * 66));
        }

        let recent = metrics.recent_stats();
        assert_eq!(recent.frames, 30);
        assert!((recent.latency.e2e.p95 - 60.0).abs() < f64::EPSILON);
        assert!((recent.processed_fps - 15.15).abs() < 0.01);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = MetricsAggregator::default();
        metrics.record(record(1, 50, 2_000));
        metrics.record_dropped();
        metrics.record_bandwidth(1.0, 2.0);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.retained_frames(), 0);
    }
}
