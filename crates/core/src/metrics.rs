// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Serializable metric snapshot shapes.
//!
//! These are presentation values: latency percentiles are whole milliseconds, while
//! rates, durations and bandwidth carry two decimals. Every shape has an all-zero
//! `Default`, which is what an aggregator reports before any sample arrives.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::stats::Percentiles;

/// Frame counts and throughput over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SummaryStats {
    /// Seconds since the aggregator was created or last reset
    pub run_duration_s: f64,
    /// `processed_frames + dropped_frames`
    pub total_frames: u64,
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub processed_fps: f64,
    /// Fraction of frames dropped, `dropped / max(total, 1)`
    pub drop_rate: f64,
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LatencyStats {
    pub e2e: Percentiles,
    pub server: Percentiles,
    pub network: Percentiles,
}

/// Bandwidth percentiles in kilobits per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BandwidthStats {
    pub uplink_kbps: Percentiles,
    pub downlink_kbps: Percentiles,
}

/// Full on-demand snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MetricsSnapshot {
    pub summary: SummaryStats,
    pub latency: LatencyStats,
    pub bandwidth: BandwidthStats,
}

/// Throughput and latency over the most recent processed frames only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RecentStats {
    /// Number of records the window actually covered
    pub frames: usize,
    pub processed_fps: f64,
    pub latency: LatencyStats,
}
