// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pulls frames off a live video track and offers them to a stream's scheduler.
//!
//! A watchdog ticks at `watchdog_hz` to check liveness and to poll a track that had
//! no frame yet. Emissions are timed separately: the next snapshot is due one cadence
//! interval after the previous offer returned, so it never reaches the scheduler's
//! gate early even when the interval is not a multiple of the watchdog period. The
//! loop ends the first tick the track is no longer live, or when the session cancels it.

use std::sync::Arc;
use std::time::Duration;

use detkit_core::types::now_ms;
use detkit_engine::{frame_interval, FrameScheduler, OfferOutcome};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::transport::VideoTrack;

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub watchdog_hz: u32,
    pub target_fps: u32,
}

/// Why a bridge stopped, and what it did while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub emitted: u64,
    pub accepted: u64,
    /// Polls where a snapshot was due but the track had no frame yet.
    pub empty_polls: u64,
    pub cancelled: bool,
}

pub async fn run_track_bridge(
    track: Arc<dyn VideoTrack>,
    scheduler: Arc<FrameScheduler>,
    settings: BridgeSettings,
    cancel: CancellationToken,
) -> BridgeReport {
    let emit_interval = frame_interval(settings.target_fps);
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / settings.watchdog_hz.max(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut report = BridgeReport::default();
    let mut next_due = Instant::now();
    let mut sequence_id = 0u64;

    loop {
        let due_ahead = next_due > Instant::now();
        tokio::select! {
            () = cancel.cancelled() => {
                report.cancelled = true;
                break;
            }
            _ = ticker.tick() => {}
            () = tokio::time::sleep_until(next_due), if due_ahead => {}
        }

        if !track.is_live() {
            tracing::debug!(track_id = %track.id(), "Track ended, stopping frame bridge");
            break;
        }
        if Instant::now() < next_due {
            continue;
        }
        let Some(frame) = track.snapshot() else {
            report.empty_polls += 1;
            continue;
        };

        sequence_id += 1;
        let mut frame = frame.with_recv_ts(now_ms());
        frame.sequence_id = sequence_id;

        report.emitted += 1;
        match scheduler.offer(frame) {
            OfferOutcome::Accepted => report.accepted += 1,
            OfferOutcome::Busy | OfferOutcome::TooSoon => {},
            OfferOutcome::Closed => {
                report.cancelled = true;
                break;
            },
        }
        // Measured from after the offer so the scheduler never sees a shorter gap than we do.
        next_due = Instant::now() + emit_interval;
    }

    tracing::debug!(
        track_id = %track.id(),
        emitted = report.emitted,
        accepted = report.accepted,
        "Frame bridge stopped"
    );
    report
}
