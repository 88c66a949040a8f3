// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Integration tests for frame admission: cadence gating, single-flight backpressure
//! and late-result handling after a stream is closed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use detkit_core::types::{now_ms, Frame, RawScoreTensor, Tensor};
use detkit_engine::{
    DetectionPipeline, FrameScheduler, InferenceBackend, InferenceError, MetricsAggregator,
    OfferOutcome, PipelineConfig,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn frame(sequence_id: u64) -> Frame {
    Frame::new(vec![0u8; 8 * 8 * 3], 8, 8, now_ms(), sequence_id)
}

fn small_input() -> PipelineConfig {
    PipelineConfig { input_width: 8, input_height: 8, ..PipelineConfig::default() }
}

/// Blocks every inference call until the test sends a release token.
struct GatedBackend {
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl InferenceBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    fn infer(&self, _tensor: &Tensor) -> Result<RawScoreTensor, InferenceError> {
        let release = self.release.lock().unwrap();
        release.recv().map_err(|e| InferenceError::Failed(e.to_string()))?;
        RawScoreTensor::new(Vec::new(), [1, 0, 85]).map_err(|e| InferenceError::Output(e.to_string()))
    }
}

fn gated_pipeline() -> (Arc<DetectionPipeline>, std_mpsc::Sender<()>) {
    let (release_tx, release_rx) = std_mpsc::channel();
    let backend: Arc<dyn InferenceBackend> =
        Arc::new(GatedBackend { release: Mutex::new(release_rx) });
    (Arc::new(DetectionPipeline::new(small_input(), Some(backend))), release_tx)
}

/// Offers `count` frames `spacing` apart with an instantaneous pipeline and returns
/// how many were accepted.
async fn run_cadence(target_fps: u32, count: u64, spacing: Duration) -> (u64, FrameScheduler) {
    let pipeline = Arc::new(DetectionPipeline::mock_only(PipelineConfig::default()));
    let (tx, mut rx) = mpsc::channel(32);
    let scheduler = FrameScheduler::new("cam", target_fps, pipeline, tx, None);

    let mut accepted = 0;
    for seq in 0..count {
        match scheduler.offer(frame(seq)) {
            OfferOutcome::Accepted => {
                accepted += 1;
                let result = rx.recv().await.expect("result for accepted frame");
                assert_eq!(result.frame_id, seq);
            },
            OfferOutcome::TooSoon => {},
            other => panic!("unexpected outcome {other:?} for frame {seq}"),
        }
        tokio::time::advance(spacing).await;
    }
    (accepted, scheduler)
}

#[tokio::test(start_paused = true)]
async fn test_even_spacing_at_double_rate_forwards_half() {
    // 30 frames within one second against a 15 fps target
    let (accepted, scheduler) = run_cadence(15, 30, Duration::from_secs(1) / 30).await;
    assert_eq!(accepted, 15);

    let stats = scheduler.stats();
    assert_eq!(stats.offered, 30);
    assert_eq!(stats.forwarded, 15);
    assert_eq!(stats.skipped_cadence, 15);
    assert_eq!(stats.dropped_busy, 0);
}

#[tokio::test(start_paused = true)]
async fn test_spacing_at_interval_forwards_everything() {
    let (accepted, _) = run_cadence(15, 30, Duration::from_secs(1) / 15).await;
    assert_eq!(accepted, 30);
}

#[tokio::test(start_paused = true)]
async fn test_spacing_just_under_interval_forwards_every_other_frame() {
    // 66 ms falls short of the 66.67 ms interval, so each frame after an accepted one is skipped
    let (accepted, scheduler) = run_cadence(15, 10, Duration::from_millis(66)).await;
    assert_eq!(accepted, 5);
    assert_eq!(scheduler.stats().skipped_cadence, 5);
}

#[tokio::test(start_paused = true)]
async fn test_tight_spacing_drops_the_excess() {
    // 10 ms apart: accepted at 0, 70, 140, 210 and 280 ms
    let (accepted, _) = run_cadence(15, 30, Duration::from_millis(10)).await;
    assert_eq!(accepted, 5);
}

#[tokio::test]
async fn test_in_flight_detection_drops_new_frames() {
    let _ = tracing_subscriber::fmt::try_init();

    let (pipeline, release) = gated_pipeline();
    let metrics = Arc::new(MetricsAggregator::default());
    let (tx, mut rx) = mpsc::channel(4);
    let scheduler = FrameScheduler::new("cam", 1000, pipeline, tx, Some(Arc::clone(&metrics)));

    assert_eq!(scheduler.offer(frame(1)), OfferOutcome::Accepted);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(scheduler.is_busy());
    assert_eq!(scheduler.offer(frame(2)), OfferOutcome::Busy);

    release.send(()).unwrap();
    let result = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(result.frame_id, 1);
    assert!(result.detections.is_empty());
    assert!(!scheduler.is_busy());

    tokio::time::sleep(Duration::from_millis(5)).await;
    release.send(()).unwrap();
    assert_eq!(scheduler.offer(frame(3)), OfferOutcome::Accepted);
    let result = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(result.frame_id, 3);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.summary.processed_frames, 2);
    assert_eq!(snapshot.summary.dropped_frames, 1);
    assert_eq!(snapshot.summary.total_frames, 3);
    assert_eq!(scheduler.stats().dropped_busy, 1);
}

#[tokio::test]
async fn test_preprocessing_failure_counts_as_dropped() {
    let (pipeline, _release) = gated_pipeline();
    let metrics = Arc::new(MetricsAggregator::default());
    let (tx, mut rx) = mpsc::channel(4);
    let scheduler = FrameScheduler::new("cam", 1000, pipeline, tx, Some(Arc::clone(&metrics)));

    let broken = Frame::new(vec![0u8; 7], 8, 8, now_ms(), 1);
    assert_eq!(scheduler.offer(broken), OfferOutcome::Accepted);

    timeout(Duration::from_secs(2), async {
        while metrics.snapshot().summary.dropped_frames == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("drop should be recorded");

    assert_eq!(metrics.snapshot().summary.processed_frames, 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(scheduler.stats().failed, 1);
}

#[tokio::test]
async fn test_result_discarded_after_close() {
    let (pipeline, release) = gated_pipeline();
    let metrics = Arc::new(MetricsAggregator::default());
    let (tx, mut rx) = mpsc::channel(4);
    let scheduler = FrameScheduler::new("cam", 1000, pipeline, tx, Some(Arc::clone(&metrics)));

    assert_eq!(scheduler.offer(frame(1)), OfferOutcome::Accepted);
    scheduler.close();
    assert_eq!(scheduler.offer(frame(2)), OfferOutcome::Closed);

    release.send(()).unwrap();
    drop(scheduler);

    // The in-flight task finishes, discards its result and drops the last sender
    let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert!(received.is_none());
    assert_eq!(metrics.snapshot().summary.processed_frames, 0);
}
