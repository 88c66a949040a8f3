// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Incoming H.264 video decoded to RGB frames.
//!
//! Three tasks serve one track: an async RTP reader that reassembles access units,
//! a blocking OpenH264 decoder that publishes the newest RGB frame, and a keyframe
//! requester that sends a PLI every few seconds so a decoder joining mid-stream (or
//! recovering from loss) gets an IDR soon.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use detkit_core::types::{now_ms, Frame};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tokio::sync::mpsc;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::track::track_remote::TrackRemote;

use super::H264_CLOCK_RATE;
use crate::transport::VideoTrack;

/// Packets the sample builder holds back waiting for a gap to fill.
const MAX_LATE_PACKETS: u16 = 256;
/// Access units buffered between the reader and the decoder.
const DECODE_QUEUE: usize = 32;
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// The decoded side of a remote video track.
///
/// `snapshot` hands out each decoded frame at most once: after it is taken the
/// track reports no frame until the decoder publishes a newer one.
#[derive(Debug)]
pub struct RtpVideoTrack {
    id: String,
    live: AtomicBool,
    latest: Mutex<Option<Frame>>,
    decoded: AtomicU64,
}

impl RtpVideoTrack {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            live: AtomicBool::new(true),
            latest: Mutex::new(None),
            decoded: AtomicU64::new(0),
        })
    }

    /// Starts reading and decoding `remote`. The returned track ends when the remote
    /// track stops delivering RTP or the decoder cannot start.
    pub(super) fn spawn(
        remote: Arc<TrackRemote>,
        pc: Weak<RTCPeerConnection>,
        client_id: &str,
    ) -> Arc<Self> {
        let track = Self::new(remote.id());
        let (units_tx, units_rx) = mpsc::channel(DECODE_QUEUE);

        let decoding = Arc::clone(&track);
        let decode_client = client_id.to_string();
        tokio::task::spawn_blocking(move || decode_access_units(units_rx, &decoding, &decode_client));

        tokio::spawn(request_keyframes(pc, remote.ssrc(), Arc::clone(&track)));
        tokio::spawn(read_access_units(remote, Arc::clone(&track), units_tx));

        track
    }

    /// Replaces the pending frame with a newer one.
    pub fn publish(&self, frame: Frame) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(frame);
        }
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Frames decoded since the track started.
    pub fn decoded_frames(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }
}

impl VideoTrack for RtpVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Option<Frame> {
        self.latest.lock().ok()?.take()
    }
}

/// Reassembles RTP packets into Annex B access units until the track ends.
async fn read_access_units(
    remote: Arc<TrackRemote>,
    track: Arc<RtpVideoTrack>,
    units: mpsc::Sender<Bytes>,
) {
    let mut builder = SampleBuilder::new(MAX_LATE_PACKETS, H264Packet::default(), H264_CLOCK_RATE);

    'read: loop {
        let packet = match remote.read_rtp().await {
            Ok((packet, _attributes)) => packet,
            Err(e) => {
                tracing::debug!(track_id = %track.id, error = %e, "RTP stream ended");
                break;
            },
        };
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            if units.send(sample.data).await.is_err() {
                break 'read;
            }
        }
    }

    track.end();
}

/// Runs on a blocking thread; the OpenH264 decoder never crosses threads.
fn decode_access_units(mut units: mpsc::Receiver<Bytes>, track: &RtpVideoTrack, client_id: &str) {
    let mut decoder = match Decoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::warn!(%client_id, error = %e, "Failed to start H.264 decoder");
            track.end();
            return;
        },
    };

    let mut sequence_id = 0u64;
    while let Some(unit) = units.blocking_recv() {
        if let Some(frame) = decode_frame(&mut decoder, &unit, sequence_id + 1) {
            sequence_id += 1;
            track.publish(frame);
        }
    }

    tracing::debug!(%client_id, track_id = %track.id, decoded = sequence_id, "H.264 decoder stopped");
}

/// Decodes one access unit to an RGB frame. Parameter sets, frames that depend on a
/// missing keyframe, and corrupt data yield nothing.
fn decode_frame(decoder: &mut Decoder, unit: &[u8], sequence_id: u64) -> Option<Frame> {
    let yuv = match decoder.decode(unit) {
        Ok(Some(yuv)) => yuv,
        Ok(None) => return None,
        Err(e) => {
            tracing::trace!(error = %e, "Undecodable access unit");
            return None;
        },
    };

    let (width, height) = yuv.dimensions();
    let (Ok(frame_width), Ok(frame_height)) = (u32::try_from(width), u32::try_from(height)) else {
        return None;
    };
    let mut rgb = vec![0u8; width * height * 3];
    yuv.write_rgb8(&mut rgb);

    Some(Frame::new(rgb, frame_width, frame_height, now_ms(), sequence_id))
}

async fn request_keyframes(pc: Weak<RTCPeerConnection>, media_ssrc: u32, track: Arc<RtpVideoTrack>) {
    let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
    loop {
        ticker.tick().await;
        if !track.is_live() {
            break;
        }
        let Some(pc) = pc.upgrade() else {
            break;
        };
        if let Err(e) =
            pc.write_rtcp(&[Box::new(PictureLossIndication { sender_ssrc: 0, media_ssrc })]).await
        {
            tracing::debug!(track_id = %track.id, error = %e, "Keyframe request failed");
            break;
        }
    }
}
