// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame to tensor conversion.
//!
//! Frames are resized straight to the detector input with independent horizontal
//! and vertical scale factors. Aspect ratio is not preserved and no padding is
//! added; [`crate::decode`] normalizes by the same per-axis input size, so boxes
//! come back in the frame's own proportions.

use detkit_core::types::{Frame, Tensor, FRAME_CHANNELS};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};

use crate::error::PipelineError;

/// Resizes `frame` to `width`x`height` (bilinear), converts it to planar CHW and
/// scales bytes to `[0, 1]`.
///
/// # Errors
///
/// Returns [`PipelineError::Preprocessing`] for empty frames, zero-sized targets or
/// pixel buffers whose length does not match `width * height * 3`.
pub fn preprocess(frame: &Frame, width: u32, height: u32) -> Result<Tensor, PipelineError> {
    if width == 0 || height == 0 {
        return Err(PipelineError::Preprocessing(format!(
            "detector input must be non-empty, got {width}x{height}"
        )));
    }
    if frame.width == 0 || frame.height == 0 {
        return Err(PipelineError::Preprocessing(format!(
            "frame {} is empty ({}x{})",
            frame.sequence_id, frame.width, frame.height
        )));
    }
    if frame.pixels.len() != frame.expected_len() {
        return Err(PipelineError::Preprocessing(format!(
            "frame {} holds {} bytes, expected {} for {}x{} RGB",
            frame.sequence_id,
            frame.pixels.len(),
            frame.expected_len(),
            frame.width,
            frame.height
        )));
    }

    let resized;
    let interleaved: &[u8] = if frame.width == width && frame.height == height {
        &frame.pixels[..]
    } else {
        let source =
            ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(frame.width, frame.height, &frame.pixels[..])
                .ok_or_else(|| {
                    PipelineError::Preprocessing(format!(
                        "frame {} buffer does not describe a {}x{} image",
                        frame.sequence_id, frame.width, frame.height
                    ))
                })?;
        resized = imageops::resize(&source, width, height, FilterType::Triangle);
        resized.as_raw()
    };

    let plane = width as usize * height as usize;
    let mut values = vec![0.0f32; plane * FRAME_CHANNELS];
    for (i, pixel) in interleaved.chunks_exact(FRAME_CHANNELS).enumerate() {
        for (channel, &byte) in pixel.iter().enumerate() {
            values[channel * plane + i] = f32::from(byte) / 255.0;
        }
    }

    Tensor::from_chw(values, height as usize, width as usize)
        .map_err(|e| PipelineError::Preprocessing(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let pixels: Vec<u8> =
            std::iter::repeat(rgb).take((width * height) as usize).flatten().collect();
        Frame::new(pixels, width, height, 0, 1)
    }

    #[test]
    fn test_planar_layout_and_normalization() {
        // 2x1 frame: red then blue
        let frame = Frame::new(vec![255, 0, 0, 0, 0, 255], 2, 1, 0, 1);
        let tensor = preprocess(&frame, 2, 1).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 1, 2]);
        assert_eq!(tensor.values(), &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_resize_to_detector_input() {
        let frame = solid(640, 480, [51, 102, 204]);
        let tensor = preprocess(&frame, 320, 240).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 240, 320]);

        // A solid frame stays solid through bilinear resampling
        let plane = 320 * 240;
        assert!((tensor.values()[0] - 0.2).abs() < 0.01);
        assert!((tensor.values()[plane] - 0.4).abs() < 0.01);
        assert!((tensor.values()[2 * plane + 17] - 0.8).abs() < 0.01);
        assert!(tensor.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_non_uniform_scale() {
        let frame = solid(100, 20, [0, 0, 0]);
        let tensor = preprocess(&frame, 32, 32).unwrap();
        assert_eq!((tensor.width(), tensor.height()), (32, 32));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let short = Frame::new(vec![0u8; 10], 2, 2, 0, 9);
        let err = preprocess(&short, 320, 240).unwrap_err();
        assert!(matches!(err, PipelineError::Preprocessing(ref m) if m.contains("frame 9")));

        let empty = Frame::new(Vec::new(), 0, 0, 0, 1);
        assert!(preprocess(&empty, 320, 240).is_err());

        assert!(preprocess(&solid(4, 4, [1, 2, 3]), 0, 240).is_err());
    }
}
