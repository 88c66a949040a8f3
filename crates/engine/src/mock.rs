// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stand-in detections used when no model is loaded or inference fails.
//!
//! The output has the same shape as real detections. Callers that need to tell
//! them apart use [`crate::pipeline::DetectionSource`].

use detkit_core::types::Detection;
use rand::Rng;

/// A fixed pool of canonical detections; each call returns a random prefix of it.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    pool: Vec<Detection>,
}

impl MockGenerator {
    /// The two-item pool: a person at 0.87 and a chair at 0.72.
    pub fn canonical() -> Self {
        Self {
            pool: vec![
                Detection::new("person", 0.87, 0.1, 0.1, 0.4, 0.8),
                Detection::new("chair", 0.72, 0.5, 0.4, 0.75, 0.9),
            ],
        }
    }

    pub fn pool(&self) -> &[Detection] {
        &self.pool
    }

    /// Returns a prefix of the pool whose length is uniform over `0..=pool.len()`.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Detection> {
        let len = rng.gen_range(0..=self.pool.len());
        self.pool[..len].to_vec()
    }

    pub fn generate(&self) -> Vec<Detection> {
        self.generate_with(&mut rand::thread_rng())
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::canonical()
    }
}
