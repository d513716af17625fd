// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

/// Number of codebook indices making up one codec time step.
pub const FRAME_SIZE: usize = 7;

/// Outcome of offering an index to the [`FrameAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub accepted: bool,
    /// Number of accepted indices so far, including this one when accepted.
    pub count: usize,
    /// Set when this index completed a frame.
    pub frame_ready: bool,
}

/// Append-only buffer of the indices accepted for a single request.
#[derive(Debug, Default, Clone)]
pub struct FrameAssembler {
    indices: Vec<i64>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, index: i64) -> Offer {
        if index <= 0 {
            return Offer { accepted: false, count: self.count(), frame_ready: false };
        }
        self.indices.push(index);
        let count = self.indices.len();
        Offer { accepted: true, count, frame_ready: count % FRAME_SIZE == 0 }
    }

    pub fn count(&self) -> usize {
        self.indices.len()
    }

    pub fn complete_frames(&self) -> usize {
        self.indices.len() / FRAME_SIZE
    }

    /// Indices accepted after the last frame boundary.
    pub fn partial_len(&self) -> usize {
        self.indices.len() % FRAME_SIZE
    }

    /// The last `frames * FRAME_SIZE` indices, or `None` if fewer have been accepted.
    ///
    /// The returned slice is taken from the tail of the buffer and is not
    /// necessarily aligned on a frame boundary.
    pub fn tail_frames(&self, frames: usize) -> Option<&[i64]> {
        let len = frames * FRAME_SIZE;
        if len == 0 || len > self.indices.len() {
            return None;
        }
        Some(&self.indices[self.indices.len() - len..])
    }
}
