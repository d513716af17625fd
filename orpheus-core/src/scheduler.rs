// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Decides when the codec runs on the incoming token stream.
//!
//! The first chunk is decoded from a single frame as soon as seven indices are
//! available so that audio starts flowing early. After that, one chunk is decoded
//! at every frame boundary from a sliding window of up to four frames.

use crate::codec::{decode_window, AudioCodec};
use crate::frame::{FrameAssembler, FRAME_SIZE};
use crate::token::TokenCache;
use crate::Result;
use std::sync::Arc;

pub const PRIME_FRAMES: usize = 1;
pub const WINDOW_FRAMES: usize = 4;

/// Per-request counters reported once the token source is exhausted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StreamSummary {
    pub tokens: usize,
    pub rejected_tokens: usize,
    pub indices: usize,
    pub chunks: usize,
    pub skipped_windows: usize,
    /// Indices of the trailing partial frame, never decoded.
    pub dropped_tail: usize,
}

pub struct StreamingDecoder {
    codec: Arc<dyn AudioCodec>,
    cache: Arc<TokenCache>,
    frames: FrameAssembler,
    first_emitted: bool,
    summary: StreamSummary,
}

impl StreamingDecoder {
    pub fn new(codec: Arc<dyn AudioCodec>) -> Self {
        Self::with_cache(codec, TokenCache::global())
    }

    pub fn with_cache(codec: Arc<dyn AudioCodec>, cache: Arc<TokenCache>) -> Self {
        Self {
            codec,
            cache,
            frames: FrameAssembler::new(),
            first_emitted: false,
            summary: StreamSummary::default(),
        }
    }

    /// Number of accepted indices, which is also the position of the next token.
    pub fn count(&self) -> usize {
        self.frames.count()
    }

    pub fn first_emitted(&self) -> bool {
        self.first_emitted
    }

    /// Feeds one raw token, returning the chunk it triggered if any.
    ///
    /// Tokens that do not parse to a positive index are dropped without moving
    /// the position. Only decoder failures are reported as errors.
    pub fn offer_token(&mut self, token: &str) -> Result<Option<Vec<u8>>> {
        self.summary.tokens += 1;
        match self.cache.parse(token, self.frames.count()) {
            Some(index) => self.offer_index(index),
            None => {
                tracing::trace!(token, "dropping malformed token");
                self.summary.rejected_tokens += 1;
                Ok(None)
            }
        }
    }

    pub fn offer_index(&mut self, index: i64) -> Result<Option<Vec<u8>>> {
        let offer = self.frames.offer(index);
        if !offer.accepted {
            tracing::trace!(index, "dropping non-positive index");
            self.summary.rejected_tokens += 1;
            return Ok(None);
        }
        let frames = if !self.first_emitted {
            // Retried on every index until a prime succeeds, aligned or not.
            if offer.count < PRIME_FRAMES * FRAME_SIZE {
                return Ok(None);
            }
            PRIME_FRAMES
        } else if offer.frame_ready {
            usize::min(offer.count / FRAME_SIZE, WINDOW_FRAMES)
        } else {
            return Ok(None);
        };
        let window = match self.frames.tail_frames(frames) {
            Some(window) => window,
            None => return Ok(None),
        };
        match decode_window(self.codec.as_ref(), window)? {
            Some(chunk) => {
                if !self.first_emitted {
                    tracing::debug!(count = offer.count, "first audio chunk");
                }
                self.first_emitted = true;
                self.summary.chunks += 1;
                Ok(Some(chunk))
            }
            None => {
                self.summary.skipped_windows += 1;
                Ok(None)
            }
        }
    }

    /// Ends the stream. No flush happens, a trailing partial frame is dropped.
    pub fn finish(mut self) -> StreamSummary {
        self.summary.indices = self.frames.count();
        self.summary.dropped_tail = self.frames.partial_len();
        self.summary
    }
}
