// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Conversion of the language model's textual codec tokens into codebook indices.
//!
//! The model emits tokens such as `<custom_token_4107>`. The number is offset by 10
//! and by 4096 for each slot of the frame, so the same codebook index maps to a
//! different token depending on its position.

use crate::frame::FRAME_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

pub const CUSTOM_TOKEN_PREFIX: &str = "<custom_token_";
pub const TOKEN_ID_OFFSET: i64 = 10;
pub const CODEBOOK_STRIDE: i64 = 4096;
pub const TOKEN_CACHE_CAPACITY: usize = 25_000;

/// Parses a single token for the given frame slot, without caching.
///
/// Returns `None` for anything that is not a custom token literal.
pub fn parse_custom_token(token: &str, slot: usize) -> Option<i64> {
    let token = token.trim();
    let start = token.rfind(CUSTOM_TOKEN_PREFIX)?;
    let digits = token[start + CUSTOM_TOKEN_PREFIX.len()..].strip_suffix('>')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Overflowing numbers cannot be valid codes.
    let n: i64 = digits.parse().ok()?;
    Some(n - TOKEN_ID_OFFSET - slot as i64 * CODEBOOK_STRIDE)
}

#[derive(Debug, Default)]
struct Entries {
    per_slot: [HashMap<String, Option<i64>>; FRAME_SIZE],
    len: usize,
}

/// Bounded memo of parse results keyed on the trimmed token and its slot.
///
/// Admission only: once `capacity` entries are stored, misses are still parsed
/// but no longer recorded. Nothing is ever evicted.
#[derive(Debug)]
pub struct TokenCache {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(TOKEN_CACHE_CAPACITY)
    }
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: RwLock::new(Entries::default()) }
    }

    /// The process-wide cache shared by every request.
    pub fn global() -> Arc<TokenCache> {
        static GLOBAL: OnceLock<Arc<TokenCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TokenCache::default())).clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Codebook index of `token` when it sits at absolute `position` in the stream.
    pub fn parse(&self, token: &str, position: usize) -> Option<i64> {
        let slot = position % FRAME_SIZE;
        let token = token.trim();
        if let Ok(entries) = self.entries.read() {
            if let Some(hit) = entries.per_slot[slot].get(token) {
                return *hit;
            }
        }
        let index = parse_custom_token(token, slot);
        // A poisoned lock only costs us the memoization.
        if let Ok(mut entries) = self.entries.write() {
            if entries.len < self.capacity && !entries.per_slot[slot].contains_key(token) {
                entries.per_slot[slot].insert(token.to_string(), index);
                entries.len += 1;
            }
        }
        index
    }
}

/// Parses through the process-wide cache.
pub fn parse_token(token: &str, position: usize) -> Option<i64> {
    TokenCache::global().parse(token, position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slot_offsets() {
        assert_eq!(parse_custom_token("<custom_token_11>", 0), Some(1));
        assert_eq!(parse_custom_token("<custom_token_4107>", 1), Some(1));
        assert_eq!(parse_custom_token("<custom_token_24587>", 6), Some(1));
        assert_eq!(parse_custom_token("<custom_token_10>", 0), Some(0));
        assert_eq!(parse_custom_token("<custom_token_5>", 3), Some(5 - 10 - 3 * 4096));
    }

    #[test]
    fn uses_last_occurrence_and_trims() {
        assert_eq!(parse_custom_token("  <custom_token_99>\n", 0), Some(89));
        assert_eq!(parse_custom_token("<custom_token_1><custom_token_4111>", 1), Some(5));
        assert_eq!(parse_custom_token("text<custom_token_20>", 0), Some(10));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for token in [
            "",
            "garbage",
            "<custom_token_>",
            "<custom_token_12",
            "<custom_token_12>x",
            "<custom_token_-12>",
            "<custom_token_+12>",
            "<custom_token_1 2>",
            "<custom_token_99999999999999999999999>",
        ] {
            assert_eq!(parse_custom_token(token, 0), None, "{token:?}");
        }
    }

    #[test]
    fn slot_band_maps_into_codebook_range() {
        for position in 0..21usize {
            let base = TOKEN_ID_OFFSET + (position % FRAME_SIZE) as i64 * CODEBOOK_STRIDE;
            for n in [base + 1, base + 17, base + 2048, base + CODEBOOK_STRIDE] {
                let index = parse_custom_token(&format!("<custom_token_{n}>"), position % 7);
                assert!(index.is_some_and(|i| i > 0 && i <= 4096), "{n} at {position}");
            }
        }
    }

    #[test]
    fn cache_is_keyed_on_slot() {
        let cache = TokenCache::new(16);
        assert_eq!(cache.parse("<custom_token_4107>", 1), Some(1));
        assert_eq!(cache.parse("<custom_token_4107>", 0), Some(4097));
        assert_eq!(cache.parse("<custom_token_4107>", 8), Some(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_stores_rejections_and_is_coherent() {
        let cache = TokenCache::new(16);
        assert_eq!(cache.parse("garbage", 3), None);
        assert_eq!(cache.parse("garbage", 3), None);
        assert_eq!(cache.parse(" <custom_token_30> ", 0), Some(20));
        assert_eq!(cache.parse("<custom_token_30>", 0), Some(20));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_stops_admitting_at_capacity() {
        let cache = TokenCache::new(3);
        for n in 11..20 {
            let token = format!("<custom_token_{n}>");
            assert_eq!(cache.parse(&token, 0), Some(n - 10));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.capacity(), 3);
        // Misses past the cap are still answered.
        assert_eq!(cache.parse("<custom_token_500>", 0), Some(490));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn global_cache_is_shared() {
        let a = TokenCache::global();
        let b = TokenCache::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.capacity(), TOKEN_CACHE_CAPACITY);
        assert_eq!(parse_token("<custom_token_8203>", 2), Some(1));
    }

    #[test]
    fn cache_is_safe_across_threads() {
        let cache = Arc::new(TokenCache::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for position in 0..70usize {
                        let n = 11 + (position % FRAME_SIZE) as i64 * CODEBOOK_STRIDE + t;
                        let token = format!("<custom_token_{n}>");
                        assert_eq!(cache.parse(&token, position), Some(1 + t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4 * FRAME_SIZE);
    }
}
