// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The token source failed before reaching its natural end.
    #[error("token source failed: {0}")]
    Upstream(BoxError),

    #[error("audio worker panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;
