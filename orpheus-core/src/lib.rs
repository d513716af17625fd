// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Streaming decoder turning Orpheus codec tokens into 24kHz PCM.

pub mod bridge;
pub mod codec;
pub mod error;
pub mod frame;
pub mod scheduler;
pub mod token;
pub mod wav;

pub use bridge::{stream_audio, AudioStream};
pub use codec::{AudioCodec, Snac};
pub use error::{Error, Result};
pub use scheduler::{StreamSummary, StreamingDecoder};
