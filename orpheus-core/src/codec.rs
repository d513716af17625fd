// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Turning frame windows into PCM through the neural audio codec.

use crate::frame::FRAME_SIZE;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use candle::{DType, Device, Tensor};
use candle_transformers::models::snac;
use std::path::Path;

/// Largest codebook index accepted in a window.
pub const MAX_CODE: i64 = 4096;
/// Range of decoder output samples kept for each chunk.
pub const SLICE_START: usize = 2048;
pub const SLICE_END: usize = 4096;
pub const CHUNK_SAMPLES: usize = SLICE_END - SLICE_START;
pub const CHUNK_BYTES: usize = CHUNK_SAMPLES * 2;

/// A decoder from the three codebook streams to a waveform.
///
/// `decode` receives `[c0, c1, c2]` as `u32` tensors of shapes `(1, F)`, `(1, 2F)`
/// and `(1, 4F)` on [`AudioCodec::device`], and returns a float waveform of shape
/// `(1, 1, S)`.
pub trait AudioCodec: Send + Sync {
    fn device(&self) -> &Device;
    fn decode(&self, codes: &[&Tensor]) -> candle::Result<Tensor>;
}

/// SNAC 24kHz decoder.
pub struct Snac {
    model: snac::Model,
    sample_rate: usize,
    device: Device,
}

impl Snac {
    pub fn new(cfg: &snac::Config, vb: candle_nn::VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let model = snac::Model::new(cfg, vb)?;
        Ok(Self { model, sample_rate: cfg.sampling_rate, device })
    }

    pub fn load<P: AsRef<Path>, C: AsRef<Path>>(
        weights: P,
        config: C,
        device: &Device,
    ) -> Result<Self> {
        let cfg: snac::Config = serde_json::from_slice(&std::fs::read(config)?)?;
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)?
        };
        Self::new(&cfg, vb)
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }
}

impl AudioCodec for Snac {
    fn device(&self) -> &Device {
        &self.device
    }

    fn decode(&self, codes: &[&Tensor]) -> candle::Result<Tensor> {
        self.model.decode(codes)
    }
}

/// The three codebook streams of a frame window, validated on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codes {
    pub coarse: Vec<u32>,
    pub medium: Vec<u32>,
    pub fine: Vec<u32>,
}

impl Codes {
    /// Splits a window of `7 * F` indices into rates 1x, 2x and 4x per frame.
    ///
    /// Returns `None` if the window is not made of whole frames or if any index
    /// falls outside `[0, MAX_CODE]`.
    pub fn from_window(window: &[i64]) -> Option<Self> {
        if window.is_empty() || window.len() % FRAME_SIZE != 0 {
            return None;
        }
        let frames = window.len() / FRAME_SIZE;
        let mut coarse = Vec::with_capacity(frames);
        let mut medium = Vec::with_capacity(2 * frames);
        let mut fine = Vec::with_capacity(4 * frames);
        for f in window.chunks_exact(FRAME_SIZE) {
            coarse.push(f[0]);
            medium.extend_from_slice(&[f[1], f[4]]);
            fine.extend_from_slice(&[f[2], f[3], f[5], f[6]]);
        }
        let valid = |v: &[i64]| v.iter().all(|c| (0..=MAX_CODE).contains(c));
        if !(valid(&coarse) && valid(&medium) && valid(&fine)) {
            return None;
        }
        let narrow = |v: Vec<i64>| v.into_iter().map(|c| c as u32).collect::<Vec<_>>();
        Some(Self { coarse: narrow(coarse), medium: narrow(medium), fine: narrow(fine) })
    }

    pub fn frames(&self) -> usize {
        self.coarse.len()
    }

    pub fn to_tensors(&self, device: &Device) -> candle::Result<[Tensor; 3]> {
        let f = self.frames();
        let c0 = Tensor::from_vec(self.coarse.clone(), (1, f), device)?;
        let c1 = Tensor::from_vec(self.medium.clone(), (1, 2 * f), device)?;
        let c2 = Tensor::from_vec(self.fine.clone(), (1, 4 * f), device)?;
        Ok([c0, c1, c2])
    }
}

/// Decodes a window and returns its centre slice as little-endian i16 PCM.
///
/// `Ok(None)` means the window was rejected and nothing should be emitted.
/// Every returned chunk holds exactly [`CHUNK_SAMPLES`] samples: when the decoder
/// output does not reach [`SLICE_END`] the missing samples are silence.
pub fn decode_window(codec: &dyn AudioCodec, window: &[i64]) -> Result<Option<Vec<u8>>> {
    let codes = match Codes::from_window(window) {
        Some(codes) => codes,
        None => {
            tracing::debug!(len = window.len(), "skipping window with out of range codes");
            return Ok(None);
        }
    };
    let [c0, c1, c2] = codes.to_tensors(codec.device())?;
    let pcm = codec.decode(&[&c0, &c1, &c2])?.flatten_all()?;
    let len = pcm.dim(0)?;
    let end = usize::min(len, SLICE_END);
    let mut samples: Vec<i16> = if end > SLICE_START {
        pcm.narrow(0, SLICE_START, end - SLICE_START)?
            .to_dtype(DType::F32)?
            .affine(i16::MAX as f64, 0.)?
            .round()?
            .clamp(i16::MIN as f32, i16::MAX as f32)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v as i16)
            .collect()
    } else {
        Vec::with_capacity(CHUNK_SAMPLES)
    };
    if samples.len() < CHUNK_SAMPLES {
        tracing::trace!(len, frames = codes.frames(), "padding short decoder output");
        samples.resize(CHUNK_SAMPLES, 0);
    }
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(&samples, &mut bytes);
    Ok(Some(bytes))
}
