// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Llama based generator producing the codec token text for a prompt.

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{self, Cache, Llama, LlamaConfig};
use std::sync::Arc;
use std::time::Instant;

const START_OF_HUMAN: u32 = 128259;
const END_OF_TEXT: u32 = 128009;
const END_OF_HUMAN: u32 = 128260;
const START_OF_AI: u32 = 128261;
const START_OF_SPEECH: u32 = 128257;
const REPEAT_LAST_N: usize = 64;

pub type TokenIter = Box<dyn Iterator<Item = Result<String>> + Send>;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SpeechParams {
    pub prompt: String,
    pub voice: String,
    pub repetition_penalty: f32,
    pub stop_token_ids: Vec<u32>,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

/// Anything able to turn a prompt into a blocking stream of token strings.
pub trait SpeechGenerator: Send + Sync + 'static {
    fn generate_speech(&self, params: &SpeechParams) -> Result<TokenIter>;
}

pub struct OrpheusLm {
    model: Llama,
    config: llama::Config,
    tokenizer: Arc<tokenizers::Tokenizer>,
    device: Device,
    dtype: DType,
}

impl OrpheusLm {
    pub fn new(cfg: &crate::TtsConfig, dev: &Device) -> Result<Self> {
        let dtype = crate::utils::model_dtype(cfg.dtype_override.as_deref(), dev)?;
        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(&cfg.lm_config_file)?)?;
        let config = config.into_config(false);
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&cfg.lm_model_files[..], dtype, dev)?
        };
        let model = Llama::load(vb, &config)?;
        let tokenizer =
            tokenizers::Tokenizer::from_file(&cfg.text_tokenizer_file).map_err(anyhow::Error::msg)?;
        tracing::info!(?dtype, files = cfg.lm_model_files.len(), "loaded orpheus lm");
        Ok(Self { model, config, tokenizer: Arc::new(tokenizer), device: dev.clone(), dtype })
    }

    fn prompt_ids(&self, prompt: &str, voice: &str) -> Result<Vec<u32>> {
        let text = format!("{voice}: {prompt}");
        let encoding = self.tokenizer.encode(text, true).map_err(anyhow::Error::msg)?;
        let mut ids = Vec::with_capacity(encoding.len() + 5);
        ids.push(START_OF_HUMAN);
        ids.extend_from_slice(encoding.get_ids());
        ids.extend_from_slice(&[END_OF_TEXT, END_OF_HUMAN, START_OF_AI, START_OF_SPEECH]);
        Ok(ids)
    }
}

fn sampling(params: &SpeechParams) -> Sampling {
    if params.temperature <= 0. {
        Sampling::ArgMax
    } else if params.top_p <= 0. || params.top_p >= 1. {
        Sampling::All { temperature: params.temperature }
    } else {
        Sampling::TopP { p: params.top_p, temperature: params.temperature }
    }
}

fn time_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(299792458)
}

impl SpeechGenerator for OrpheusLm {
    fn generate_speech(&self, params: &SpeechParams) -> Result<TokenIter> {
        let tokens = self.prompt_ids(&params.prompt, &params.voice)?;
        let cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let seed = params.seed.unwrap_or_else(time_seed);
        tracing::debug!(prompt_len = tokens.len(), seed, "starting generation");
        Ok(Box::new(SpeechTokens {
            model: self.model.clone(),
            cache,
            tokenizer: self.tokenizer.clone(),
            device: self.device.clone(),
            logits_processor: LogitsProcessor::from_sampling(seed, sampling(params)),
            tokens,
            index_pos: 0,
            generated: 0,
            max_tokens: params.max_tokens,
            stop_token_ids: params.stop_token_ids.clone(),
            repetition_penalty: params.repetition_penalty,
            done: false,
        }))
    }
}

struct SpeechTokens {
    model: Llama,
    cache: Cache,
    tokenizer: Arc<tokenizers::Tokenizer>,
    device: Device,
    logits_processor: LogitsProcessor,
    tokens: Vec<u32>,
    index_pos: usize,
    generated: usize,
    max_tokens: usize,
    stop_token_ids: Vec<u32>,
    repetition_penalty: f32,
    done: bool,
}

impl SpeechTokens {
    fn step(&mut self) -> Result<Option<String>> {
        if self.generated >= self.max_tokens {
            return Ok(None);
        }
        let start = Instant::now();
        let ctx_start = if self.index_pos == 0 { 0 } else { self.tokens.len() - 1 };
        let ctx_len = self.tokens.len() - ctx_start;
        let input = Tensor::new(&self.tokens[ctx_start..], &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, self.index_pos, &mut self.cache)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        let logits = if self.repetition_penalty == 1. {
            logits
        } else {
            let from = self.tokens.len().saturating_sub(REPEAT_LAST_N);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repetition_penalty,
                &self.tokens[from..],
            )?
        };
        self.index_pos += ctx_len;
        let next = self.logits_processor.sample(&logits)?;
        self.generated += 1;
        self.tokens.push(next);
        crate::metrics::lm::STEP_DURATION.observe(start.elapsed().as_secs_f64());
        crate::metrics::lm::GENERATED_TOKENS.inc();
        if self.stop_token_ids.contains(&next) {
            tracing::debug!(generated = self.generated, "stop token");
            return Ok(None);
        }
        Ok(Some(self.tokenizer.id_to_token(next).unwrap_or_default()))
    }
}

impl Iterator for SpeechTokens {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f64, top_p: f64) -> SpeechParams {
        SpeechParams {
            prompt: "hello".to_string(),
            voice: "tara".to_string(),
            repetition_penalty: 1.1,
            stop_token_ids: vec![128258],
            max_tokens: 2000,
            temperature,
            top_p,
            seed: None,
        }
    }

    #[test]
    fn sampling_selection() {
        assert!(matches!(sampling(&params(0., 0.9)), Sampling::ArgMax));
        assert!(matches!(sampling(&params(0.4, 1.0)), Sampling::All { .. }));
        match sampling(&params(0.4, 0.9)) {
            Sampling::TopP { p, temperature } => {
                assert_eq!(p, 0.9);
                assert_eq!(temperature, 0.4);
            }
            _ => panic!("expected top-p sampling"),
        }
    }
}
