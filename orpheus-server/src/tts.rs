// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use crate::engine::{OrpheusLm, SpeechGenerator, SpeechParams};
use crate::metrics::codec as codec_metrics;
use crate::metrics::tts as tts_metrics;
use crate::utils::AxumResult;
use anyhow::Result;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use candle::{Device, Tensor};
use futures_util::{Stream, StreamExt};
use orpheus::codec::{decode_window, AudioCodec, Snac, CHUNK_BYTES};
use orpheus::frame::FRAME_SIZE;
use orpheus::scheduler::WINDOW_FRAMES;
use orpheus::AudioStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_PROMPT: &str = "Hey there, looks like you forgot to provide a prompt!";
const NO_JSON: &str = "No JSON data provided.";

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VoiceInfo {
    pub name: String,
    pub description: String,
    pub language: String,
    pub gender: String,
    pub accent: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

pub fn builtin_voices() -> Vec<VoiceInfo> {
    let voice = |name: &str, description: &str, gender: &str| VoiceInfo {
        name: name.to_string(),
        description: description.to_string(),
        language: "en".to_string(),
        gender: gender.to_string(),
        accent: "american".to_string(),
        preview_url: None,
    };
    vec![
        voice("tara", "A warm, friendly female voice with natural expressiveness", "female"),
        voice("zoe", "A bright, cheerful female voice with expressive delivery", "female"),
        voice("jess", "A warm, friendly female voice with expressive delivery", "female"),
        voice("zac", "A warm, friendly male voice with expressive delivery", "male"),
    ]
}

fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_stop_token_ids() -> Vec<u32> {
    vec![128258]
}
fn default_max_tokens() -> usize {
    2000
}
fn default_temperature() -> f64 {
    0.4
}
fn default_top_p() -> f64 {
    0.9
}

/// Sampling parameters used when a request does not set them.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_stop_token_ids")]
    pub stop_token_ids: Vec<u32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            repetition_penalty: default_repetition_penalty(),
            stop_token_ids: default_stop_token_ids(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

/// Wraps a codec to record decode latency and failures.
pub struct MeteredCodec<C> {
    inner: C,
}

impl<C: AudioCodec> MeteredCodec<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: AudioCodec> AudioCodec for MeteredCodec<C> {
    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn decode(&self, codes: &[&Tensor]) -> candle::Result<Tensor> {
        let start = Instant::now();
        let res = self.inner.decode(codes);
        match &res {
            Ok(_) => codec_metrics::DECODE_DURATION.observe(start.elapsed().as_secs_f64()),
            Err(_) => codec_metrics::DECODE_ERRORS.inc(),
        }
        res
    }
}

pub struct Model {
    generator: Arc<dyn SpeechGenerator>,
    codec: Arc<dyn AudioCodec>,
    voices: Vec<VoiceInfo>,
    default_voice: String,
    generation: GenerationConfig,
    queue_capacity: usize,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Model {
    pub fn load(config: &crate::TtsConfig, dev: &Device) -> Result<Self> {
        let codec = Snac::load(&config.codec_model_file, &config.codec_config_file, dev)?;
        tracing::info!(sample_rate = codec.sample_rate(), "loaded snac codec");
        let lm = OrpheusLm::new(config, dev)?;
        Ok(Self::new(Arc::new(lm), Arc::new(MeteredCodec::new(codec)), config))
    }

    pub fn new(
        generator: Arc<dyn SpeechGenerator>,
        codec: Arc<dyn AudioCodec>,
        config: &crate::TtsConfig,
    ) -> Self {
        Self {
            generator,
            codec,
            voices: config.voices.clone(),
            default_voice: config.default_voice.clone(),
            generation: config.generation.clone(),
            queue_capacity: config.queue_capacity,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            request_timeout: Duration::from_secs_f64(config.request_timeout_s),
        }
    }

    /// Runs one short generation step and a full decoder window.
    pub fn warmup(&self) -> Result<()> {
        let mut params = self.params(Some("hello".to_string()), None);
        params.max_tokens = FRAME_SIZE;
        params.seed = Some(42);
        for token in self.generator.generate_speech(&params)? {
            token?;
        }
        let window: Vec<i64> =
            (0..WINDOW_FRAMES * FRAME_SIZE).map(|i| 1 + (i % FRAME_SIZE) as i64 * 100).collect();
        match decode_window(self.codec.as_ref(), &window)? {
            Some(chunk) if chunk.len() == CHUNK_BYTES => Ok(()),
            Some(chunk) => anyhow::bail!("unexpected warmup chunk length {}", chunk.len()),
            None => anyhow::bail!("warmup window rejected"),
        }
    }

    fn params(&self, prompt: Option<String>, voice: Option<String>) -> SpeechParams {
        let g = &self.generation;
        SpeechParams {
            prompt: prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            voice: voice.unwrap_or_else(|| self.default_voice.clone()),
            repetition_penalty: g.repetition_penalty,
            stop_token_ids: g.stop_token_ids.clone(),
            max_tokens: g.max_tokens,
            temperature: g.temperature,
            top_p: g.top_p,
            seed: None,
        }
    }

    /// Starts a speech stream, or returns `None` if no permit frees up before the
    /// request deadline.
    async fn stream(&self, params: SpeechParams) -> Result<Option<MeteredAudio>> {
        tts_metrics::REQUESTS.inc();
        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started) + self.request_timeout;
        if !self.voices.iter().any(|v| v.name == params.voice) {
            tracing::debug!(voice = %params.voice, "voice is not in the configured list");
        }
        let acquire = self.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout_at(deadline, acquire).await {
            Ok(permit) => permit?,
            Err(_) => {
                tracing::warn!("speech request timed out waiting for a slot");
                tts_metrics::TIMEOUTS.inc();
                return Ok(None);
            }
        };
        tracing::info!(voice = %params.voice, chars = params.prompt.len(), "starting speech");
        let tokens = self.generator.generate_speech(&params)?;
        let audio = orpheus::stream_audio(tokens, self.codec.clone(), self.queue_capacity)?;
        Ok(Some(MeteredAudio::new(audio, permit, started, deadline)))
    }
}

/// Audio body of a single request.
///
/// Holds the concurrency permit until dropped and ends the body once the request
/// timeout expires.
pub struct MeteredAudio {
    audio: AudioStream,
    _permit: OwnedSemaphorePermit,
    deadline: Pin<Box<tokio::time::Sleep>>,
    started: Instant,
    chunks: usize,
    bytes: usize,
    done: bool,
}

impl MeteredAudio {
    fn new(
        audio: AudioStream,
        permit: OwnedSemaphorePermit,
        started: Instant,
        deadline: tokio::time::Instant,
    ) -> Self {
        tts_metrics::ACTIVE_REQUESTS.inc();
        Self {
            audio,
            _permit: permit,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            started,
            chunks: 0,
            bytes: 0,
            done: false,
        }
    }
}

impl Stream for MeteredAudio {
    type Item = orpheus::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::warn!(chunks = this.chunks, "speech request timed out");
            tts_metrics::TIMEOUTS.inc();
            this.done = true;
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.audio).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.chunks == 0 {
                    tts_metrics::TIME_TO_FIRST_CHUNK.observe(this.started.elapsed().as_secs_f64());
                }
                this.chunks += 1;
                this.bytes += chunk.len();
                tts_metrics::CHUNKS.inc();
                Poll::Ready(Some(Ok(Bytes::from(chunk))))
            }
            Poll::Ready(Some(Err(err))) => {
                tracing::error!(?err, "speech stream failed");
                tts_metrics::STREAM_ERRORS.inc();
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredAudio {
    fn drop(&mut self) {
        tts_metrics::ACTIVE_REQUESTS.dec();
        let audio_s = self.bytes as f64 / 2. / orpheus::wav::SAMPLE_RATE as f64;
        tts_metrics::AUDIO_DURATION.observe(audio_s);
        if !self.done {
            tracing::debug!("speech consumer went away");
        }
        tracing::info!(
            chunks = self.chunks,
            audio_s,
            elapsed_s = self.started.elapsed().as_secs_f64(),
            "speech done"
        );
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TtsQuery {
    prompt: Option<String>,
    voice: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SpeechRequest {
    input: Option<String>,
    voice: Option<String>,
    repetition_penalty: Option<f32>,
    stop_token_ids: Option<Vec<u32>>,
    max_tokens: Option<usize>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    seed: Option<u64>,
}

impl SpeechRequest {
    fn into_params(self, model: &Model) -> SpeechParams {
        let mut params = model.params(self.input, self.voice);
        if let Some(v) = self.repetition_penalty {
            params.repetition_penalty = v
        }
        if let Some(v) = self.stop_token_ids {
            params.stop_token_ids = v
        }
        if let Some(v) = self.max_tokens {
            params.max_tokens = v
        }
        if let Some(v) = self.temperature {
            params.temperature = v
        }
        if let Some(v) = self.top_p {
            params.top_p = v
        }
        params.seed = self.seed;
        params
    }
}

fn busy() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, [(header::CONTENT_TYPE, "text/plain")], "Server busy.")
        .into_response()
}

fn bad_request(msg: String) -> Response {
    tts_metrics::REJECTED_REQUESTS.inc();
    (StatusCode::BAD_REQUEST, [(header::CONTENT_TYPE, "text/plain")], msg).into_response()
}

async fn tts(State(model): State<Arc<Model>>, Query(q): Query<TtsQuery>) -> AxumResult<Response> {
    tracing::debug!("handling tts query {q:?}");
    let params = model.params(q.prompt, q.voice);
    let audio = match model.stream(params).await? {
        Some(audio) => audio,
        None => return Ok(busy()),
    };
    let wav = orpheus::wav::wav_header(0);
    let body = futures_util::stream::once(async move { Ok(Bytes::copy_from_slice(&wav)) })
        .chain(audio);
    Ok(([(header::CONTENT_TYPE, "audio/wav")], Body::from_stream(body)).into_response())
}

async fn speech_stream(State(model): State<Arc<Model>>, body: Bytes) -> AxumResult<Response> {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return Ok(bad_request(NO_JSON.to_string())),
    };
    match &value {
        serde_json::Value::Object(map) if !map.is_empty() => {}
        _ => return Ok(bad_request(NO_JSON.to_string())),
    }
    let req: SpeechRequest = match serde_json::from_value(value) {
        Ok(req) => req,
        Err(err) => return Ok(bad_request(format!("Invalid request: {err}"))),
    };
    tracing::debug!("handling speech stream request {req:?}");
    let params = req.into_params(&model);
    let audio = match model.stream(params).await? {
        Some(audio) => audio,
        None => return Ok(busy()),
    };
    Ok(([(header::CONTENT_TYPE, "audio/pcm")], Body::from_stream(audio)).into_response())
}

#[derive(Debug, serde::Serialize)]
struct VoicesResponse<'a> {
    voices: &'a [VoiceInfo],
    default: &'a str,
    count: usize,
}

async fn voices(State(model): State<Arc<Model>>) -> Response {
    let resp = VoicesResponse {
        voices: &model.voices,
        default: &model.default_voice,
        count: model.voices.len(),
    };
    axum::Json(resp).into_response()
}

pub fn router(model: Arc<Model>) -> axum::Router<()> {
    axum::Router::new()
        .route("/tts", axum::routing::get(tts))
        .route("/v1/audio/speech/stream", axum::routing::post(speech_stream))
        .route("/api/voices", axum::routing::get(voices))
        .with_state(model)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Emits `max_tokens` tokens that all decode to codebook index 1.
    #[derive(Default)]
    pub(crate) struct FakeGenerator {
        pub last: Mutex<Option<SpeechParams>>,
        pub token_delay: Option<Duration>,
    }

    impl SpeechGenerator for FakeGenerator {
        fn generate_speech(&self, params: &SpeechParams) -> Result<crate::engine::TokenIter> {
            *self.last.lock().unwrap() = Some(params.clone());
            let delay = self.token_delay;
            let tokens = (0..params.max_tokens).map(move |p| {
                if let Some(delay) = delay {
                    std::thread::sleep(delay)
                }
                Ok(format!("<custom_token_{}>", 11 + (p % FRAME_SIZE) * 4096))
            });
            Ok(Box::new(tokens))
        }
    }

    pub(crate) struct ZeroCodec {
        device: Device,
        fail: bool,
    }

    impl ZeroCodec {
        pub fn new() -> Self {
            Self { device: Device::Cpu, fail: false }
        }

        pub fn failing() -> Self {
            Self { device: Device::Cpu, fail: true }
        }
    }

    impl AudioCodec for ZeroCodec {
        fn device(&self) -> &Device {
            &self.device
        }

        fn decode(&self, codes: &[&Tensor]) -> candle::Result<Tensor> {
            if self.fail {
                candle::bail!("codec is broken")
            }
            let frames = codes[0].dim(1)?;
            Tensor::zeros((1, 1, frames * 2048), candle::DType::F32, &self.device)
        }
    }

    pub(crate) fn test_config() -> crate::TtsConfig {
        crate::TtsConfig {
            lm_model_files: vec![],
            lm_config_file: String::new(),
            text_tokenizer_file: String::new(),
            codec_model_file: String::new(),
            codec_config_file: String::new(),
            dtype_override: None,
            queue_capacity: 4,
            max_concurrent_requests: 1,
            request_timeout_s: 30.,
            voices: builtin_voices(),
            default_voice: "tara".to_string(),
            generation: GenerationConfig::default(),
        }
    }

    fn app(generator: Arc<FakeGenerator>, codec: ZeroCodec, cfg: &crate::TtsConfig) -> axum::Router {
        router(Arc::new(Model::new(generator, Arc::new(MeteredCodec::new(codec)), cfg)))
    }

    async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, String, Result<Bytes>) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await;
        (status, content_type, body.map_err(anyhow::Error::from))
    }

    fn post(json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/audio/speech/stream")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn tts_streams_wav_with_defaults() {
        let generator = Arc::new(FakeGenerator::default());
        let mut cfg = test_config();
        cfg.generation.max_tokens = 21;
        let (status, ct, body) = send(app(generator.clone(), ZeroCodec::new(), &cfg), get("/tts")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct, "audio/wav");
        let body = body.unwrap();
        assert_eq!(&body[..4], b"RIFF");
        assert_eq!(body.len(), 44 + 3 * CHUNK_BYTES);
        let params = generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(params.prompt, DEFAULT_PROMPT);
        assert_eq!(params.voice, "tara");
        assert_eq!(params.stop_token_ids, [128258]);
        assert_eq!(params.repetition_penalty, 1.1);
        assert_eq!(params.temperature, 0.4);
        assert_eq!(params.top_p, 0.9);
    }

    #[tokio::test]
    async fn tts_query_selects_prompt_and_voice() {
        let generator = Arc::new(FakeGenerator::default());
        let mut cfg = test_config();
        cfg.generation.max_tokens = 6;
        let req = get("/tts?prompt=good%20morning&voice=zac");
        let (status, _, body) = send(app(generator.clone(), ZeroCodec::new(), &cfg), req).await;
        assert_eq!(status, StatusCode::OK);
        // Less than a frame: header only.
        assert_eq!(body.unwrap().len(), 44);
        let params = generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(params.prompt, "good morning");
        assert_eq!(params.voice, "zac");
    }

    #[tokio::test]
    async fn speech_stream_returns_raw_pcm() {
        let generator = Arc::new(FakeGenerator::default());
        let app = app(generator.clone(), ZeroCodec::new(), &test_config());
        let req = post(r#"{"input": "hi", "voice": "zoe", "max_tokens": 14, "top_p": 0.5, "seed": 7}"#);
        let (status, ct, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct, "audio/pcm");
        assert_eq!(body.unwrap().len(), 2 * CHUNK_BYTES);
        let params = generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(params.prompt, "hi");
        assert_eq!(params.voice, "zoe");
        assert_eq!(params.top_p, 0.5);
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.temperature, 0.4);
    }

    #[tokio::test]
    async fn speech_stream_requires_json() {
        for body in ["", "{}", "null", "not json"] {
            let app = app(Arc::new(FakeGenerator::default()), ZeroCodec::new(), &test_config());
            let (status, _, resp) = send(app, post(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body:?}");
            assert_eq!(resp.unwrap(), NO_JSON.as_bytes(), "{body:?}");
        }
    }

    #[tokio::test]
    async fn speech_stream_rejects_bad_fields() {
        let app = app(Arc::new(FakeGenerator::default()), ZeroCodec::new(), &test_config());
        let (status, _, _) = send(app, post(r#"{"max_tokens": "many"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn voices_are_listed() {
        let app = app(Arc::new(FakeGenerator::default()), ZeroCodec::new(), &test_config());
        let (status, _, body) = send(app, get("/api/voices")).await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body.unwrap()).unwrap();
        assert_eq!(v["default"], "tara");
        assert_eq!(v["count"], 4);
        let names: Vec<_> = v["voices"].as_array().unwrap().iter().map(|v| v["name"].clone()).collect();
        assert_eq!(names, ["tara", "zoe", "jess", "zac"]);
        assert_eq!(v["voices"][3]["gender"], "male");
    }

    #[tokio::test]
    async fn permit_is_released_after_each_request() {
        let mut cfg = test_config();
        cfg.generation.max_tokens = 7;
        let app = app(Arc::new(FakeGenerator::default()), ZeroCodec::new(), &cfg);
        for _ in 0..3 {
            let (status, _, body) = send(app.clone(), get("/tts")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.unwrap().len(), 44 + CHUNK_BYTES);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_timeout_ends_the_body() {
        let generator = Arc::new(FakeGenerator {
            last: Mutex::new(None),
            token_delay: Some(Duration::from_millis(1)),
        });
        let mut cfg = test_config();
        cfg.generation.max_tokens = usize::MAX;
        cfg.request_timeout_s = 0.2;
        let start = Instant::now();
        let (status, _, body) = send(app(generator, ZeroCodec::new(), &cfg), get("/tts")).await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!((body.len() - 44) % CHUNK_BYTES, 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_request_times_out_waiting_for_a_slot() {
        let generator = Arc::new(FakeGenerator {
            last: Mutex::new(None),
            token_delay: Some(Duration::from_millis(1)),
        });
        let mut cfg = test_config();
        cfg.generation.max_tokens = usize::MAX;
        cfg.request_timeout_s = 0.3;
        let app = app(generator, ZeroCodec::new(), &cfg);
        // The unread body keeps the only permit.
        let held = app.clone().oneshot(get("/tts")).await.unwrap();
        assert_eq!(held.status(), StatusCode::OK);
        let start = Instant::now();
        let (status, _, body) = send(app, get("/tts")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.unwrap(), "Server busy.".as_bytes());
        assert!(start.elapsed() < Duration::from_secs(10));
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn codec_failure_aborts_the_body() {
        let mut cfg = test_config();
        cfg.generation.max_tokens = 14;
        let app = app(Arc::new(FakeGenerator::default()), ZeroCodec::failing(), &cfg);
        let (status, _, body) = send(app, get("/tts")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_err());
    }

    #[test]
    fn metered_codec_counts_failures() {
        let codec = MeteredCodec::new(ZeroCodec::failing());
        let before = codec_metrics::DECODE_ERRORS.get();
        let window: Vec<i64> = (1..=7).collect();
        assert!(decode_window(&codec, &window).is_err());
        assert!(codec_metrics::DECODE_ERRORS.get() > before);
    }

    #[test]
    fn warmup_decodes_a_full_window() {
        let model = Model::new(
            Arc::new(FakeGenerator::default()),
            Arc::new(ZeroCodec::new()),
            &test_config(),
        );
        model.warmup().unwrap();
    }
}
