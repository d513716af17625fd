// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use anyhow::Result;
use axum::response::IntoResponse;
use candle::Device;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

mod engine;
mod logging;
mod metrics;
mod tts;
mod utils;

#[derive(clap::Parser, Debug)]
struct WorkerArgs {
    #[clap(short = 'l', long = "log", default_value = "info")]
    log_level: String,

    #[clap(short = 'a', long = "addr", default_value = "0.0.0.0")]
    addr: String,

    #[clap(short = 'p', long = "port", default_value = "9090")]
    port: u16,

    #[clap(long)]
    cpu: bool,

    #[clap(long)]
    config: String,

    #[clap(long)]
    silent: bool,

    /// Maximum size of each log file in MB before rotation (default: 100)
    #[clap(long, default_value = "100")]
    log_max_size_mb: u64,

    /// Maximum number of rotated log files to keep (default: 10)
    #[clap(long, default_value = "10")]
    log_max_files: usize,

    /// Use JSON structured logging
    #[clap(long)]
    json: bool,

    /// Console log style: compact, pretty, or verbose (default: pretty)
    #[clap(long, default_value = "pretty")]
    log_style: String,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Validate { configs: Vec<String> },
    Worker(WorkerArgs),
}

#[derive(clap::Parser, Debug)]
#[clap(name = "orpheus-server", about = "Streaming Orpheus text-to-speech server")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

fn default_queue_capacity() -> usize {
    orpheus::bridge::DEFAULT_QUEUE_CAPACITY
}

fn default_max_concurrent_requests() -> usize {
    1
}

fn default_request_timeout_s() -> f64 {
    360.
}

fn default_voice() -> String {
    "tara".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TtsConfig {
    pub lm_model_files: Vec<String>,
    pub lm_config_file: String,
    pub text_tokenizer_file: String,
    pub codec_model_file: String,
    pub codec_config_file: String,
    pub dtype_override: Option<String>,
    /// Audio chunks buffered between the decoder thread and the response body.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: f64,
    #[serde(default = "tts::builtin_voices")]
    pub voices: Vec<tts::VoiceInfo>,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default)]
    pub generation: tts::GenerationConfig,
}

fn default_warmup_enabled() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_warmup_enabled")]
    pub enabled: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self { enabled: default_warmup_enabled() }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub log_dir: String,
    pub instance_name: String,
    #[serde(default)]
    pub warmup: WarmupConfig,
    pub tts: TtsConfig,
}

impl Config {
    fn parse(config: &str) -> Result<Self> {
        let config: Self = toml::from_str(config)?;
        let tts = &config.tts;
        if tts.lm_model_files.is_empty() {
            anyhow::bail!("tts.lm_model_files cannot be empty")
        }
        if tts.queue_capacity == 0 {
            anyhow::bail!("tts.queue_capacity must be positive")
        }
        if tts.request_timeout_s <= 0. {
            anyhow::bail!("tts.request_timeout_s must be positive")
        }
        Ok(config)
    }

    pub fn load<P: AsRef<std::path::Path>>(p: P) -> Result<Self> {
        use utils::resolve_or_download as rod;
        let config = std::fs::read_to_string(p)?;
        let mut config = Self::parse(&config)?;
        let c = &mut config.tts;
        for f in c.lm_model_files.iter_mut() {
            *f = rod(f)?
        }
        c.lm_config_file = rod(&c.lm_config_file)?;
        c.text_tokenizer_file = rod(&c.text_tokenizer_file)?;
        c.codec_model_file = rod(&c.codec_model_file)?;
        c.codec_config_file = rod(&c.codec_config_file)?;
        config.log_dir = rod(&config.log_dir)?;
        config.instance_name = rod(&config.instance_name)?;
        Ok(config)
    }
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Runs the model once so device kernels are ready before the first request.
fn warmup(cfg: &WarmupConfig, model: &tts::Model) -> Result<()> {
    use crate::metrics::warmup as warmup_metrics;

    if !cfg.enabled {
        tracing::info!("warmup disabled");
        warmup_metrics::SKIPPED.inc();
        return Ok(());
    }
    let start = Instant::now();
    let res = model.warmup();
    let elapsed = start.elapsed();
    warmup_metrics::DURATION.observe(elapsed.as_secs_f64());
    match &res {
        Ok(()) => {
            warmup_metrics::SUCCESS.inc();
            tracing::info!(?elapsed, "warmup done");
        }
        Err(err) => {
            warmup_metrics::FAILURE.inc();
            tracing::error!(?err, ?elapsed, "warmup failed");
        }
    }
    res
}

struct AppStateInner {
    started: Instant,
    started_at: String,
    voices: usize,
    max_concurrent_requests: usize,
}

type AppState = Arc<AppStateInner>;

impl AppStateInner {
    fn new(config: &Config) -> Self {
        Self {
            started: Instant::now(),
            started_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            voices: config.tts.voices.len(),
            max_concurrent_requests: config.tts.max_concurrent_requests,
        }
    }
}

/// Configuration for log rotation
struct LogConfig {
    log_dir: String,
    instance_name: String,
    log_level: String,
    silent: bool,
    max_size_mb: u64,
    max_files: usize,
    json: bool,
    log_style: logging::LogStyle,
}

fn tracing_init(config: LogConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use std::io::IsTerminal;
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::time::ChronoLocal;
    use tracing_subscriber::prelude::*;

    let build_info = utils::BuildInfo::new();

    std::fs::create_dir_all(&config.log_dir)?;

    // Rotated files are named log.instance, log.instance.1, log.instance.2, etc.
    let log_path =
        std::path::Path::new(&config.log_dir).join(format!("log.{}", config.instance_name));
    let condition = RollingConditionBase::new().daily().max_size(config.max_size_mb * 1024 * 1024);
    let file_appender = RollingFileAppenderBase::new(log_path, condition, config.max_files)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::filter::LevelFilter::from_str(&config.log_level)?;
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    let file_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer.clone())
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_writer(non_blocking_file)
            .with_filter(filter.clone())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .event_format(
                tracing_subscriber::fmt::format()
                    .with_timer(timer.clone())
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_ansi(false),
            )
            .with_writer(non_blocking_file)
            .with_filter(filter.clone())
            .boxed()
    };

    if config.silent {
        tracing_subscriber::registry().with(file_layer).init();
    } else {
        let console_layer = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_writer(std::io::stdout)
                .with_filter(filter)
                .boxed()
        } else {
            let use_ansi = std::io::stdout().is_terminal();
            let formatter =
                logging::ConsoleFormatter::new(timer, config.log_style).with_ansi(use_ansi);
            tracing_subscriber::fmt::layer()
                .with_ansi(use_ansi)
                .event_format(formatter)
                .with_writer(std::io::stdout)
                .with_filter(filter)
                .boxed()
        };
        tracing_subscriber::registry().with(file_layer).with(console_layer).init();
    }

    tracing::info!(?build_info);
    tracing::info!(
        log_dir = %config.log_dir,
        max_size_mb = config.max_size_mb,
        max_files = config.max_files,
        json = config.json,
        "logging initialized with rotation"
    );

    Ok(guard)
}

async fn metrics() -> axum::response::Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    };
    ([(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
        .into_response()
}

async fn build_info() -> impl IntoResponse {
    utils::WrapJson(Ok(utils::BuildInfo::new()))
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    #[derive(serde::Serialize)]
    struct HealthResponse {
        status: &'static str,
        uptime_seconds: u64,
    }

    axum::Json(HealthResponse { status: "ok", uptime_seconds: state.started.elapsed().as_secs() })
}

async fn server_status(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    #[derive(serde::Serialize)]
    struct StatusResponse {
        status: &'static str,
        uptime_seconds: u64,
        started_at: String,
        build: utils::BuildInfo,
        voices: usize,
        max_concurrent_requests: usize,
        active_requests: f64,
    }

    axum::Json(StatusResponse {
        status: "healthy",
        uptime_seconds: state.started.elapsed().as_secs(),
        started_at: state.started_at.clone(),
        build: utils::BuildInfo::new(),
        voices: state.voices,
        max_concurrent_requests: state.max_concurrent_requests,
        active_requests: metrics::tts::ACTIVE_REQUESTS.get(),
    })
}

fn app(state: AppState, model: Arc<tts::Model>) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(server_status))
        .route("/api/build_info", get(build_info))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(tts::router(model))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::request_id::SetRequestIdLayer::x_request_id(
                    tower_http::request_id::MakeRequestUuid,
                ))
                .layer(tower_http::trace::TraceLayer::new_for_http()),
        )
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // Errors returned from the tokio main function do not always end the process when
    // background tasks are still alive, so exit explicitly.
    if let Err(err) = main_().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn main_() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = <Args as clap::Parser>::parse();
    match args.command {
        Command::Validate { configs } => {
            tracing_subscriber::fmt().init();
            for config in configs.iter() {
                let _ = Config::load(config)?;
                tracing::info!(?config, "loaded succesfully")
            }
        }
        Command::Worker(args) => {
            let config = Config::load(&args.config)?;

            if std::env::var("RUST_LOG").is_err() {
                std::env::set_var("RUST_LOG", format!("{},hyper=info,mio=info", args.log_level))
            }
            let log_style = args.log_style.parse().unwrap_or_else(|e: String| {
                eprintln!("Warning: {e}, using 'pretty'");
                logging::LogStyle::Pretty
            });
            let log_config = LogConfig {
                log_dir: config.log_dir.clone(),
                instance_name: config.instance_name.clone(),
                log_level: args.log_level.clone(),
                silent: args.silent,
                max_size_mb: args.log_max_size_mb,
                max_files: args.log_max_files,
                json: args.json,
                log_style,
            };
            let _guard = tracing_init(log_config)?;

            let startup_span = tracing::info_span!("startup");
            let enter = startup_span.enter();

            let version = utils::BuildInfo::new().git_describe();
            tracing::info!(
                "{} v{version}",
                owo_colors::OwoColorize::bold(&"orpheus-server")
            );
            let num_workers = tokio::runtime::Handle::current().metrics().num_workers();
            let dev = device(args.cpu)?;
            tracing::info!(num_workers, ?dev, "starting worker");

            let model = Arc::new(tts::Model::load(&config.tts, &dev)?);
            warmup(&config.warmup, &model)?;
            let state = Arc::new(AppStateInner::new(&config));
            drop(enter);

            let app = app(state, model);
            let sock_addr = std::net::SocketAddr::from((
                std::net::IpAddr::from_str(args.addr.as_str())
                    .unwrap_or(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
                args.port,
            ));
            tracing::info!("listening on {}", sock_addr);
            let listener = tokio::net::TcpListener::bind(sock_addr).await?;
            axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
                .await?
        }
    }
    Ok(())
}
