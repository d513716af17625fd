// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, labels, opts, register_counter, register_gauge, register_histogram,
    register_int_counter,
};
use prometheus::{Counter, Gauge, Histogram, IntCounter};

pub mod tts {
    use super::*;
    lazy_static! {
        pub static ref REQUESTS: Counter = register_counter!(opts!(
            "tts_requests",
            "Number of speech requests.",
            labels! {"handler" => "all",}
        ))
        .unwrap();
        pub static ref ACTIVE_REQUESTS: Gauge = register_gauge!(opts!(
            "tts_active_requests",
            "Number of speech requests currently streaming."
        ))
        .unwrap();
        pub static ref REJECTED_REQUESTS: IntCounter = register_int_counter!(
            "tts_rejected_requests_total",
            "Speech requests rejected because of invalid input."
        )
        .unwrap();
        pub static ref TIME_TO_FIRST_CHUNK: Histogram = register_histogram!(histogram_opts!(
            "tts_time_to_first_chunk_seconds",
            "Delay between the request and its first audio chunk.",
            vec![0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0],
        ))
        .unwrap();
        pub static ref CHUNKS: IntCounter =
            register_int_counter!("tts_chunks_total", "Total audio chunks streamed.").unwrap();
        pub static ref AUDIO_DURATION: Histogram = register_histogram!(histogram_opts!(
            "tts_audio_duration_seconds",
            "Seconds of audio generated per request.",
            vec![0.5, 1., 2., 5., 10., 20., 40., 80.],
        ))
        .unwrap();
        pub static ref STREAM_ERRORS: IntCounter = register_int_counter!(
            "tts_stream_errors_total",
            "Audio streams terminated by an error."
        )
        .unwrap();
        pub static ref TIMEOUTS: IntCounter = register_int_counter!(
            "tts_timeouts_total",
            "Audio streams cut by the request timeout."
        )
        .unwrap();
    }
}

pub mod codec {
    use super::*;
    lazy_static! {
        pub static ref DECODE_DURATION: Histogram = register_histogram!(histogram_opts!(
            "codec_decode_duration_seconds",
            "Neural codec decode duration distribution.",
            vec![1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 40e-3, 80e-3, 160e-3],
        ))
        .unwrap();
        pub static ref DECODE_ERRORS: IntCounter =
            register_int_counter!("codec_decode_errors_total", "Failed codec decodes.").unwrap();
    }
}

pub mod lm {
    use super::*;
    lazy_static! {
        pub static ref STEP_DURATION: Histogram = register_histogram!(histogram_opts!(
            "lm_step_duration_seconds",
            "LM sampling step duration distribution.",
            vec![5e-3, 10e-3, 15e-3, 20e-3, 30e-3, 50e-3, 100e-3, 500e-3],
        ))
        .unwrap();
        pub static ref GENERATED_TOKENS: IntCounter =
            register_int_counter!("lm_generated_tokens_total", "Total tokens sampled by the LM.")
                .unwrap();
    }
}

pub mod warmup {
    use super::*;
    lazy_static! {
        pub static ref DURATION: Histogram = register_histogram!(histogram_opts!(
            "warmup_duration_seconds",
            "Warmup duration.",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0],
        ))
        .unwrap();
        pub static ref SUCCESS: Counter = register_counter!(opts!(
            "warmup_success_total",
            "Number of successful warmup executions."
        ))
        .unwrap();
        pub static ref FAILURE: Counter =
            register_counter!(opts!("warmup_failure_total", "Number of failed warmup executions."))
                .unwrap();
        pub static ref SKIPPED: Counter = register_counter!(opts!(
            "warmup_skipped_total",
            "Number of warmup executions skipped (disabled)."
        ))
        .unwrap();
    }
}
