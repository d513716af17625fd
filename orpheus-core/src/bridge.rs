// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Runs the streaming decoder next to a blocking token source.
//!
//! A dedicated thread pulls tokens, feeds the [`StreamingDecoder`] and pushes the
//! resulting chunks into a bounded queue. The consumer side, [`AudioStream`], can be
//! drained either as a blocking [`Iterator`] or as an async [`Stream`]. The queue
//! closing is the end-of-stream marker.

use crate::codec::AudioCodec;
use crate::error::{BoxError, Error};
use crate::scheduler::{StreamSummary, StreamingDecoder};
use crate::Result;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Starts decoding `tokens` on a worker thread.
///
/// At most `capacity` chunks are buffered, past that the worker blocks which in
/// turn stops pulling tokens.
pub fn stream_audio<I, E>(
    tokens: I,
    codec: Arc<dyn AudioCodec>,
    capacity: usize,
) -> Result<AudioStream>
where
    I: IntoIterator<Item = std::result::Result<String, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    stream_with_decoder(tokens, StreamingDecoder::new(codec), capacity)
}

pub fn stream_with_decoder<I, E>(
    tokens: I,
    decoder: StreamingDecoder,
    capacity: usize,
) -> Result<AudioStream>
where
    I: IntoIterator<Item = std::result::Result<String, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let worker = std::thread::Builder::new().name("orpheus-audio".to_string()).spawn(move || {
        let mut decoder = decoder;
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pump(tokens, &mut decoder, &tx)
        }));
        if res.is_err() {
            tracing::error!("audio worker panicked");
            let _ = tx.blocking_send(Err(Error::WorkerPanicked));
        }
        let summary = decoder.finish();
        tracing::info!(?summary, "audio stream done");
        summary
    })?;
    Ok(AudioStream { rx, worker: Some(worker) })
}

fn pump<I, E>(tokens: I, decoder: &mut StreamingDecoder, tx: &mpsc::Sender<Result<Vec<u8>>>)
where
    I: IntoIterator<Item = std::result::Result<String, E>>,
    E: Into<BoxError> + 'static,
{
    for token in tokens {
        if tx.is_closed() {
            tracing::debug!("audio consumer went away");
            return;
        }
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                let err = Error::Upstream(err.into());
                tracing::error!(?err, "token source failed");
                let _ = tx.blocking_send(Err(err));
                return;
            }
        };
        match decoder.offer_token(&token) {
            Ok(None) => {}
            Ok(Some(chunk)) => {
                if tx.blocking_send(Ok(chunk)).is_err() {
                    tracing::debug!("audio consumer went away");
                    return;
                }
            }
            Err(err) => {
                tracing::error!(?err, "audio decoding failed");
                let _ = tx.blocking_send(Err(err));
                return;
            }
        }
    }
}

/// PCM chunks produced by [`stream_audio`].
///
/// An `Err` item is always the last one. Dropping the stream stops the worker and
/// joins its thread.
pub struct AudioStream {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    worker: Option<std::thread::JoinHandle<StreamSummary>>,
}

impl AudioStream {
    /// Stops the worker and waits for it, returning its counters.
    ///
    /// This blocks and must not be called from an async context.
    pub fn close(mut self) -> Result<StreamSummary> {
        self.rx.close();
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| Error::WorkerPanicked),
            None => Ok(StreamSummary::default()),
        }
    }
}

impl Iterator for AudioStream {
    type Item = Result<Vec<u8>>;

    /// Blocks until the next chunk, panics if called from an async context.
    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}

impl Stream for AudioStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn join_worker(worker: std::thread::JoinHandle<StreamSummary>) {
    match worker.join() {
        Ok(summary) => tracing::debug!(?summary, "audio worker joined"),
        Err(_) => tracing::error!("audio worker panicked"),
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(worker) = self.worker.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || join_worker(worker));
                }
                Err(_) => join_worker(worker),
            }
        }
    }
}
