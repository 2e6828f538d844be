use std::fmt;
use std::future::Future;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::api::DeltaStream;
use crate::error::{Error, Result, StreamError};

// Chunks buffered between the producer and a slow reader before the
// producer has to wait.
const STREAM_CAPACITY: usize = 32;

/// The outcome of one invocation, whether it was answered at once or streamed.
///
/// The JSON projection holds `timestamp`, `prompt`, `completion` and `model`;
/// the stream handle is never serialized.
#[derive(Debug, Serialize)]
pub struct CompletionResult {
    pub timestamp: String,
    pub prompt: String,
    pub completion: String,
    pub model: String,
    #[serde(skip)]
    pub stream: Option<CompletionStream>,
}

impl CompletionResult {
    /// An empty result stamped with the current local time.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        CompletionResult {
            timestamp: chrono::Local::now().to_string(),
            prompt: prompt.into(),
            completion: String::new(),
            model: model.into(),
            stream: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Copies the attached stream into `writer` as it arrives and stores the
    /// accumulated text in `completion`.
    ///
    /// On failure `completion` still receives whatever text arrived, and the
    /// cause is returned. Without an attached stream this does nothing.
    pub async fn drain_stream_into<W>(&mut self, writer: &mut W) -> Result<(), StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.copy_to(writer).await {
            Ok(text) => {
                self.completion = text;
                Ok(())
            }
            Err(e) => {
                self.completion = e.partial.clone();
                Err(e)
            }
        }
    }
}

/// Read side of a streamed completion.
///
/// A single background task owns the write side. It forwards every delta in
/// arrival order and closes the channel when it stops, on success or error.
/// Errors from that task are *not* raised where the stream is created: they
/// are delivered by [`CompletionStream::finish`] (or `copy_to`) after the
/// chunks are drained, together with the text received so far. Reading
/// chunks with `next_chunk` alone never shows the error, so callers that
/// need the final text must finish the stream.
pub struct CompletionStream {
    chunks: mpsc::Receiver<String>,
    outcome: oneshot::Receiver<Result<String, StreamError>>,
}

impl fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionStream").finish_non_exhaustive()
    }
}

impl CompletionStream {
    /// Spawns the producer task. `source` opens the upstream stream; a failure
    /// to open it is reported like any other stream error.
    pub fn spawn<F>(source: F) -> Self
    where
        F: Future<Output = Result<DeltaStream>> + Send + 'static,
    {
        let (tx, chunks) = mpsc::channel(STREAM_CAPACITY);
        let (outcome_tx, outcome) = oneshot::channel();

        tokio::spawn(async move {
            let mut text = String::new();
            let result = forward(source, tx, &mut text).await;
            let outcome = match result {
                Ok(()) => Ok(text),
                Err(source) => {
                    warn!(error = %source, "completion stream failed");
                    Err(StreamError {
                        partial: text,
                        source,
                    })
                }
            };
            // the reader may already be gone
            let _ = outcome_tx.send(outcome);
        });

        CompletionStream { chunks, outcome }
    }

    /// A stream that delivers already known text as a single chunk.
    pub fn from_text(text: String) -> Self {
        Self::spawn(async move { Ok(stream::once(async move { Ok::<_, Error>(text) }).boxed()) })
    }

    /// The next chunk, or `None` once the producer has closed the stream.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Drains the remaining chunks, then returns the full text or the error
    /// that stopped the producer.
    pub async fn finish(self) -> Result<String, StreamError> {
        let CompletionStream {
            mut chunks,
            outcome,
        } = self;
        while chunks.recv().await.is_some() {}
        wait_outcome(outcome).await
    }

    /// Writes each chunk to `writer` as it arrives, then finishes the stream.
    pub async fn copy_to<W>(self, writer: &mut W) -> Result<String, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let CompletionStream {
            mut chunks,
            outcome,
        } = self;

        while let Some(chunk) = chunks.recv().await {
            if let Err(e) = write_chunk(writer, &chunk).await {
                // closing our end stops the producer
                drop(chunks);
                let partial = match wait_outcome(outcome).await {
                    Ok(text) => text,
                    Err(failed) => failed.partial,
                };
                return Err(StreamError {
                    partial,
                    source: Error::Io(e),
                });
            }
        }
        wait_outcome(outcome).await
    }
}

// The sender is moved in so it is dropped, closing the channel, on every
// return path.
async fn forward<F>(source: F, tx: mpsc::Sender<String>, text: &mut String) -> Result<()>
where
    F: Future<Output = Result<DeltaStream>>,
{
    let mut deltas = source.await?;
    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        text.push_str(&delta);
        if tx.send(delta).await.is_err() {
            debug!("completion stream reader closed, stopping producer");
            break;
        }
    }
    Ok(())
}

async fn write_chunk<W>(writer: &mut W, chunk: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk.as_bytes()).await?;
    writer.flush().await
}

async fn wait_outcome(
    outcome: oneshot::Receiver<Result<String, StreamError>>,
) -> Result<String, StreamError> {
    outcome.await.unwrap_or_else(|_| {
        Err(StreamError {
            partial: String::new(),
            source: Error::ProducerGone,
        })
    })
}
