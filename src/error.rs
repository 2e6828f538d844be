use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by configuration, dispatch and the provider client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("OPENAI_API_KEY is not configured / provided.")]
    NoApiKey,

    #[error("no prompt provided")]
    NoPrompt,

    #[error("cannot use --stream and --jsonl together")]
    IncompatibleFlags,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no data on response")]
    NoChoices,

    #[error("got empty response")]
    EmptyStreamChunk,

    #[error("stream producer stopped without reporting an outcome")]
    ProducerGone,

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to load config file {}", .path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The deferred outcome of a streamed completion that did not finish cleanly.
///
/// Whatever text arrived before the failure is kept in `partial`.
#[derive(Debug, Error)]
#[error("stream ended early after {} bytes", .partial.len())]
pub struct StreamError {
    pub partial: String,
    #[source]
    pub source: Error,
}
