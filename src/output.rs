use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::result::CompletionResult;

/// How a result is shown on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One JSON document on a single line
    Json,
    /// The prompt, then the completion, each behind a label
    Verbose,
    /// Only the completion, with logging turned off
    Silent,
    /// Only the completion
    Plain,
}

/// The output related flags, as given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFlags {
    pub jsonl: bool,
    pub verbose: bool,
    pub silent: bool,
}

impl OutputFlags {
    fn selects(&self, mode: OutputMode) -> bool {
        match mode {
            OutputMode::Json => self.jsonl,
            OutputMode::Verbose => self.verbose,
            OutputMode::Silent => self.silent,
            OutputMode::Plain => true,
        }
    }
}

impl OutputMode {
    /// The first mode in `precedence` whose flag is set, else `Plain`.
    pub fn resolve(precedence: &[OutputMode], flags: OutputFlags) -> OutputMode {
        precedence
            .iter()
            .copied()
            .find(|mode| flags.selects(*mode))
            .unwrap_or(OutputMode::Plain)
    }
}

/// Writes `result` to `out` in the given mode.
///
/// A streamed result is copied to `out` as it arrives; afterwards
/// `result.completion` holds the received text even when the stream failed,
/// so it can still be saved. The stream's error is returned after that.
pub async fn render<W>(mode: OutputMode, result: &mut CompletionResult, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match mode {
        OutputMode::Json => {
            // a stream is rejected together with json output, drain it anyway
            let drained = result.drain_stream_into(&mut tokio::io::sink()).await;
            let line = result.json()?;
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            drained?;
        }
        OutputMode::Verbose => {
            out.write_all(format!("[Prompt] {}\n", result.prompt).as_bytes())
                .await?;
            out.write_all(b"[Completion] ").await?;
            write_completion(result, out).await?;
        }
        OutputMode::Silent | OutputMode::Plain => write_completion(result, out).await?,
    }
    out.flush().await?;
    Ok(())
}

async fn write_completion<W>(result: &mut CompletionResult, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if result.is_streaming() {
        let drained = result.drain_stream_into(out).await;
        if !result.completion.ends_with('\n') {
            out.write_all(b"\n").await?;
        }
        drained.context("completion stream ended early")?;
    } else {
        out.write_all(result.completion.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    Ok(())
}

/// Saves the JSON document in `Json` mode, the bare completion otherwise.
pub async fn save(mode: OutputMode, result: &CompletionResult, path: &Path) -> Result<()> {
    let contents = match mode {
        OutputMode::Json => result.json()?,
        _ => result.completion.clone(),
    };
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to save output to file {}", path.display()))?;
    info!(path = %path.display(), "saved output");
    Ok(())
}
