use std::future::Future;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{Config, Environment, Options};
use crate::logging;
use crate::output::{self, OutputMode};
use crate::runner::Runner;

/// One of the binaries built from this crate.
#[derive(Debug)]
pub struct Tool {
    pub name: &'static str,
    pub about: &'static str,
    /// Which output flag wins when several are given
    pub output_precedence: &'static [OutputMode],
}

pub const AIX: Tool = Tool {
    name: "aix",
    about: "AIx is a cli tool to interact with Large Language Model (LLM) APIs.",
    output_precedence: &[OutputMode::Json, OutputMode::Verbose],
};

pub const MANX: Tool = Tool {
    name: "manx",
    about: "manx is a cli tool to query Large Language Model (LLM) APIs from the shell.",
    output_precedence: &[OutputMode::Verbose, OutputMode::Json, OutputMode::Silent],
};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// Stopped by Ctrl+C or SIGTERM. A blocking stdin read may still be
    /// pending, so the caller should exit the process right away.
    Interrupted,
}

/// Runs one invocation of `tool` with the process arguments.
///
/// An interrupt stops reading stdin or the in-flight request and ends the
/// process normally.
pub async fn run(tool: &Tool) -> Result<Outcome> {
    let options = Options::parse_as(tool.name, tool.about);
    if let Err(e) = logging::init(options.verbose, options.silent) {
        eprintln!("could not initialize logging: {}", e);
    }

    let outcome = until_interrupted(invoke(tool, options), shutdown_signal()).await?;
    if outcome == Outcome::Interrupted {
        println!("\r- Ctrl+C pressed in Terminal, Exiting...");
    }
    Ok(outcome)
}

/// Drives `work` to completion unless `interrupt` resolves first.
pub async fn until_interrupted<W, I>(work: W, interrupt: I) -> Result<Outcome>
where
    W: Future<Output = Result<()>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        res = work => res.map(|()| Outcome::Finished),
        _ = interrupt => Ok(Outcome::Interrupted),
    }
}

async fn invoke(tool: &Tool, options: Options) -> Result<()> {
    let name = tool.name;
    // stdin is read on a blocking thread so an interrupt is noticed meanwhile
    let environment = tokio::task::spawn_blocking(move || Environment::from_process(name))
        .await?
        .context("couldn't read stdin")?;
    let config = Config::resolve(options, &environment)?;
    execute(tool, config).await
}

async fn execute(tool: &Tool, config: Config) -> Result<()> {
    let mode = OutputMode::resolve(tool.output_precedence, config.output_flags());
    let output_path = config.output.clone();
    debug!(tool = tool.name, ?mode, "dispatching");

    let runner = Runner::from_config(config)?;
    let mut result = runner
        .run()
        .await
        .with_context(|| format!("Could not run {}", tool.name))?;

    let mut stdout = tokio::io::stdout();
    let rendered = output::render(mode, &mut result, &mut stdout).await;
    if let Some(path) = &output_path {
        output::save(mode, &result, path).await?;
    }
    rendered
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no handler, never resolve
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
