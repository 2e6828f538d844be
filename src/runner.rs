use std::sync::Arc;

use tracing::{debug, info};

use crate::api::{ApiClient, ChatRequest, Message, Provider};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::result::{CompletionResult, CompletionStream};

pub const GPT3_MODEL: &str = "gpt-3.5-turbo";
pub const GPT4_MODEL: &str = "gpt-4-turbo-preview";

// Total width of the model listing grid
const GRID_WIDTH: usize = 80;

/// `Runner` turns a resolved `Config` into exactly one provider call.
pub struct Runner {
    config: Config,
    provider: Arc<dyn Provider>,
}

impl Runner {
    pub fn new(config: Config, provider: Arc<dyn Provider>) -> Self {
        Runner { config, provider }
    }

    /// Builds a runner backed by the HTTP `ApiClient`.
    pub fn from_config(config: Config) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(Error::NoApiKey)?;
        let client = ApiClient::new(config.api.as_str(), api_key)?;
        Ok(Runner::new(config, Arc::new(client)))
    }

    /// Performs the single request of this invocation.
    ///
    /// Without streaming the returned result is complete. With streaming it is
    /// returned as soon as the producer task is started: its `stream` must be
    /// drained, and failures of the upstream call only show up when it is
    /// (see [`CompletionStream`]).
    ///
    /// # Returns:
    /// - `Err(Error::NoApiKey)` or `Err(Error::NoPrompt)` before anything is sent.
    /// - the provider's error, unchanged, when a blocking call fails.
    /// - `Err(Error::NoChoices)` when a blocking completion has no choices.
    pub async fn run(&self) -> Result<CompletionResult> {
        if self.config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(Error::NoApiKey);
        }

        let model = resolve_model(self.config.model.as_deref(), self.config.gpt4).to_string();
        debug!(%model, "resolved model");

        if self.config.list_models {
            return self.list_models(model).await;
        }

        let request = build_request(&self.config, &model)?;
        let mut result = CompletionResult::new(model, self.config.prompt.as_str());

        if self.config.stream {
            let provider = Arc::clone(&self.provider);
            result.stream = Some(CompletionStream::spawn(async move {
                provider.chat_completion_stream(&request).await
            }));
        } else {
            let response = self.provider.chat_completion(&request).await?;
            let choice = response.choices.into_iter().next().ok_or(Error::NoChoices)?;
            if let Some(reason) = &choice.finish_reason {
                debug!(finish_reason = %reason, "completion finished");
            }
            result.completion = choice.message.content.unwrap_or_default();
        }

        Ok(result)
    }

    async fn list_models(&self, model: String) -> Result<CompletionResult> {
        let ids = self.provider.list_models().await?;
        info!(count = ids.len(), "listed models");

        let listing = render_models(&ids);
        let mut result = CompletionResult::new(model, self.config.prompt.as_str());
        if self.config.stream {
            result.stream = Some(CompletionStream::from_text(listing));
        } else {
            result.completion = listing;
        }
        Ok(result)
    }
}

/// An explicit model wins over `gpt4`, which wins over the GPT-3.5 default.
pub fn resolve_model(model: Option<&str>, gpt4: bool) -> &str {
    match model {
        Some(model) if !model.is_empty() => model,
        _ if gpt4 => GPT4_MODEL,
        _ => GPT3_MODEL,
    }
}

/// Builds the chat request: an optional system message holding every system
/// line, then the prompt as the user message.
///
/// Temperature and top-p are only sent when set to something other than
/// zero, so an explicit `0` cannot be requested.
pub fn build_request(config: &Config, model: &str) -> Result<ChatRequest> {
    let mut messages = Vec::new();

    // Blank lines in the middle are kept, they can separate paragraphs.
    if config.system.iter().any(|line| !line.is_empty()) {
        messages.push(Message::system(config.system.join("\n")));
    }
    if !config.prompt.is_empty() {
        messages.push(Message::user(config.prompt.as_str()));
    }
    if messages.is_empty() {
        return Err(Error::NoPrompt);
    }

    Ok(ChatRequest {
        model: model.to_string(),
        messages,
        stream: false,
        temperature: config.temperature.filter(|t| *t != 0.0),
        top_p: config.top_p.filter(|p| *p != 0.0),
    })
}

/// Groups model ids under "GPT Models", "O1 Models" and "Other Models" and
/// lays each group out in columns. Empty groups are left out.
pub fn render_models(ids: &[String]) -> String {
    let mut gpt = Vec::new();
    let mut o1 = Vec::new();
    let mut other = Vec::new();
    for id in ids {
        if id.starts_with("gpt") || id.starts_with("chatgpt") {
            gpt.push(id.as_str());
        } else if id.starts_with("o1") {
            o1.push(id.as_str());
        } else {
            other.push(id.as_str());
        }
    }

    let mut out = String::new();
    for (heading, mut names) in [("GPT Models", gpt), ("O1 Models", o1), ("Other Models", other)] {
        if names.is_empty() {
            continue;
        }
        names.sort_unstable();
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(heading);
        out.push_str(":\n");
        out.push_str(&grid(&names));
    }
    out
}

fn grid(names: &[&str]) -> String {
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0) + 2;
    let columns = (GRID_WIDTH / width).max(1);

    let mut out = String::new();
    for row in names.chunks(columns) {
        let line: String = row.iter().map(|name| format!("{name:<width$}")).collect();
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
