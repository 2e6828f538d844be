use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Incremental completion text, one item per delta received from the provider.
pub type DeltaStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of a `POST /chat/completions` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    // Depends on the model. Ex: 'stop' | 'length' | 'content_filter' | 'tool_calls'
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponseContainer {
    error: ErrorResponse,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// The outbound calls the runner needs from a completion provider.
///
/// Every method is a single attempt: implementations must not retry.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Opens a streamed completion. Errors that happen after the stream is
    /// open are yielded as items of the returned stream.
    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<DeltaStream>;

    async fn list_models(&self) -> Result<Vec<String>>;
}

/// `ApiClient` talks to an OpenAI compatible chat completion API.
pub struct ApiClient {
    // Base URL without the trailing endpoint, ex: https://api.openai.com/v1
    api: String,
    api_key: String,
    client: Client,
}

impl ApiClient {
    pub fn new(api: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(ApiClient {
            api: api.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    async fn post_chat(&self, request: &ChatRequest) -> Result<Response> {
        let url = format!("{}/chat/completions", self.api);
        debug!(%url, model = %request.model, stream = request.stream, "sending chat completion request");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl Provider for ApiClient {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post_chat(request).await?;
        let response_text = response.text().await?;
        Ok(serde_json::from_str(&response_text)?)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let request = ChatRequest {
            stream: true,
            ..request.clone()
        };
        let response = self.post_chat(&request).await?;
        Ok(delta_stream(response.bytes_stream()))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.api);
        debug!(%url, "listing models");

        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        let models: ModelList = check_status(response).await?.json().await?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

/// Turns a non-2xx response into `Error::Api`, preferring the provider's own
/// error message when the body is an OpenAI style error envelope.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());
    let message = match serde_json::from_str::<ErrorResponseContainer>(&body) {
        Ok(container) => container.error.message,
        Err(_) => body,
    };
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent event body into `data:` payloads.
///
/// Bytes are buffered until a full line is available so that multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    // a final line without a trailing newline
    fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    // comments, `event:` and `id:` lines carry nothing we use
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        None
    } else if payload == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

struct DeltaState {
    body: BoxStream<'static, Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl DeltaState {
    fn queue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(json) => match decode_chunk(&json) {
                    Ok(Some(text)) => self.pending.push_back(Ok(text)),
                    Ok(None) => {}
                    Err(e) => {
                        self.pending.push_back(Err(e));
                        self.finished = true;
                    }
                },
            }
        }
    }
}

fn decode_chunk(json: &str) -> Result<Option<String>> {
    let chunk: ChatChunk = serde_json::from_str(json)?;
    let choice = chunk.choices.into_iter().next().ok_or(Error::EmptyStreamChunk)?;
    Ok(choice.delta.content.filter(|c| !c.is_empty()))
}

/// Decodes a streamed chat completion body into its text deltas.
///
/// The stream ends at the `[DONE]` marker, at the end of the body, or right
/// after the first error it yields.
pub fn delta_stream<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let body: BoxStream<'static, Result<Vec<u8>>> = body
        .map(|item| item.map(|b| b.as_ref().to_vec()).map_err(Into::into))
        .boxed();
    let state = DeltaState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(&bytes);
                    state.queue(events);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(e));
                    state.finished = true;
                }
                None => {
                    let events = state.decoder.finish().into_iter().collect();
                    state.queue(events);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(chunks: &[&str]) -> Vec<std::result::Result<Vec<u8>, Error>> {
        chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect()
    }

    async fn collect(chunks: &[&str]) -> Vec<Result<String>> {
        delta_stream(stream::iter(sse(chunks))).collect().await
    }

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn request_omits_unset_sampling_fields() {
        let request = ChatRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![Message::user("hi")],
            stream: false,
            temperature: None,
            top_p: Some(0.7),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("temperature").is_none());
        assert!(body.get("stream").is_none());
        assert!((body["top_p"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(
            decoder.push(b":1}\n\n: keep-alive\ndata: [DONE]\n"),
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let line = "data: héllo\n".as_bytes();
        let mut decoder = SseDecoder::default();
        // split inside the two byte 'é'
        assert!(decoder.push(&line[..8]).is_empty());
        assert_eq!(
            decoder.push(&line[8..]),
            vec![SseEvent::Data("héllo".to_string())]
        );
    }

    #[tokio::test]
    async fn deltas_arrive_in_order_and_stop_at_done() {
        let first = delta("Hello");
        let second = delta(", ");
        let third = delta("world");
        let ignored = delta("ignored");
        let items = collect(&[
            first.as_str(),
            second.as_str(),
            third.as_str(),
            "data: [DONE]\n\n",
            ignored.as_str(),
        ])
        .await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hello", ", ", "world"]);
    }

    #[tokio::test]
    async fn role_only_chunks_are_skipped() {
        let role = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        let text = delta("hi");
        let items = collect(&[role, text.as_str()]).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "hi");
    }

    #[tokio::test]
    async fn malformed_chunk_ends_stream_with_decode_error() {
        let first = delta("Hello");
        let late = delta("late");
        let items = collect(&[first.as_str(), "data: {not json\n\n", late.as_str()]).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hello");
        assert!(matches!(items[1], Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn chunk_without_choices_is_an_error() {
        let items = collect(&["data: {\"choices\":[]}\n\n"]).await;
        assert!(matches!(items.as_slice(), [Err(Error::EmptyStreamChunk)]));
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_decoded() {
        let last = delta("end");
        let items = collect(&[last.trim_end()]).await;
        assert_eq!(items[0].as_ref().unwrap(), "end");
    }

    // A one-connection HTTP server: answers with `status` and `body`, and
    // hands back the raw request it received.
    async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api = format!("http://{}/v1", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (api, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![Message::user("hello")],
            stream: false,
            temperature: None,
            top_p: None,
        }
    }

    #[tokio::test]
    async fn unauthorized_uses_error_envelope_message() {
        let body = r#"{"error":{"message":"bad key","type":"invalid_request_error"}}"#.to_string();
        let (api, server) = serve_once("401 Unauthorized", "application/json", body).await;

        let client = ApiClient::new(api, "sk-x").unwrap();
        let err = client.chat_completion(&chat_request()).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::Api { status: 401, message } if message == "bad key"
        ));
        assert_eq!(err.to_string(), "API request failed with status 401: bad key");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /v1/chat/completions "));
        assert!(request.contains("authorization: bearer sk-x\r\n"));
    }

    #[tokio::test]
    async fn server_error_keeps_plain_body() {
        let (api, server) =
            serve_once("500 Internal Server Error", "text/plain", "upstream exploded".to_string()).await;

        let client = ApiClient::new(api, "sk-x").unwrap();
        let err = client.chat_completion(&chat_request()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Api { status: 500, ref message } if message == "upstream exploded"
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn completion_body_is_decoded() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Paris"}, "finish_reason": "stop"}]
        })
        .to_string();
        let (api, server) = serve_once("200 OK", "application/json", body).await;

        let client = ApiClient::new(format!("{api}/"), "sk-x").unwrap();
        let response = client.chat_completion(&chat_request()).await.unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("Paris"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));

        let request = server.await.unwrap();
        let (_, sent) = request.split_once("\r\n\r\n").unwrap();
        let sent: serde_json::Value = serde_json::from_str(sent).unwrap();
        assert_eq!(sent["model"], "gpt-3.5-turbo");
        assert_eq!(sent["messages"][0]["content"], "hello");
        assert!(sent.get("stream").is_none());
    }

    #[tokio::test]
    async fn models_listing_decodes_ids() {
        let body = serde_json::json!({
            "object": "list",
            "data": [
                {"id": "gpt-4", "object": "model", "owned_by": "openai"},
                {"id": "o1-mini", "object": "model", "owned_by": "openai"}
            ]
        })
        .to_string();
        let (api, server) = serve_once("200 OK", "application/json", body).await;

        let client = ApiClient::new(api, "sk-x").unwrap();
        let ids = client.list_models().await.unwrap();
        assert_eq!(ids, vec!["gpt-4", "o1-mini"]);

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /v1/models "));
        assert!(request.contains("authorization: bearer sk-x\r\n"));
    }

    #[tokio::test]
    async fn streamed_body_yields_deltas() {
        let body = format!("{}{}data: [DONE]\n\n", delta("Hello"), delta(", world"));
        let (api, server) = serve_once("200 OK", "text/event-stream", body).await;

        let client = ApiClient::new(api, "sk-x").unwrap();
        let deltas = client.chat_completion_stream(&chat_request()).await.unwrap();
        let texts: Vec<String> = deltas.map(|d| d.unwrap()).collect().await;
        assert_eq!(texts, vec!["Hello", ", world"]);

        let request = server.await.unwrap();
        assert!(request.contains(r#""stream":true"#));
    }

    #[tokio::test]
    async fn stream_open_rejection_is_an_api_error() {
        let body = r#"{"error":{"message":"bad key"}}"#.to_string();
        let (api, server) = serve_once("401 Unauthorized", "application/json", body).await;

        let client = ApiClient::new(api, "sk-x").unwrap();
        let err = client.chat_completion_stream(&chat_request()).await.err().unwrap();
        assert!(matches!(err, Error::Api { status: 401, .. }));
        server.await.unwrap();
    }
}
