//! Text-generation backend boundary.
//!
//! [`GenerationClient`] is the capability the API depends on; the
//! production implementation talks to any OpenAI-compatible
//! `/chat/completions` endpoint.  The client is built once at startup and
//! shared by every request.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hookscribe_common::config::Config;

/// Lazy, finite, non-restartable sequence of generated text chunks.
/// Dropping it abandons the backend call.
pub type ChunkStream = BoxStream<'static, Result<String, GenerationError>>;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("backend rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("backend reported an error: {0}")]
    Backend(String),
    #[error("backend connection failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed backend response: {0}")]
    Malformed(String),
    #[error("no chunk received within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Run the prompt and return the whole result.
    async fn generate_buffered(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Run the prompt and return the result as it is produced.
    async fn generate_streaming(&self, prompt: &str) -> Result<ChunkStream, GenerationError>;
}

// ── OpenAI-compatible backend ────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(OpenAiCompatibleClient {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        if config.generation_api_key.is_none() {
            warn!("No generation API key configured; requests go out unauthenticated");
        }
        Self::new(
            &config.generation_base_url,
            &config.generation_model,
            config.generation_api_key.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, GenerationError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!("POST {} (stream={stream}, {} prompt bytes)", self.endpoint, prompt.len());
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatibleClient {
    async fn generate_buffered(&self, prompt: &str) -> Result<String, GenerationError> {
        let resp = self.send(prompt, false).await?;
        let bytes = resp.bytes().await?;
        let completion: ChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Malformed("completion has no content".into()))
    }

    async fn generate_streaming(&self, prompt: &str) -> Result<ChunkStream, GenerationError> {
        let resp = self.send(prompt, true).await?;
        Ok(decode_event_stream(resp.bytes_stream()))
    }
}

// ── Server-Sent Events decoding ──────────────────────────────────────────

/// Incremental SSE decoder.  Bytes are buffered until a full line is
/// available, so multi-byte characters split across reads survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning the `data` payload of every completed event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.take_line(line, &mut events);
        }
        events
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.take_line(&line, &mut events);
        }
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
        events
    }

    fn take_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comments (`:`), `event:`, `id:` and `retry:` carry nothing we use.
    }
}

struct Decoding<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    body_done: bool,
    finished: bool,
}

/// Turn a chat-completions SSE byte stream into text chunks.
pub fn decode_event_stream<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = Decoding {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        body_done: false,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(data) = st.ready.pop_front() {
                if data.trim() == "[DONE]" {
                    st.finished = true;
                    return None;
                }
                match parse_chunk(&data) {
                    Ok(Some(text)) => return Some((Ok(text), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }

            if st.body_done {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let events = st.decoder.push(&bytes);
                    st.ready.extend(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(GenerationError::Transport(e)), st));
                }
                None => {
                    st.body_done = true;
                    let events = st.decoder.finish();
                    st.ready.extend(events);
                }
            }
        }
    })
    .boxed()
}

/// Text carried by one streamed chunk, `None` for chunks without content
/// (role announcements, finish markers).
fn parse_chunk(data: &str) -> Result<Option<String>, GenerationError> {
    let chunk: ChatChunk =
        serde_json::from_str(data).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(GenerationError::Backend(message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

// ─── tests ───────────────────────────────────────────────────────────────
