//! OpenAI-compatible chat completions backend (OpenAI, Groq, vLLM, Ollama)

use super::{FragmentStream, Generation, GenerationParams, TextGenerator};
use crate::config::GenerationConfig;
use crate::context::{ChatMessage, ContextWindow};
use crate::embed::parse_base_url;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;
use url::Url;

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Generator backed by a `/chat/completions` endpoint
pub struct OpenAiGenerator {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let endpoint = parse_base_url(&config.url)?
            .join("chat/completions")
            .map_err(|e| Error::Config(format!("Invalid generation URL: {}", e)))?;
        // Whole-request timeouts are applied by the caller so streams can run long
        let client = Client::builder()
            .connect_timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key(),
        })
    }

    async fn send(
        &self,
        window: &ContextWindow,
        params: &GenerationParams,
        stream: bool,
    ) -> Result<Response> {
        let request = CompletionRequest {
            model: &params.model,
            messages: window.to_chat_messages(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(
            "Requesting completion from {} ({} messages, stream={})",
            self.endpoint,
            request.messages.len(),
            stream
        );

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("{}: {}", status, body.trim())));
        }
        Ok(response)
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        window: &ContextWindow,
        params: &GenerationParams,
    ) -> Result<Generation> {
        let response = self.send(window, params, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("malformed response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Generation("response contained no choices".to_string()))?;

        Ok(Generation {
            text,
            model: parsed.model.unwrap_or_else(|| params.model.clone()),
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }

    async fn generate_stream(
        &self,
        window: &ContextWindow,
        params: &GenerationParams,
    ) -> Result<FragmentStream> {
        let response = self.send(window, params, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_fragments(bytes))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn a server-sent event byte stream into content fragments
fn sse_fragments(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> FragmentStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                        if let Err(e) = state.accept_line(&line) {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(Error::Generation(format!("stream error: {}", e))), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.finished = true;
                    if let Err(e) = state.accept_line(&rest) {
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
    .boxed()
}

impl SseState {
    fn accept_line(&mut self, raw: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(raw);
        let Some(data) = line.trim().strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(());
        }
        if data == DONE_MARKER {
            self.finished = true;
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| Error::Generation(format!("malformed stream event: {}", e)))?;
        self.pending.extend(
            chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .filter(|c| !c.is_empty()),
        );
        Ok(())
    }
}
