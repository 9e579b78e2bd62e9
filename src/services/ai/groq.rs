use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    chat_messages, new_tool_call_id, openai_tools, parse_arguments, ArgumentFormat, GenerationRequest,
    LlmProvider, ModelChunk, ModelStream, ToolCall,
};

const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

pub struct GroqProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GroqProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for GroqProvider {
    async fn stream(&self, request: GenerationRequest<'_>) -> anyhow::Result<ModelStream> {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(request.system_prompt, request.messages, ArgumentFormat::JsonString),
            "tools": openai_tools(request.tools),
            "temperature": 0.7,
            "stream": true,
        });

        let resp = self
            .client
            .post(GROQ_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to call Groq API")?;

        let status = resp.status();
        if !status.is_success() {
            let data = resp.text().await.unwrap_or_default();
            anyhow::bail!("Groq API error ({}): {}", status, data);
        }

        Ok(completion_stream(resp.bytes_stream()))
    }
}

/// Turns a streamed chat-completions body into model chunks. Text is
/// forwarded as it arrives; tool calls are emitted once the body ends.
fn completion_stream<S, B, E>(bytes: S) -> ModelStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut events = Box::pin(bytes.eventsource());
        let mut calls = ToolCallAccumulator::default();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let _ = tx.send(Err(anyhow::anyhow!("Groq stream interrupted: {e}"))).await;
                    return;
                }
            };

            if event.data.trim() == "[DONE]" {
                break;
            }
            match serde_json::from_str::<CompletionChunk>(&event.data) {
                Ok(parsed) => {
                    for text in calls.apply(parsed) {
                        if tx.send(Ok(ModelChunk::TextDelta(text))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, payload = %event.data, "skipping malformed Groq chunk");
                }
            }
        }

        for call in calls.finish() {
            if tx.send(Ok(ModelChunk::ToolCall(call))).await.is_err() {
                return;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles tool calls streamed as fragments keyed by index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    /// Records tool-call fragments and returns any text deltas in the chunk.
    fn apply(&mut self, chunk: CompletionChunk) -> Vec<String> {
        let mut text = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                text.push(content);
            }
            for delta in choice.delta.tool_calls {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
        }
        text
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                id: call.id.unwrap_or_else(new_tool_call_id),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            })
            .collect()
    }
}
