pub mod groq;
pub mod ollama;
pub mod rules;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::Stream;
use serde_json::{json, Value};

use crate::models::{ChatMessage, Role, ToolState};
use crate::services::tools::ToolSpec;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall(ToolCall),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelChunk>> + Send>>;

/// Everything a provider needs to produce one generation step.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub system_prompt: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    pub today: NaiveDate,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Streams one generation step: text deltas and/or tool calls.
    async fn stream(&self, request: GenerationRequest<'_>) -> anyhow::Result<ModelStream>;
}

/// How tool-call arguments are encoded in the provider's chat format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentFormat {
    /// OpenAI style: arguments are a JSON-encoded string.
    JsonString,
    /// Ollama style: arguments are an inline object.
    JsonObject,
}

/// Flattens UI messages into role/content chat messages. Resolved tool
/// invocations become an assistant `tool_calls` entry followed by one
/// `tool` message carrying the result.
pub fn chat_messages(system_prompt: &str, messages: &[ChatMessage], format: ArgumentFormat) -> Vec<Value> {
    let mut out = vec![json!({ "role": "system", "content": system_prompt })];

    for msg in messages {
        match msg.role {
            // The server owns the system prompt.
            Role::System => continue,
            Role::User => out.push(json!({ "role": "user", "content": msg.text() })),
            Role::Assistant | Role::Tool => {
                let resolved: Vec<_> = msg.tool_invocations().filter(|inv| inv.is_resolved()).collect();
                let text = msg.text();

                if resolved.is_empty() {
                    if !text.is_empty() {
                        out.push(json!({ "role": "assistant", "content": text }));
                    }
                    continue;
                }

                let calls: Vec<Value> = resolved
                    .iter()
                    .map(|inv| {
                        let arguments = match format {
                            ArgumentFormat::JsonString => Value::String(inv.input.to_string()),
                            ArgumentFormat::JsonObject => inv.input.clone(),
                        };
                        json!({
                            "id": inv.tool_call_id,
                            "type": "function",
                            "function": { "name": inv.tool_name, "arguments": arguments },
                        })
                    })
                    .collect();
                out.push(json!({ "role": "assistant", "content": text, "tool_calls": calls }));

                for inv in resolved {
                    let content = match &inv.state {
                        ToolState::OutputAvailable(output) => output.to_string(),
                        ToolState::OutputError(error) => json!({ "error": error }).to_string(),
                        ToolState::InputAvailable => continue,
                    };
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": inv.tool_call_id,
                        "name": inv.tool_name,
                        "content": content,
                    }));
                }
            }
        }
    }

    out
}

/// Tool declarations in the OpenAI function-calling shape, which Groq and
/// Ollama both accept.
pub fn openai_tools(specs: &[ToolSpec]) -> Vec<Value> {
    specs
        .iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                },
            })
        })
        .collect()
}

/// Parses tool-call arguments, keeping the raw text when it is not JSON so
/// the tool layer can report it as invalid input.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn new_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
