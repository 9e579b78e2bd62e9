use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    chat_messages, new_tool_call_id, openai_tools, parse_arguments, ArgumentFormat, GenerationRequest,
    LlmProvider, ModelChunk, ModelStream, ToolCall,
};

pub struct OllamaProvider {
    url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(url: String, model: String) -> Self {
        Self {
            url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ChatResponse {
    fn into_chunks(self) -> Vec<ModelChunk> {
        let mut chunks = Vec::new();
        if !self.message.content.is_empty() {
            chunks.push(ModelChunk::TextDelta(self.message.content));
        }
        for call in self.message.tool_calls {
            let arguments = match call.function.arguments {
                // Some models still send the OpenAI string encoding.
                Value::String(raw) => parse_arguments(&raw),
                Value::Null => json!({}),
                other => other,
            };
            chunks.push(ModelChunk::ToolCall(ToolCall {
                id: call.id.unwrap_or_else(new_tool_call_id),
                name: call.function.name,
                arguments,
            }));
        }
        chunks
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn stream(&self, request: GenerationRequest<'_>) -> anyhow::Result<ModelStream> {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(request.system_prompt, request.messages, ArgumentFormat::JsonObject),
            "tools": openai_tools(request.tools),
            "stream": false,
        });

        let resp = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .context("failed to call Ollama API")?;

        let status = resp.status();
        if !status.is_success() {
            let data = resp.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({}): {}", status, data);
        }

        let data: ChatResponse = resp
            .json()
            .await
            .context("failed to parse Ollama response")?;

        let chunks = data.into_chunks().into_iter().map(Ok);
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}
