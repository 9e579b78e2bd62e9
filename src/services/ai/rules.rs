use async_trait::async_trait;

use super::{new_tool_call_id, GenerationRequest, LlmProvider, ModelChunk, ModelStream, ToolCall};
use crate::services::policy::{ConversationPolicy, PolicyDecision};

/// Offline provider that follows the booking policy directly instead of
/// asking a model. Replies are streamed word by word.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyProvider;

impl PolicyProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmProvider for PolicyProvider {
    async fn stream(&self, request: GenerationRequest<'_>) -> anyhow::Result<ModelStream> {
        let decision = ConversationPolicy::new(request.today).plan(request.messages);

        let chunks: Vec<ModelChunk> = match decision {
            PolicyDecision::CallTools(calls) => calls
                .into_iter()
                .map(|call| {
                    ModelChunk::ToolCall(ToolCall {
                        id: new_tool_call_id(),
                        name: call.tool.as_str().to_string(),
                        arguments: call.input,
                    })
                })
                .collect(),
            PolicyDecision::Reply(text) => text
                .split_inclusive(' ')
                .map(|word| ModelChunk::TextDelta(word.to_string()))
                .collect(),
        };

        Ok(Box::pin(tokio_stream::iter(chunks.into_iter().map(Ok))))
    }
}
