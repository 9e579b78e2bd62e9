//! Multi-step tool-calling loop behind the chat endpoint.
//!
//! Each step asks the model for a continuation of the conversation. Tool
//! calls it requests are executed concurrently and appended to the history
//! before the next step. The loop ends on a plain text answer or at the
//! step cap. Progress is streamed to the caller as [`ChatEvent`]s.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::models::{
    new_message_id, ChatEvent, ChatMessage, FinishMetadata, FinishReason, MessagePart, ToolInvocation, ToolState,
};
use crate::services::ai::{GenerationRequest, LlmProvider, ModelChunk, ToolCall};
use crate::services::policy::ConversationPolicy;
use crate::services::redact::TextRedactor;
use crate::services::tools::{CheckoutOutput, ToolContext, ToolName, ToolSpec, Toolbox, DUPLICATE_BOOKING};

pub const DEFAULT_MAX_STEPS: usize = 10;
pub const MAX_STEP_CEILING: usize = 25;

const EVENT_BUFFER: usize = 64;
const GENERIC_ERROR: &str = "Desculpe, ocorreu um erro ao processar sua mensagem. Tente novamente.";

/// Per-request inputs: the policy fixed at session start and the caller.
#[derive(Debug, Clone)]
pub struct Session {
    pub policy: ConversationPolicy,
    pub tools: ToolContext,
}

#[derive(Clone)]
pub struct Orchestrator {
    llm: Arc<dyn LlmProvider>,
    toolbox: Arc<Toolbox>,
    max_steps: usize,
}

/// The event receiver was dropped; nobody is listening anymore.
#[derive(Debug)]
struct Disconnected;

struct Emitter {
    tx: mpsc::Sender<ChatEvent>,
}

impl Emitter {
    async fn emit(&self, event: ChatEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }
}

enum StepOutcome {
    ToolsExecuted,
    Answered,
    Failed,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmProvider>, toolbox: Arc<Toolbox>, max_steps: usize) -> Self {
        Self {
            llm,
            toolbox,
            max_steps: max_steps.clamp(1, MAX_STEP_CEILING),
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Starts generation on its own task and returns the event stream.
    /// Dropping the stream stops generation at the next event.
    pub fn stream(&self, messages: Vec<ChatMessage>, session: Session) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();

        tokio::spawn(async move {
            let out = Emitter { tx };
            if this.run(messages, &session, &out).await.is_err() {
                tracing::info!("client disconnected, generation stopped");
            }
        });

        ReceiverStream::new(rx)
    }

    async fn run(&self, mut history: Vec<ChatMessage>, session: &Session, out: &Emitter) -> Result<(), Disconnected> {
        out.emit(ChatEvent::Start {
            message_id: new_message_id(),
        })
        .await?;

        let system_prompt = session.policy.system_prompt();
        let specs = self.toolbox.specs();
        let mut steps = 0;

        let finish_reason = loop {
            if steps == self.max_steps {
                tracing::warn!(steps, "step limit reached, ending generation");
                break FinishReason::StepLimit;
            }
            steps += 1;

            out.emit(ChatEvent::StartStep).await?;
            match self.step(&mut history, session, &system_prompt, &specs, out).await? {
                StepOutcome::ToolsExecuted => out.emit(ChatEvent::FinishStep).await?,
                StepOutcome::Answered => {
                    out.emit(ChatEvent::FinishStep).await?;
                    break FinishReason::Stop;
                }
                StepOutcome::Failed => return Ok(()),
            }
        };

        tracing::info!(steps, reason = ?finish_reason, "chat generation finished");

        out.emit(ChatEvent::Finish {
            message_metadata: FinishMetadata {
                finish_reason,
                steps,
            },
        })
        .await
    }

    async fn step(
        &self,
        history: &mut Vec<ChatMessage>,
        session: &Session,
        system_prompt: &str,
        specs: &[ToolSpec],
        out: &Emitter,
    ) -> Result<StepOutcome, Disconnected> {
        let request = GenerationRequest {
            system_prompt,
            messages: history.as_slice(),
            tools: specs,
            today: session.policy.today(),
        };

        let mut chunks = match self.llm.stream(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(error = %e, "model request failed");
                out.emit(error_event()).await?;
                return Ok(StepOutcome::Failed);
            }
        };

        let mut text = TextPart::new();
        let mut calls = Vec::new();

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(ModelChunk::TextDelta(delta)) => text.push(&delta, out).await?,
                Ok(ModelChunk::ToolCall(call)) => calls.push(call),
                Err(e) => {
                    tracing::error!(error = %e, "model stream failed");
                    out.emit(error_event()).await?;
                    return Ok(StepOutcome::Failed);
                }
            }
        }
        let text = text.finish(out).await?;

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(MessagePart::Text(text));
        }

        if calls.is_empty() {
            history.push(ChatMessage::assistant(parts));
            return Ok(StepOutcome::Answered);
        }

        for call in &calls {
            out.emit(ChatEvent::ToolInputAvailable {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input: call.arguments.clone(),
            })
            .await?;
        }

        let outputs = self.execute_all(&calls, history.as_slice(), session).await;

        for (call, output) in calls.into_iter().zip(outputs) {
            out.emit(ChatEvent::ToolOutputAvailable {
                tool_call_id: call.id.clone(),
                output: output.clone(),
            })
            .await?;
            parts.push(MessagePart::Tool(ToolInvocation {
                tool_call_id: call.id,
                tool_name: call.name,
                input: call.arguments,
                state: ToolState::OutputAvailable(output),
            }));
        }

        history.push(ChatMessage::assistant(parts));
        Ok(StepOutcome::ToolsExecuted)
    }

    /// Runs a step's tool calls. Checkouts run one after another, beside
    /// the other calls; once a checkout succeeds in this user turn any
    /// further one is refused.
    async fn execute_all(&self, calls: &[ToolCall], history: &[ChatMessage], session: &Session) -> Vec<Value> {
        let is_checkout = |call: &ToolCall| call.name == ToolName::CreateCheckoutSession.as_str();

        let others = join_all(
            calls
                .iter()
                .filter(|&call| !is_checkout(call))
                .map(|call| self.toolbox.execute(&session.tools, &call.name, &call.arguments)),
        );

        let checkouts = async {
            let mut booked = session.policy.checkout_succeeded_this_turn(history);
            let mut outputs = Vec::new();
            for call in calls.iter().filter(|&call| is_checkout(call)) {
                if booked {
                    tracing::warn!(tool_call_id = %call.id, "refusing checkout after a successful one in the same turn");
                    outputs.push(serde_json::to_value(CheckoutOutput::failed(DUPLICATE_BOOKING)).unwrap_or_default());
                    continue;
                }
                let output = self.toolbox.execute(&session.tools, &call.name, &call.arguments).await;
                booked = output.get("success").and_then(Value::as_bool) == Some(true);
                outputs.push(output);
            }
            outputs
        };

        let (others, checkouts) = futures::join!(others, checkouts);
        let (mut others, mut checkouts) = (others.into_iter(), checkouts.into_iter());
        calls
            .iter()
            .map(|call| {
                let output = if is_checkout(call) { checkouts.next() } else { others.next() };
                output.unwrap_or_default()
            })
            .collect()
    }
}

fn error_event() -> ChatEvent {
    ChatEvent::Error {
        error_text: GENERIC_ERROR.to_string(),
    }
}

/// Redacted text of one step, opened lazily on the first visible delta.
struct TextPart {
    id: String,
    open: bool,
    text: String,
    redactor: TextRedactor,
}

impl TextPart {
    fn new() -> Self {
        Self {
            id: new_message_id(),
            open: false,
            text: String::new(),
            redactor: TextRedactor::new(),
        }
    }

    async fn push(&mut self, delta: &str, out: &Emitter) -> Result<(), Disconnected> {
        let visible = self.redactor.push(delta);
        self.emit(visible, out).await
    }

    async fn finish(mut self, out: &Emitter) -> Result<String, Disconnected> {
        let rest = self.redactor.finish();
        self.emit(rest, out).await?;
        if self.open {
            out.emit(ChatEvent::TextEnd { id: self.id }).await?;
        }
        Ok(self.text)
    }

    async fn emit(&mut self, visible: String, out: &Emitter) -> Result<(), Disconnected> {
        if visible.is_empty() {
            return Ok(());
        }
        if !self.open {
            self.open = true;
            out.emit(ChatEvent::TextStart { id: self.id.clone() }).await?;
        }
        self.text.push_str(&visible);
        out.emit(ChatEvent::TextDelta {
            id: self.id.clone(),
            delta: visible,
        })
        .await
    }
}
