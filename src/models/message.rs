use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation turn as exchanged with the chat client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            parts,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            MessagePart::Tool(inv) => Some(inv),
            _ => None,
        })
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPart", into = "RawPart")]
pub enum MessagePart {
    Text(String),
    Tool(ToolInvocation),
    /// Part types this service does not interpret (reasoning, step markers, files).
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub state: ToolState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolState {
    InputAvailable,
    OutputAvailable(Value),
    OutputError(String),
}

impl ToolInvocation {
    pub fn output(&self) -> Option<&Value> {
        match &self.state {
            ToolState::OutputAvailable(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.state, ToolState::InputAvailable)
    }
}

const TOOL_PART_PREFIX: &str = "tool-";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_text: Option<String>,
}

impl RawPart {
    fn bare(kind: String) -> Self {
        Self {
            kind,
            text: None,
            tool_call_id: None,
            state: None,
            input: None,
            output: None,
            error_text: None,
        }
    }
}

impl TryFrom<RawPart> for MessagePart {
    type Error = String;

    fn try_from(raw: RawPart) -> Result<Self, Self::Error> {
        if raw.kind == "text" {
            return Ok(MessagePart::Text(raw.text.unwrap_or_default()));
        }

        let Some(tool_name) = raw.kind.strip_prefix(TOOL_PART_PREFIX) else {
            return Ok(MessagePart::Other(raw.kind));
        };

        let tool_call_id = raw
            .tool_call_id
            .ok_or_else(|| format!("{} part is missing toolCallId", raw.kind))?;

        let state = match raw.state.as_deref() {
            Some("output-available") => ToolState::OutputAvailable(raw.output.unwrap_or(Value::Null)),
            Some("output-error") => ToolState::OutputError(raw.error_text.unwrap_or_default()),
            _ => ToolState::InputAvailable,
        };

        Ok(MessagePart::Tool(ToolInvocation {
            tool_call_id,
            tool_name: tool_name.to_string(),
            input: raw.input.unwrap_or_else(|| Value::Object(Default::default())),
            state,
        }))
    }
}

impl From<MessagePart> for RawPart {
    fn from(part: MessagePart) -> Self {
        match part {
            MessagePart::Text(text) => RawPart {
                text: Some(text),
                ..RawPart::bare("text".to_string())
            },
            MessagePart::Other(kind) => RawPart::bare(kind),
            MessagePart::Tool(inv) => {
                let mut raw = RawPart {
                    tool_call_id: Some(inv.tool_call_id),
                    input: Some(inv.input),
                    ..RawPart::bare(format!("{TOOL_PART_PREFIX}{}", inv.tool_name))
                };
                match inv.state {
                    ToolState::InputAvailable => raw.state = Some("input-available".into()),
                    ToolState::OutputAvailable(output) => {
                        raw.state = Some("output-available".into());
                        raw.output = Some(output);
                    }
                    ToolState::OutputError(error) => {
                        raw.state = Some("output-error".into());
                        raw.error_text = Some(error);
                    }
                }
                raw
            }
        }
    }
}
