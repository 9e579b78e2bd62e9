//! Client-side helper for Rust consumers of `/api/chat`. The server never
//! navigates; a client replays the message history it holds and asks this
//! tracker which payment URLs it still has to open.

use std::collections::HashSet;

use crate::models::ChatMessage;
use crate::services::tools::{CheckoutOutput, ToolName};

/// Tracks which checkout results already triggered a navigation, so a
/// client re-rendering the same history redirects at most once per result.
#[derive(Debug, Default)]
pub struct CheckoutRedirects {
    seen: HashSet<String>,
}

impl CheckoutRedirects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payment URLs from successful checkouts in `messages` that have not
    /// been returned before.
    pub fn pending(&mut self, messages: &[ChatMessage]) -> Vec<String> {
        let mut urls = Vec::new();
        for message in messages {
            for inv in message.tool_invocations() {
                if inv.tool_name != ToolName::CreateCheckoutSession.as_str() {
                    continue;
                }
                let Some(url) = inv
                    .output()
                    .and_then(|o| serde_json::from_value::<CheckoutOutput>(o.clone()).ok())
                    .filter(|o| o.success)
                    .and_then(|o| o.url)
                else {
                    continue;
                };
                if self.seen.insert(format!("{}-{}", message.id, inv.tool_call_id)) {
                    urls.push(url);
                }
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessagePart, ToolInvocation, ToolState};
    use serde_json::json;

    fn checkout(call_id: &str, output: serde_json::Value) -> MessagePart {
        MessagePart::Tool(ToolInvocation {
            tool_call_id: call_id.into(),
            tool_name: "createCheckoutSession".into(),
            input: json!({}),
            state: ToolState::OutputAvailable(output),
        })
    }

    #[test]
    fn test_redirects_once_per_result() {
        let mut history = vec![
            ChatMessage::user("confirmo"),
            ChatMessage::assistant(vec![
                checkout("c1", json!({"success": true, "url": "https://pay/cs_1", "checkoutSessionId": "cs_1"})),
                checkout("c2", json!({"success": false, "error": "Duplicate booking"})),
            ]),
        ];

        let mut redirects = CheckoutRedirects::new();
        assert_eq!(redirects.pending(&history), vec!["https://pay/cs_1"]);
        assert!(redirects.pending(&history).is_empty());

        history.push(ChatMessage::assistant(vec![checkout(
            "c3",
            json!({"success": true, "url": "https://pay/cs_2", "checkoutSessionId": "cs_2"}),
        )]));
        assert_eq!(redirects.pending(&history), vec!["https://pay/cs_2"]);
    }
}
