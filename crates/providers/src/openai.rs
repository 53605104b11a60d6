use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use voxnav_core::types::ActionStep;

use crate::client::build_http_client;
use crate::{Reasoner, ReasoningError, ReasoningRequest};

const SYSTEM_PROMPT: &str = r#"You control a web browser for a user who speaks commands aloud.
Translate the command into browser steps. Reply with a JSON object {"steps": [...]} and nothing else.
Each step is one of:
  {"action": "navigate", "url": "https://..."}
  {"action": "click", "selector": "<css or text=Label>", "expect": {"type": "url_contains" | "text_visible", "value": "..."}}
  {"action": "type", "selector": "<css or text=Label>", "text": "...", "expect": {...}}
  {"action": "wait", "condition": {"type": "selector" | "text" | "url_contains", "value": "..."}, "timeout_ms": 5000}
  {"action": "extract", "selector": "<css or text=Label>"}
"expect" is optional and names what becomes visible once the step took effect.
Prefer text=Label selectors built from the visible labels you are given.
If the command cannot be carried out in a browser, reply {"steps": []}."#;

/// Plans steps with an OpenAI-compatible chat completions endpoint.
pub struct ChatReasoner {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: f32,
}

impl ChatReasoner {
    pub fn new(
        api_key: &str,
        api_base: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
        proxy: Option<&str>,
        no_proxy: &[String],
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        let client = build_http_client(proxy, no_proxy, &api_base, timeout);
        Self {
            client,
            api_key: api_key.to_string(),
            api_base,
            model: model.to_string(),
            temperature,
        }
    }

    fn user_message(request: &ReasoningRequest) -> String {
        let page = serde_json::to_string(&request.page).unwrap_or_else(|_| "{}".to_string());
        format!("Command: {}\nCurrent page: {}", request.transcript, page)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanReply {
    steps: Vec<ActionStep>,
}

/// Strip a markdown code fence some models wrap around JSON.
fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Accepts `{"steps": [...]}` or a bare array of steps.
pub(crate) fn parse_plan_reply(content: &str) -> Result<Vec<ActionStep>, ReasoningError> {
    let body = strip_fence(content);
    if let Ok(reply) = serde_json::from_str::<PlanReply>(body) {
        return Ok(reply.steps);
    }
    serde_json::from_str::<Vec<ActionStep>>(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        ReasoningError::Malformed(format!("{} in reply {:?}", e, preview))
    })
}

fn map_send_error(e: reqwest::Error) -> ReasoningError {
    if e.is_timeout() {
        ReasoningError::Timeout(e.to_string())
    } else {
        ReasoningError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl Reasoner for ChatReasoner {
    async fn plan(&self, request: &ReasoningRequest) -> Result<Vec<ActionStep>, ReasoningError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT.to_string() },
                ChatMessage { role: "user", content: Self::user_message(request) },
            ],
            temperature: self.temperature,
            response_format: serde_json::json!({"type": "json_object"}),
        };

        info!(url = %url, model = %self.model, "Calling reasoning model");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let raw = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            warn!(status = %status, "Reasoning API error");
            let snippet: String = raw.chars().take(300).collect();
            return Err(ReasoningError::Unreachable(format!("API error {}: {}", status, snippet)));
        }

        let chat: ChatResponse = serde_json::from_str(&raw)
            .map_err(|e| ReasoningError::Malformed(format!("failed to parse response: {}", e)))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ReasoningError::Malformed("no choices in response".to_string()))?;
        debug!(reply = %content, "Reasoning reply");

        parse_plan_reply(&content)
    }

    fn name(&self) -> &str {
        "openai-chat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxnav_core::types::PageState;

    #[test]
    fn test_parse_wrapped_and_bare_replies() {
        let steps = parse_plan_reply(r#"{"steps": [{"action": "navigate", "url": "https://example.com"}]}"#).unwrap();
        assert_eq!(steps, vec![ActionStep::navigate("https://example.com")]);

        let fenced = "```json\n[{\"action\": \"click\", \"selector\": \"text=Login\"}]\n```";
        assert_eq!(parse_plan_reply(fenced).unwrap(), vec![ActionStep::click("text=Login")]);

        assert!(parse_plan_reply(r#"{"steps": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_reply() {
        assert!(matches!(parse_plan_reply("I can't do that"), Err(ReasoningError::Malformed(_))));
        assert!(matches!(
            parse_plan_reply(r#"{"steps": [{"action": "fly"}]}"#),
            Err(ReasoningError::Malformed(_))
        ));
        assert!(!ReasoningError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn test_user_message_carries_page_state() {
        let msg = ChatReasoner::user_message(&ReasoningRequest {
            transcript: "log me in".into(),
            page: PageState {
                url: Some("https://example.com".into()),
                title: Some("Example".into()),
                labels: vec!["Sign in".into()],
            },
        });
        assert!(msg.starts_with("Command: log me in"));
        assert!(msg.contains("Sign in"));
    }
}
