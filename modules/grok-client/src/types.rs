use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "grok-4-latest";

/// System preamble sent with every structured-JSON request.
pub const SYSTEM_PROMPT: &str = "You are a precise assistant. Follow the user's instructions \
exactly. When asked for JSON, output ONLY valid JSON with no markdown, no prose, and no extra keys.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Live Search controls. `excluded_websites` is capped server-side; hosts
/// beyond the cap must be spilled into the prompt text by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchParameters {
    pub mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub excluded_websites: Vec<String>,
}

impl SearchParameters {
    pub fn on() -> Self {
        Self {
            mode: "on".to_string(),
            excluded_websites: Vec::new(),
        }
    }

    pub fn with_excluded_websites(mut self, hosts: Vec<String>) -> Self {
        self.excluded_websites = hosts;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_parameters: Option<SearchParameters>,
}

impl ChatRequest {
    /// Standard system + user pair with the given sampling temperature.
    pub fn structured(user_content: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(user_content),
            ],
            temperature: Some(temperature),
            stream: false,
            search_parameters: None,
        }
    }

    pub fn with_search(mut self, params: SearchParameters) -> Self {
        self.search_parameters = Some(params);
        self
    }

    /// Outbound payload guard. The upstream rejects empty message content
    /// with an opaque 400; catching builder bugs here keeps that failure
    /// attributable to the caller, not the network.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.len() < 2 {
            return Err("messages cannot be empty".to_string());
        }
        let system_count = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .count();
        let user_count = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        if system_count < 1 || user_count < 1 {
            return Err("missing system or user message".to_string());
        }
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err("message content cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_request_has_system_and_user() {
        let req = ChatRequest::structured("find companies", 0.2);
        assert!(req.validate().is_ok());
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, MessageRole::System);
        assert_eq!(req.messages[1].role, MessageRole::User);
    }

    #[test]
    fn validate_rejects_empty_content() {
        let mut req = ChatRequest::structured("query", 0.2);
        req.messages[1].content = "   ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_user_message() {
        let req = ChatRequest {
            model: DEFAULT_MODEL.to_string(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT)],
            temperature: None,
            stream: false,
            search_parameters: None,
        };
        assert!(req.validate().is_err());
    }
}
