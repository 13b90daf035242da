use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Coerce one caller-supplied entry. Non-objects and unknown roles yield `None`.
    fn coerce(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let role = obj.get("role").and_then(Value::as_str).and_then(Role::parse)?;
        let content = match obj.get("content") {
            Some(Value::String(text)) => text.clone(),
            None | Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
        };
        Some(Self { role, content })
    }
}

/// Why an inbound body was treated as empty input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDegradation {
    InvalidJson(String),
    NotAnObject,
}

/// Parsed chat request. Never fails: malformed input degrades to an empty history.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub messages: Vec<ConversationTurn>,
    pub model: String,
    pub degradation: Option<ParseDegradation>,
    /// Entries dropped during coercion
    pub dropped_turns: usize,
}

impl IncomingRequest {
    pub fn from_body(body: &[u8], default_model: &str) -> Self {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                return Self::degraded(default_model, ParseDegradation::InvalidJson(e.to_string()));
            }
        };

        let Some(obj) = value.as_object() else {
            return Self::degraded(default_model, ParseDegradation::NotAnObject);
        };

        let raw_turns = obj
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let messages: Vec<ConversationTurn> =
            raw_turns.iter().filter_map(ConversationTurn::coerce).collect();

        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default_model)
            .to_string();

        Self {
            dropped_turns: raw_turns.len() - messages.len(),
            messages,
            model,
            degradation: None,
        }
    }

    fn degraded(default_model: &str, reason: ParseDegradation) -> Self {
        Self {
            messages: Vec::new(),
            model: default_model.to_string(),
            degradation: Some(reason),
            dropped_turns: 0,
        }
    }

    /// Content of the most recent turn, or "" for an empty history.
    pub fn last_message_text(&self) -> &str {
        self.messages
            .last()
            .map(|turn| turn.content.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_MODEL: &str = "gpt-4o-mini";

    #[test]
    fn test_parses_messages_and_model() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]}"#;
        let req = IncomingRequest::from_body(body, DEFAULT_MODEL);

        assert_eq!(req.model, "gpt-4o");
        assert_eq!(
            req.messages,
            vec![
                ConversationTurn::new(Role::User, "hi"),
                ConversationTurn::new(Role::Assistant, "hello"),
            ]
        );
        assert!(req.degradation.is_none());
    }

    #[test]
    fn test_missing_model_uses_default() {
        let req = IncomingRequest::from_body(br#"{"messages":[]}"#, DEFAULT_MODEL);
        assert_eq!(req.model, DEFAULT_MODEL);
        assert!(req.messages.is_empty());
    }

    #[test]
    fn test_blank_model_uses_default() {
        let req = IncomingRequest::from_body(br#"{"model":"  ","messages":[]}"#, DEFAULT_MODEL);
        assert_eq!(req.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_invalid_json_degrades_to_empty() {
        let req = IncomingRequest::from_body(b"not json at all", DEFAULT_MODEL);
        assert!(req.messages.is_empty());
        assert_eq!(req.model, DEFAULT_MODEL);
        assert!(matches!(
            req.degradation,
            Some(ParseDegradation::InvalidJson(_))
        ));
    }

    #[test]
    fn test_non_object_degrades_to_empty() {
        let req = IncomingRequest::from_body(b"[1,2,3]", DEFAULT_MODEL);
        assert!(req.messages.is_empty());
        assert_eq!(req.degradation, Some(ParseDegradation::NotAnObject));
    }

    #[test]
    fn test_messages_not_an_array() {
        let req = IncomingRequest::from_body(br#"{"messages":"hello"}"#, DEFAULT_MODEL);
        assert!(req.messages.is_empty());
        assert!(req.degradation.is_none());
    }

    #[test]
    fn test_content_coercion() {
        let body = br#"{"messages":[
            {"role":"user"},
            {"role":"user","content":null},
            {"role":"user","content":[{"type":"text","text":"hi"}]},
            {"role":"tool","content":"x"},
            "garbage"
        ]}"#;
        let req = IncomingRequest::from_body(body, DEFAULT_MODEL);

        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].content, "");
        assert_eq!(req.messages[1].content, "");
        assert_eq!(req.messages[2].content, r#"[{"text":"hi","type":"text"}]"#);
        assert_eq!(req.dropped_turns, 2);
    }

    #[test]
    fn test_last_message_text() {
        let body = br#"{"messages":[{"role":"user","content":"first"},{"role":"user","content":"What is the pricing?"}]}"#;
        let req = IncomingRequest::from_body(body, DEFAULT_MODEL);
        assert_eq!(req.last_message_text(), "What is the pricing?");

        let empty = IncomingRequest::from_body(b"{}", DEFAULT_MODEL);
        assert_eq!(empty.last_message_text(), "");
    }
}
