use serde::Serialize;

use super::chat::ConversationTurn;

/// Body sent to the upstream `chat/completions` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
    pub messages: Vec<&'a ConversationTurn>,
}
