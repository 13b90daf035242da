use hyper::body::Bytes;
use std::borrow::Cow;
use std::sync::LazyLock;

use crate::format::chat::{ConversationTurn, IncomingRequest, Role};
use crate::format::openai::ChatCompletionRequest;

static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    format!("chatrelay/{} {}/{}", env!("CARGO_PKG_VERSION"), os, arch)
});

pub fn build_headers(api_key: &str) -> Vec<(Cow<'static, str>, Cow<'static, str>)> {
    vec![
        (
            Cow::Borrowed("Authorization"),
            Cow::Owned(format!("Bearer {}", api_key)),
        ),
        (
            Cow::Borrowed("Content-Type"),
            Cow::Borrowed("application/json"),
        ),
        (Cow::Borrowed("User-Agent"), Cow::Owned(USER_AGENT.clone())),
        (Cow::Borrowed("Accept"), Cow::Borrowed("text/event-stream")),
    ]
}

/// Streaming completion request: the system turn first, then the caller's turns as sent.
pub fn build_request<'a>(
    system_turn: &'a ConversationTurn,
    incoming: &'a IncomingRequest,
) -> ChatCompletionRequest<'a> {
    let mut messages = Vec::with_capacity(incoming.messages.len() + 1);
    messages.push(system_turn);
    messages.extend(incoming.messages.iter());

    ChatCompletionRequest {
        model: &incoming.model,
        stream: true,
        messages,
    }
}

pub fn system_turn(prompt: &str) -> ConversationTurn {
    ConversationTurn::new(Role::System, prompt)
}

pub fn encode_request(request: &ChatCompletionRequest<'_>) -> serde_json::Result<Bytes> {
    serde_json::to_vec(request).map(Bytes::from)
}
