use hyper::body::Bytes;
use serde::Serialize;

/// Payload of the terminal frame.
pub const DONE_MARKER: &str = "[DONE]";

/// One frame written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Delta(String),
    /// Upstream JSON forwarded unchanged
    Raw(String),
    Done,
}

#[derive(Serialize)]
struct DeltaPayload<'a> {
    delta: &'a str,
}

impl OutboundEvent {
    pub fn to_frame(&self) -> Bytes {
        Bytes::from(format_sse_frame(self))
    }
}

pub fn format_sse_frame(event: &OutboundEvent) -> String {
    let payload = match event {
        OutboundEvent::Delta(text) => {
            serde_json::to_string(&DeltaPayload { delta: text }).unwrap_or_default()
        }
        OutboundEvent::Raw(line) => line.clone(),
        OutboundEvent::Done => DONE_MARKER.to_string(),
    };

    format!("data: {}\n\n", payload)
}
