use super::date::{ResolvedDate, substitute};
use crate::content::ContentTable;
use crate::format::chat::IncomingRequest;
use crate::format::events::OutboundEvent;

/// Canned answer selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortcut {
    pub intent: String,
    pub events: Vec<OutboundEvent>,
    pub substitutions: usize,
}

/// Answer from the content table when the latest message matches a known intent.
///
/// The result is a complete stream: one delta with the full answer, then the terminal
/// event. `None` means the request goes upstream.
pub fn find_shortcut(
    content: &ContentTable,
    request: &IncomingRequest,
    placeholder: &str,
    date: &ResolvedDate,
) -> Option<Shortcut> {
    let intent = content.match_intent(request.last_message_text())?;
    let (answer, substitutions) = substitute(&intent.answer, placeholder, date);

    Some(Shortcut {
        intent: intent.name.clone(),
        events: vec![OutboundEvent::Delta(answer.into_owned()), OutboundEvent::Done],
        substitutions,
    })
}
