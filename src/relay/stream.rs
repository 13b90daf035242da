//! Upstream-to-client stream relay.
//!
//! [`Transformer`] is the synchronous half: bytes in, outbound events out, with the
//! terminal-sentinel bookkeeping. [`pump`] drives it from an HTTP body into a bounded
//! channel feeding the client response.

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::date::{ResolvedDate, substitute};
use crate::format::events::OutboundEvent;
use crate::upstream::sse::{LineDecoder, SkipReason, StreamEvent, classify_line};

/// Per-request transform settings.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub placeholder: String,
    pub date: ResolvedDate,
    /// Forward valid JSON lines that carry no delta
    pub forward_unrecognized: bool,
}

/// Counters for one relayed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCounts {
    pub deltas: usize,
    pub forwarded_raw: usize,
    pub substitutions: usize,
    pub skipped: usize,
    pub upstream_errors: usize,
    /// Lines dropped for exceeding the decoder's line limit
    pub oversized: usize,
}

/// Line-buffering transform from upstream bytes to outbound events.
///
/// Placeholders are only searched in complete lines, so a token split across chunks
/// is substituted once its line is whole. Exactly one [`OutboundEvent::Done`] is
/// produced over the transformer's lifetime and it is always the last event.
pub struct Transformer {
    decoder: LineDecoder,
    context: RelayContext,
    done: bool,
    counts: RelayCounts,
}

impl Transformer {
    pub fn new(context: RelayContext) -> Self {
        Self {
            decoder: LineDecoder::new(),
            context,
            done: false,
            counts: RelayCounts::default(),
        }
    }

    /// Whether the terminal event has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn counts(&self) -> RelayCounts {
        RelayCounts {
            oversized: self.decoder.oversized(),
            ..self.counts
        }
    }

    /// Feed one upstream chunk. Input after the terminal event is ignored.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<OutboundEvent> {
        if self.done {
            return Vec::new();
        }

        let mut events = Vec::new();
        for line in self.decoder.feed(chunk) {
            self.process_line(&line, &mut events);
            if self.done {
                break;
            }
        }
        events
    }

    /// End of upstream: parse any leftover fragment, then close with the terminal event.
    pub fn finish(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        if let Some(line) = self.decoder.finish() {
            self.process_line(&line, &mut events);
        }

        if !self.done {
            self.done = true;
            events.push(OutboundEvent::Done);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<OutboundEvent>) {
        match classify_line(line) {
            StreamEvent::Delta(text) => {
                let (text, replaced) =
                    substitute(&text, &self.context.placeholder, &self.context.date);
                self.counts.deltas += 1;
                self.counts.substitutions += replaced;
                events.push(OutboundEvent::Delta(text.into_owned()));
            }
            StreamEvent::Done => {
                self.done = true;
                events.push(OutboundEvent::Done);
            }
            StreamEvent::Unrecognized(raw) if self.context.forward_unrecognized => {
                self.counts.forwarded_raw += 1;
                events.push(OutboundEvent::Raw(raw));
            }
            StreamEvent::Unrecognized(_) => self.skip(SkipReason::NoDelta),
            StreamEvent::Error(message) => {
                warn!(message = %message, "Upstream reported an error mid-stream");
                self.counts.upstream_errors += 1;
            }
            StreamEvent::Skip(reason) => self.skip(reason),
        }
    }

    fn skip(&mut self, reason: SkipReason) {
        // Blank separators are framing, not skipped content
        if reason != SkipReason::NotData {
            debug!(reason = reason.as_str(), "Skipped upstream line");
            self.counts.skipped += 1;
        }
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream sent its terminal marker
    Completed,
    /// Upstream closed without a terminal marker
    UpstreamClosed,
    /// Reading the upstream body failed; the client still got a terminal frame
    ReadFailed,
    /// The client went away; the upstream body was dropped
    ClientGone,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::UpstreamClosed => "upstream_closed",
            RelayOutcome::ReadFailed => "read_failed",
            RelayOutcome::ClientGone => "client_gone",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySummary {
    pub outcome: RelayOutcome,
    pub counts: RelayCounts,
}

/// Relay `body` into `tx` until the upstream finishes, fails, or the client leaves.
///
/// Sending waits on channel capacity, so the upstream is never read faster than the
/// client drains. On a read failure the terminal frame is still sent.
pub async fn pump<B>(mut body: B, tx: mpsc::Sender<Bytes>, context: RelayContext) -> RelaySummary
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut transformer = Transformer::new(context);
    let mut outcome = RelayOutcome::UpstreamClosed;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => None,
            frame = body.frame() => Some(frame),
        };

        let Some(frame) = next else {
            debug!("Client disconnected, releasing upstream");
            return summary(RelayOutcome::ClientGone, &transformer);
        };

        match frame {
            Some(Ok(frame)) => {
                // Trailers carry no content
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                for event in transformer.push_chunk(&data) {
                    if tx.send(event.to_frame()).await.is_err() {
                        return summary(RelayOutcome::ClientGone, &transformer);
                    }
                }
                if transformer.is_done() {
                    outcome = RelayOutcome::Completed;
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream read failed, closing stream");
                outcome = RelayOutcome::ReadFailed;
                break;
            }
            None => break,
        }
    }

    // Upstream body is no longer needed once the terminal frame is decided
    drop(body);

    let tail = if outcome == RelayOutcome::ReadFailed {
        // A partial trailing line from a broken stream is not trusted
        vec![OutboundEvent::Done]
    } else {
        transformer.finish()
    };

    for event in tail {
        if tx.send(event.to_frame()).await.is_err() {
            return summary(RelayOutcome::ClientGone, &transformer);
        }
    }

    summary(outcome, &transformer)
}

fn summary(outcome: RelayOutcome, transformer: &Transformer) -> RelaySummary {
    RelaySummary {
        outcome,
        counts: transformer.counts(),
    }
}
