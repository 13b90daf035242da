use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::relay::{RelayOutcome, RelaySummary};

/// Global stats instance
static STATS: std::sync::LazyLock<Stats> = std::sync::LazyLock::new(Stats::new);

/// Get the global stats instance
pub fn get_stats() -> &'static Stats {
    &STATS
}

/// How a chat request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Shortcut,
    Relayed,
    UpstreamError,
    /// Refused before any upstream call (method, credential, size, timeout)
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Shortcut => "shortcut",
            Outcome::Relayed => "relayed",
            Outcome::UpstreamError => "upstream_error",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Monotonic relay counters shared by all requests
pub struct Stats {
    start_time: Instant,
    total_requests: AtomicU64,
    substitutions: AtomicU64,
    skipped_lines: AtomicU64,
    outcomes: RwLock<HashMap<String, AtomicU64>>,
    /// How relayed streams ended
    relay_endings: RwLock<HashMap<String, AtomicU64>>,
    intents: RwLock<HashMap<String, AtomicU64>>,
}

impl Stats {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            substitutions: AtomicU64::new(0),
            skipped_lines: AtomicU64::new(0),
            outcomes: RwLock::new(HashMap::new()),
            relay_endings: RwLock::new(HashMap::new()),
            intents: RwLock::new(HashMap::new()),
        }
    }

    /// Record an inbound chat request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        increment_map(&self.outcomes, outcome.as_str());
    }

    /// Record a shortcut answer for `intent`
    pub fn record_intent(&self, intent: &str, substitutions: usize) {
        increment_map(&self.intents, intent);
        self.substitutions
            .fetch_add(substitutions as u64, Ordering::Relaxed);
    }

    /// Fold a finished relay into the totals
    pub fn record_relay(&self, summary: &RelaySummary) {
        increment_map(&self.relay_endings, summary.outcome.as_str());
        self.substitutions
            .fetch_add(summary.counts.substitutions as u64, Ordering::Relaxed);
        self.skipped_lines
            .fetch_add(summary.counts.skipped as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            uptime: self.uptime(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            substitutions: self.substitutions.load(Ordering::Relaxed),
            skipped_lines: self.skipped_lines.load(Ordering::Relaxed),
            outcomes: snapshot(&self.outcomes),
            relay_endings: snapshot(&self.relay_endings),
            intents: snapshot(&self.intents),
        }
    }
}

fn increment_map(map: &RwLock<HashMap<String, AtomicU64>>, key: &str) {
    {
        let read = map.read();
        if let Some(counter) = read.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    let mut write = map.write();
    write
        .entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

/// Sorted by key so output is stable
fn snapshot(map: &RwLock<HashMap<String, AtomicU64>>) -> Vec<(String, u64)> {
    let read = map.read();
    let mut entries: Vec<(String, u64)> = read
        .iter()
        .map(|(key, count)| (key.clone(), count.load(Ordering::Relaxed)))
        .collect();
    entries.sort();
    entries
}

#[derive(Debug, Clone)]
pub struct StatsSummary {
    pub uptime: Duration,
    pub total_requests: u64,
    pub substitutions: u64,
    pub skipped_lines: u64,
    pub outcomes: Vec<(String, u64)>,
    pub relay_endings: Vec<(String, u64)>,
    pub intents: Vec<(String, u64)>,
}

impl StatsSummary {
    #[cfg(test)]
    pub fn count(&self, outcome: Outcome) -> u64 {
        lookup(&self.outcomes, outcome.as_str())
    }

    #[cfg(test)]
    pub fn ending(&self, outcome: RelayOutcome) -> u64 {
        lookup(&self.relay_endings, outcome.as_str())
    }

    #[cfg(test)]
    pub fn intent_hits(&self, intent: &str) -> u64 {
        lookup(&self.intents, intent)
    }

    /// Convert to JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime.as_secs(),
            "total_requests": self.total_requests,
            "substitutions": self.substitutions,
            "skipped_lines": self.skipped_lines,
            "outcomes": to_object(&self.outcomes),
            "relay_endings": to_object(&self.relay_endings),
            "intents": to_object(&self.intents),
        })
    }
}

#[cfg(test)]
fn lookup(entries: &[(String, u64)], key: &str) -> u64 {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| *v)
        .unwrap_or(0)
}

fn to_object(entries: &[(String, u64)]) -> serde_json::Value {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::stream::RelayCounts;

    #[test]
    fn test_stats_outcomes() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_request();
        stats.record_request();
        stats.record_outcome(Outcome::Shortcut);
        stats.record_outcome(Outcome::Relayed);
        stats.record_outcome(Outcome::Relayed);

        let summary = stats.summary();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.count(Outcome::Shortcut), 1);
        assert_eq!(summary.count(Outcome::Relayed), 2);
        assert_eq!(summary.count(Outcome::Rejected), 0);
    }

    #[test]
    fn test_stats_intents_and_substitutions() {
        let stats = Stats::new();
        stats.record_intent("timeline", 1);
        stats.record_intent("timeline", 1);
        stats.record_intent("cost", 0);

        let summary = stats.summary();
        assert_eq!(summary.intent_hits("timeline"), 2);
        assert_eq!(summary.intent_hits("cost"), 1);
        assert_eq!(summary.intent_hits("visibility"), 0);
        assert_eq!(summary.substitutions, 2);
    }

    #[test]
    fn test_stats_relay_summary() {
        let stats = Stats::new();
        stats.record_relay(&RelaySummary {
            outcome: RelayOutcome::Completed,
            counts: RelayCounts {
                deltas: 4,
                substitutions: 2,
                skipped: 3,
                ..Default::default()
            },
        });
        stats.record_relay(&RelaySummary {
            outcome: RelayOutcome::ClientGone,
            counts: RelayCounts::default(),
        });

        let summary = stats.summary();
        assert_eq!(summary.substitutions, 2);
        assert_eq!(summary.skipped_lines, 3);
        assert_eq!(summary.ending(RelayOutcome::Completed), 1);
        assert_eq!(summary.ending(RelayOutcome::ClientGone), 1);
    }

    #[test]
    fn test_stats_uptime() {
        let stats = Stats::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(stats.uptime().as_millis() >= 10);
    }

    #[test]
    fn test_stats_to_json() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_outcome(Outcome::UpstreamError);
        stats.record_intent("cost", 0);

        let json = stats.summary().to_json();
        assert!(json["uptime_seconds"].as_u64().is_some());
        assert_eq!(json["total_requests"].as_u64(), Some(1));
        assert_eq!(json["outcomes"]["upstream_error"].as_u64(), Some(1));
        assert_eq!(json["intents"]["cost"].as_u64(), Some(1));
    }
}
