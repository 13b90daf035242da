use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use std::borrow::Cow;
use std::fmt::Write;

use crate::config::RelayConfig;

/// Fallback rendering when the configured pattern cannot be formatted.
const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Rendered `now + offset days` in the configured timezone.
///
/// Computed once per request; every substitution in that request reuses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDate(String);

impl ResolvedDate {
    /// Resolve for the current instant, falling back to an ISO date if the pattern fails.
    pub fn now(config: &RelayConfig) -> Self {
        let now = Utc::now();
        resolve_date_at(now, config)
            .or_else(|| render(now, config, ISO_DATE_FORMAT))
            .unwrap_or_else(|| Self(now.format(ISO_DATE_FORMAT).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub fn fixed(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl std::fmt::Display for ResolvedDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve for the current instant. `None` if the config cannot produce a date.
pub fn resolve_date(config: &RelayConfig) -> Option<ResolvedDate> {
    resolve_date_at(Utc::now(), config)
}

pub fn resolve_date_at(now: DateTime<Utc>, config: &RelayConfig) -> Option<ResolvedDate> {
    render(now, config, &config.date_format)
}

fn render(now: DateTime<Utc>, config: &RelayConfig, pattern: &str) -> Option<ResolvedDate> {
    let offset = FixedOffset::east_opt(config.utc_offset_minutes.checked_mul(60)?)?;
    let target = now
        .with_timezone(&offset)
        .checked_add_signed(TimeDelta::try_days(config.date_offset_days)?)?;

    // chrono reports bad specifiers as a fmt::Error on write
    let mut text = String::new();
    write!(text, "{}", target.format(pattern)).ok()?;
    Some(ResolvedDate(text))
}

/// Replace every occurrence of `placeholder` in `text` with `date`.
///
/// Returns the (possibly borrowed) text and the number of replacements.
pub fn substitute<'a>(
    text: &'a str,
    placeholder: &str,
    date: &ResolvedDate,
) -> (Cow<'a, str>, usize) {
    if placeholder.is_empty() {
        return (Cow::Borrowed(text), 0);
    }

    let count = text.matches(placeholder).count();
    if count == 0 {
        (Cow::Borrowed(text), 0)
    } else {
        (Cow::Owned(text.replace(placeholder, date.as_str())), count)
    }
}
