//! Core domain model for Gigwatch: stage records, score verdicts, the
//! relative-time parser and the operator-facing vocabulary.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gigwatch-core";

/// One freshly scraped job posting, before scoring.
///
/// `id` is the stable marketplace identifier extracted from the posting URL
/// and is the unique key across every store and log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub id: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    /// Raw "posted N days ago" text as rendered on the search page.
    pub posted_relative_text: Option<String>,
    pub type_level: Option<String>,
    pub experience_level: Option<String>,
    pub is_fixed_price: bool,
    pub duration_label: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Scoring verdict attached to a posting when it advances to the staged
/// stage. `match_level` and `should_apply` come from the same scoring call
/// and are both absent when the model response could not be decoded;
/// `reason` then carries a diagnostic string instead of an explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub match_level: Option<f64>,
    pub should_apply: Option<bool>,
    pub reason: String,
    pub scoring_model: String,
}

/// A posting after scoring, as persisted in the staged stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedPosting {
    pub posting: RawPosting,
    pub score: Score,
}

/// One row of the flat sent log: a posting surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentRecord {
    pub job_id: String,
    pub title: String,
    pub match_level: Option<f64>,
    pub sent_at: DateTime<Utc>,
}

impl SentRecord {
    pub fn from_staged(staged: &StagedPosting, sent_at: DateTime<Utc>) -> Self {
        Self {
            job_id: staged.posting.id.clone(),
            title: staged.posting.title.clone(),
            match_level: staged.score.match_level,
            sent_at,
        }
    }
}

/// One row of the flat applied log: a posting the operator approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub job_id: String,
    pub title: String,
    pub url: String,
    pub match_level: Option<f64>,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn from_staged(staged: &StagedPosting, applied_at: DateTime<Utc>) -> Self {
        Self {
            job_id: staged.posting.id.clone(),
            title: staged.posting.title.clone(),
            url: staged.posting.url.clone(),
            match_level: staged.score.match_level,
            applied_at,
        }
    }
}

/// Button press on a dispatched job card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorAction {
    Apply,
    Skip,
}

/// Channel-level command issued by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorCommand {
    /// Run one scrape -> evaluate -> dispatch cycle outside the timer.
    Run,
    /// Re-announce the last `last` postings by trimming them off the sent set.
    Resend { last: u32 },
    /// Delete the channel history.
    Purge,
}

/// Everything the interaction endpoint can hand to the event service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorEvent {
    Card {
        message_id: String,
        action: OperatorAction,
    },
    Command(OperatorCommand),
}

/// Lifecycle of a dispatched job card. `Applied` and `Skipped` are terminal;
/// the applied log is the durable record of the `Applied` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardState {
    Pending,
    Applied,
    Skipped,
}

impl CardState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CardState::Pending)
    }

    /// Next state for an operator action, or `None` when the card is already
    /// terminal and the action must be ignored.
    pub fn on_action(self, action: OperatorAction) -> Option<CardState> {
        match self {
            CardState::Pending => Some(match action {
                OperatorAction::Apply => CardState::Applied,
                OperatorAction::Skip => CardState::Skipped,
            }),
            CardState::Applied | CardState::Skipped => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelativeTimeError {
    #[error("unrecognized posted-ago text: '{0}'")]
    Unrecognized(String),
}

/// Resolve a search-page "posted ... ago" string against the scrape
/// timestamp. Months are approximated as 30 days. Unrecognized text is a
/// hard failure; there is deliberately no fallback to the reference time.
pub fn resolve_posted_at(
    reference: DateTime<Utc>,
    text: &str,
) -> Result<DateTime<Utc>, RelativeTimeError> {
    let lowered = text.to_lowercase();
    let lowered = lowered.trim();

    if lowered.contains("today") {
        return Ok(reference);
    }
    if lowered.contains("yesterday") {
        return Ok(reference - Duration::days(1));
    }
    if lowered.contains("last week") {
        return Ok(reference - Duration::weeks(1));
    }
    if lowered.contains("last month") {
        return Ok(reference - Duration::days(30));
    }
    if lowered.contains("last year") {
        return Ok(reference - Duration::days(365));
    }

    // "posted N <unit> ago" anywhere in the text
    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    for window in tokens.windows(4) {
        if window[0] != "posted" || window[3] != "ago" {
            continue;
        }
        let Ok(amount) = window[1].parse::<i64>() else {
            continue;
        };
        let offset = match window[2] {
            "minute" | "minutes" => Duration::minutes(amount),
            "hour" | "hours" => Duration::hours(amount),
            "day" | "days" => Duration::days(amount),
            "week" | "weeks" => Duration::weeks(amount),
            "month" | "months" => Duration::days(amount * 30),
            _ => continue,
        };
        return Ok(reference - offset);
    }

    Err(RelativeTimeError::Unrecognized(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).single().unwrap()
    }

    #[test]
    fn posted_weeks_ago_resolves() {
        let resolved = resolve_posted_at(reference(), "Posted 2 weeks ago").unwrap();
        assert_eq!(
            resolved,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn yesterday_resolves() {
        let resolved = resolve_posted_at(reference(), "yesterday").unwrap();
        assert_eq!(
            resolved,
            Utc.with_ymd_and_hms(2024, 1, 14, 10, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn today_is_the_reference() {
        assert_eq!(resolve_posted_at(reference(), "Posted today").unwrap(), reference());
    }

    #[test]
    fn month_is_thirty_days() {
        let resolved = resolve_posted_at(reference(), "posted 1 month ago").unwrap();
        assert_eq!(resolved, reference() - Duration::days(30));
    }

    #[test]
    fn unknown_unit_is_an_error() {
        let err = resolve_posted_at(reference(), "posted 2 fortnights ago").unwrap_err();
        assert_eq!(
            err,
            RelativeTimeError::Unrecognized("posted 2 fortnights ago".to_string())
        );
    }

    #[test]
    fn empty_text_is_an_error() {
        assert!(resolve_posted_at(reference(), "").is_err());
    }

    #[test]
    fn card_state_is_terminal_after_one_action() {
        let state = CardState::Pending;
        let applied = state.on_action(OperatorAction::Apply).unwrap();
        assert_eq!(applied, CardState::Applied);
        assert!(applied.is_terminal());
        assert_eq!(applied.on_action(OperatorAction::Skip), None);
        assert_eq!(
            CardState::Pending.on_action(OperatorAction::Skip),
            Some(CardState::Skipped)
        );
    }
}
