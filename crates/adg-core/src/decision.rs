//! Decision rule, per-chat classification gap, and history stats/simulation.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    classify::{ClassifyError, Verdict},
    domain::{ChatId, Label},
    store::DecisionRecord,
};

/// `label == AD` and the score, when present, reaches the threshold.
pub fn is_ad(label: Option<Label>, score: Option<f64>, threshold: f64) -> bool {
    label == Some(Label::Ad) && score.map_or(true, |s| s >= threshold)
}

/// The outcome of one classification, ready to persist.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub label: Option<Label>,
    pub score: Option<f64>,
    pub is_ad: bool,
    pub reason: String,
}

pub fn decide(outcome: &Result<Verdict, ClassifyError>, threshold: f64) -> Decision {
    match outcome {
        Ok(v) => Decision {
            label: v.label,
            score: v.score,
            is_ad: is_ad(v.label, v.score, threshold),
            reason: v.reason.clone().unwrap_or_default(),
        },
        Err(e) => Decision {
            label: None,
            score: None,
            is_ad: false,
            reason: e.reason_code(),
        },
    }
}

/// Minimum spacing between classification calls, per chat. A message that
/// arrives too soon is skipped, not queued.
#[derive(Debug, Default)]
pub struct MinGap {
    last: HashMap<ChatId, Instant>,
}

impl MinGap {
    /// `true` (and records `now`) when a call is allowed.
    pub fn try_acquire(&mut self, chat_id: ChatId, gap: Duration, now: Instant) -> bool {
        if let Some(last) = self.last.get(&chat_id) {
            if now.saturating_duration_since(*last) < gap {
                return false;
            }
        }
        self.last.insert(chat_id, now);
        true
    }
}

/// History window for stats and simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsWindow {
    Day,
    Week,
    All,
}

impl StatsWindow {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "24h" | "1d" | "day" => Some(Self::Day),
            "7d" | "week" => Some(Self::Week),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - chrono::Duration::hours(24)),
            Self::Week => Some(now - chrono::Duration::days(7)),
            Self::All => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DecisionStats {
    pub total: usize,
    pub ad_hits: usize,
    pub avg_score: Option<f64>,
}

impl DecisionStats {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.ad_hits as f64 / self.total as f64
        }
    }
}

pub fn summarize(records: &[DecisionRecord]) -> DecisionStats {
    let scores: Vec<f64> = records.iter().filter_map(|r| r.score).collect();
    DecisionStats {
        total: records.len(),
        ad_hits: records.iter().filter(|r| r.is_ad).count(),
        avg_score: (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64),
    }
}

/// What the stored decisions would have looked like under another threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Simulation {
    pub threshold: f64,
    pub total: usize,
    pub currently_ad: usize,
    pub would_be_ad: usize,
}

pub fn simulate(records: &[DecisionRecord], threshold: f64) -> Simulation {
    Simulation {
        threshold,
        total: records.len(),
        currently_ad: records.iter().filter(|r| r.is_ad).count(),
        would_be_ad: records
            .iter()
            .filter(|r| is_ad(r.label, r.score, threshold))
            .count(),
    }
}
