//! Persistence port for moderation data (examples, decisions, whitelists).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, Label, MessageId, UserId},
    Result,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub id: i64,
    pub chat_id: ChatId,
    pub text: String,
    pub label: Label,
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

/// A decision row about to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct NewDecision {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: Option<UserId>,
    pub text: String,
    pub label: Option<Label>,
    pub is_ad: bool,
    pub score: Option<f64>,
    pub reason: String,
}

/// The parts of a stored decision that stats and simulation need.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecisionRecord {
    pub label: Option<Label>,
    pub is_ad: bool,
    pub score: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhitelistEntry<T> {
    pub identity: T,
    pub added_by: Option<UserId>,
    pub added_at: DateTime<Utc>,
}

#[async_trait]
pub trait ModerationStore: Send + Sync {
    // examples
    async fn count_examples(&self, chat_id: ChatId) -> Result<i64>;
    async fn insert_example(
        &self,
        chat_id: ChatId,
        text: &str,
        user_id: Option<UserId>,
        label: Label,
    ) -> Result<i64>;
    /// Newest first, optionally filtered by label, skipping `exclude` ids.
    async fn recent_examples(
        &self,
        chat_id: ChatId,
        label: Option<Label>,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<Example>>;
    async fn clear_examples(&self, chat_id: ChatId) -> Result<u64>;
    async fn example_label_counts(&self, chat_id: ChatId) -> Result<Vec<(Label, i64)>>;

    // decisions
    async fn save_decision(&self, decision: &NewDecision) -> Result<()>;
    /// Decisions decided at or after `since` (all of them when `None`).
    async fn decisions_since(
        &self,
        chat_id: ChatId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DecisionRecord>>;

    // whitelists
    async fn whitelist_user_add(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        added_by: Option<UserId>,
    ) -> Result<bool>;
    async fn whitelist_user_remove(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
    async fn whitelist_user_contains(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
    async fn whitelist_users(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<WhitelistEntry<UserId>>>;

    async fn whitelist_domain_add(
        &self,
        chat_id: ChatId,
        domain: &str,
        added_by: Option<UserId>,
    ) -> Result<bool>;
    async fn whitelist_domain_remove(&self, chat_id: ChatId, domain: &str) -> Result<bool>;
    /// Is any of `domains` whitelisted for the chat?
    async fn whitelist_domains_any(&self, chat_id: ChatId, domains: &[String]) -> Result<bool>;
    async fn whitelist_domains(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<WhitelistEntry<String>>>;
}
