//! Weekly token ledger: idempotent grants, atomic spends, and the gate that
//! turns an exhausted quota into a forced delete.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::{
    domain::{ChatId, UserId},
    Result,
};

pub const WEEKLY_GRANT_AMOUNT: i64 = 1;

/// Daily run time of the grant job (UTC).
pub fn grant_job_time() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 15).unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted { balance: i64 },
    /// Week marker recorded, balance already at `max_carry`.
    CarryCapped { balance: i64 },
    AlreadyGranted { balance: i64 },
}

impl GrantOutcome {
    pub fn balance(self) -> i64 {
        match self {
            Self::Granted { balance }
            | Self::CarryCapped { balance }
            | Self::AlreadyGranted { balance } => balance,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpendOutcome {
    Spent { balance: i64 },
    Exhausted,
}

/// Wallet persistence. Implementations must make `grant_weekly` and `spend`
/// atomic (one transaction each, wallet row locked).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn grant_weekly(
        &self,
        tenant: ChatId,
        user: UserId,
        week_start: NaiveDate,
        amount: i64,
        max_carry: i64,
    ) -> Result<GrantOutcome>;

    async fn spend(&self, tenant: ChatId, user: UserId, amount: i64, note: &str)
        -> Result<SpendOutcome>;

    async fn balance(&self, tenant: ChatId, user: UserId) -> Result<i64>;

    /// Every known wallet.
    async fn wallets(&self) -> Result<Vec<(ChatId, UserId)>>;
}

/// Monday 00:00 UTC of the ISO week containing `now`.
pub fn iso_week_monday_utc(now: DateTime<Utc>) -> NaiveDate {
    let date = now.date_naive();
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Next instant the grant job should run, strictly after `now`.
pub fn next_grant_run(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(grant_job_time()).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn LedgerStore>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn grant_if_needed(
        &self,
        tenant: ChatId,
        user: UserId,
        now: DateTime<Utc>,
        max_carry: i64,
    ) -> Result<GrantOutcome> {
        let outcome = self
            .store
            .grant_weekly(
                tenant,
                user,
                iso_week_monday_utc(now),
                WEEKLY_GRANT_AMOUNT,
                max_carry,
            )
            .await?;
        if let GrantOutcome::Granted { balance } = outcome {
            tracing::info!(tenant = tenant.0, user = user.0, balance, "weekly grant");
        }
        Ok(outcome)
    }

    /// Lazy weekly grant, then spend one token for an ad.
    pub async fn gate(
        &self,
        tenant: ChatId,
        user: UserId,
        now: DateTime<Utc>,
        max_carry: i64,
    ) -> Result<SpendOutcome> {
        self.grant_if_needed(tenant, user, now, max_carry).await?;
        self.store.spend(tenant, user, 1, "ad spend").await
    }

    /// Lazy weekly grant, then the resulting balance.
    pub async fn balance(
        &self,
        tenant: ChatId,
        user: UserId,
        now: DateTime<Utc>,
        max_carry: i64,
    ) -> Result<i64> {
        Ok(self
            .grant_if_needed(tenant, user, now, max_carry)
            .await?
            .balance())
    }

    pub async fn wallets(&self) -> Result<Vec<(ChatId, UserId)>> {
        self.store.wallets().await
    }
}
