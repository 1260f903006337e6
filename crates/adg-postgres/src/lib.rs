//! PostgreSQL adapter: settings, moderation data and the token ledger.
//!
//! Every port method maps `sqlx` failures into [`Error::Store`]; the guard
//! decides whether a failing store blocks anything (it never does for
//! settings).

use std::collections::HashMap;

use adg_core::{
    domain::{ChatId, Label, MessageId, UserId},
    errors::Error,
    ledger::{GrantOutcome, LedgerStore, SpendOutcome},
    settings::SettingsStore,
    store::{DecisionRecord, Example, ModerationStore, NewDecision, WhitelistEntry},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};

fn db(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Open a pool against `url`.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .map_err(db)
}

/// Apply the bundled migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Store(format!("migrations: {e}")))
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn global_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM bot_config")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.into_iter().collect())
    }

    async fn chat_settings(&self, chat_id: ChatId) -> Result<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM chat_config WHERE chat_id = $1",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().collect())
    }

    async fn set_global_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_config (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn set_chat_setting(&self, chat_id: ChatId, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_config (chat_id, key, value) VALUES ($1, $2, $3) \
             ON CONFLICT (chat_id, key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(chat_id.0)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }
}

type ExampleRow = (i64, i64, String, Option<i64>, String, DateTime<Utc>);

fn example_from_row((id, chat_id, text, user_id, label, created_at): ExampleRow) -> Option<Example> {
    Some(Example {
        id,
        chat_id: ChatId(chat_id),
        text,
        label: Label::parse(&label)?,
        user_id: user_id.map(UserId),
        created_at,
    })
}

#[async_trait]
impl ModerationStore for PgStore {
    async fn count_examples(&self, chat_id: ChatId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ads_examples WHERE chat_id = $1")
            .bind(chat_id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db)
    }

    async fn insert_example(
        &self,
        chat_id: ChatId,
        text: &str,
        user_id: Option<UserId>,
        label: Label,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO ads_examples (chat_id, text, user_id, label) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(chat_id.0)
        .bind(text)
        .bind(user_id.map(|u| u.0))
        .bind(label.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db)
    }

    async fn recent_examples(
        &self,
        chat_id: ChatId,
        label: Option<Label>,
        limit_to: usize,
        exclude: &[i64],
    ) -> Result<Vec<Example>> {
        let rows = sqlx::query_as::<_, ExampleRow>(
            "SELECT id, chat_id, text, user_id, label, created_at FROM ads_examples \
             WHERE chat_id = $1 \
               AND ($2::TEXT IS NULL OR UPPER(label) = $2) \
               AND NOT (id = ANY($3)) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $4",
        )
        .bind(chat_id.0)
        .bind(label.map(Label::as_str))
        .bind(exclude)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().filter_map(example_from_row).collect())
    }

    async fn clear_examples(&self, chat_id: ChatId) -> Result<u64> {
        let done = sqlx::query("DELETE FROM ads_examples WHERE chat_id = $1")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(done.rows_affected())
    }

    async fn example_label_counts(&self, chat_id: ChatId) -> Result<Vec<(Label, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT label, COUNT(*) FROM ads_examples WHERE chat_id = $1 GROUP BY label",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        // Legacy aliases collapse onto the same label.
        let mut counts: HashMap<Label, i64> = HashMap::new();
        for (raw, n) in rows {
            if let Some(label) = Label::parse(&raw) {
                *counts.entry(label).or_default() += n;
            }
        }
        Ok(counts.into_iter().collect())
    }

    async fn save_decision(&self, d: &NewDecision) -> Result<()> {
        sqlx::query(
            "INSERT INTO ads_decisions \
             (chat_id, message_id, user_id, text, label, is_ad, score, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(d.chat_id.0)
        .bind(i64::from(d.message_id.0))
        .bind(d.user_id.map(|u| u.0))
        .bind(&d.text)
        .bind(d.label.map(Label::as_str))
        .bind(d.is_ad)
        .bind(d.score)
        .bind(&d.reason)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn decisions_since(
        &self,
        chat_id: ChatId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query_as::<_, (Option<String>, bool, Option<f64>)>(
            "SELECT label, is_ad, score FROM ads_decisions \
             WHERE chat_id = $1 AND ($2::TIMESTAMPTZ IS NULL OR decided_at >= $2) \
             ORDER BY decided_at DESC",
        )
        .bind(chat_id.0)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(label, is_ad, score)| DecisionRecord {
                label: label.as_deref().and_then(Label::parse),
                is_ad,
                score,
            })
            .collect())
    }

    async fn whitelist_user_add(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        added_by: Option<UserId>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "INSERT INTO ads_whitelist_users (chat_id, user_id, added_by) VALUES ($1, $2, $3) \
             ON CONFLICT (chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(added_by.map(|u| u.0))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn whitelist_user_remove(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let done =
            sqlx::query("DELETE FROM ads_whitelist_users WHERE chat_id = $1 AND user_id = $2")
                .bind(chat_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(done.rows_affected() > 0)
    }

    async fn whitelist_user_contains(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM ads_whitelist_users WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db)
    }

    async fn whitelist_users(
        &self,
        chat_id: ChatId,
        limit_to: usize,
    ) -> Result<Vec<WhitelistEntry<UserId>>> {
        let rows = sqlx::query_as::<_, (i64, Option<i64>, DateTime<Utc>)>(
            "SELECT user_id, added_by, added_at FROM ads_whitelist_users \
             WHERE chat_id = $1 ORDER BY added_at DESC LIMIT $2",
        )
        .bind(chat_id.0)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, added_by, added_at)| WhitelistEntry {
                identity: UserId(user_id),
                added_by: added_by.map(UserId),
                added_at,
            })
            .collect())
    }

    async fn whitelist_domain_add(
        &self,
        chat_id: ChatId,
        domain: &str,
        added_by: Option<UserId>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "INSERT INTO ads_whitelist_domains (chat_id, domain, added_by) VALUES ($1, $2, $3) \
             ON CONFLICT (chat_id, domain) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(domain)
        .bind(added_by.map(|u| u.0))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn whitelist_domain_remove(&self, chat_id: ChatId, domain: &str) -> Result<bool> {
        let done =
            sqlx::query("DELETE FROM ads_whitelist_domains WHERE chat_id = $1 AND domain = $2")
                .bind(chat_id.0)
                .bind(domain)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(done.rows_affected() > 0)
    }

    async fn whitelist_domains_any(&self, chat_id: ChatId, domains: &[String]) -> Result<bool> {
        if domains.is_empty() {
            return Ok(false);
        }
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM ads_whitelist_domains \
             WHERE chat_id = $1 AND domain = ANY($2))",
        )
        .bind(chat_id.0)
        .bind(domains)
        .fetch_one(&self.pool)
        .await
        .map_err(db)
    }

    async fn whitelist_domains(
        &self,
        chat_id: ChatId,
        limit_to: usize,
    ) -> Result<Vec<WhitelistEntry<String>>> {
        let rows = sqlx::query_as::<_, (String, Option<i64>, DateTime<Utc>)>(
            "SELECT domain, added_by, added_at FROM ads_whitelist_domains \
             WHERE chat_id = $1 ORDER BY added_at DESC LIMIT $2",
        )
        .bind(chat_id.0)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(domain, added_by, added_at)| WhitelistEntry {
                identity: domain,
                added_by: added_by.map(UserId),
                added_at,
            })
            .collect())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn grant_weekly(
        &self,
        tenant: ChatId,
        user: UserId,
        week_start: NaiveDate,
        amount: i64,
        max_carry: i64,
    ) -> Result<GrantOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "INSERT INTO wallets (tenant_id, user_id, balance) VALUES ($1, $2, 0) \
             ON CONFLICT (tenant_id, user_id) DO NOTHING",
        )
        .bind(tenant.0)
        .bind(user.0)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM wallets WHERE tenant_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(tenant.0)
        .bind(user.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;

        let marked = sqlx::query(
            "INSERT INTO weekly_grants (tenant_id, user_id, week_start_date) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant.0)
        .bind(user.0)
        .bind(week_start)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected()
            == 1;

        let outcome = if !marked {
            GrantOutcome::AlreadyGranted { balance }
        } else if balance >= max_carry {
            GrantOutcome::CarryCapped { balance }
        } else {
            let new_balance = (balance + amount).min(max_carry);
            sqlx::query(
                "UPDATE wallets SET balance = $3, updated_at = NOW() \
                 WHERE tenant_id = $1 AND user_id = $2",
            )
            .bind(tenant.0)
            .bind(user.0)
            .bind(new_balance)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            sqlx::query(
                "INSERT INTO ledger (tenant_id, user_id, type, amount, note) \
                 VALUES ($1, $2, 'grant', $3, 'weekly grant')",
            )
            .bind(tenant.0)
            .bind(user.0)
            .bind(new_balance - balance)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            GrantOutcome::Granted {
                balance: new_balance,
            }
        };

        tx.commit().await.map_err(db)?;
        Ok(outcome)
    }

    async fn spend(
        &self,
        tenant: ChatId,
        user: UserId,
        amount: i64,
        note: &str,
    ) -> Result<SpendOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM wallets WHERE tenant_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(tenant.0)
        .bind(user.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .unwrap_or(0);

        if balance < amount || balance <= 0 {
            tx.rollback().await.map_err(db)?;
            return Ok(SpendOutcome::Exhausted);
        }

        let left = balance - amount;
        sqlx::query(
            "UPDATE wallets SET balance = $3, updated_at = NOW() \
             WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant.0)
        .bind(user.0)
        .bind(left)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        sqlx::query(
            "INSERT INTO ledger (tenant_id, user_id, type, amount, note) \
             VALUES ($1, $2, 'spend_ad', $3, $4)",
        )
        .bind(tenant.0)
        .bind(user.0)
        .bind(-amount)
        .bind(note)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        tracing::debug!(tenant = tenant.0, user = user.0, balance = left, "token spent");
        Ok(SpendOutcome::Spent { balance: left })
    }

    async fn balance(&self, tenant: ChatId, user: UserId) -> Result<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM wallets WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant.0)
        .bind(user.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(balance.unwrap_or(0))
    }

    async fn wallets(&self) -> Result<Vec<(ChatId, UserId)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT tenant_id, user_id FROM wallets ORDER BY tenant_id, user_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(t, u)| (ChatId(t), UserId(u)))
            .collect())
    }
}

/// Read a decision back by message, newest first. Used by the integration
/// tests and handy for ad-hoc inspection.
pub async fn decision_reasons(
    pool: &PgPool,
    chat_id: ChatId,
    message_id: MessageId,
) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, Option<String>>(
        "SELECT reason FROM ads_decisions WHERE chat_id = $1 AND message_id = $2 \
         ORDER BY decided_at DESC",
    )
    .bind(chat_id.0)
    .bind(i64::from(message_id.0))
    .fetch_all(pool)
    .await
    .map(|rows| rows.into_iter().flatten().collect())
    .map_err(db)
}

#[cfg(test)]
mod tests {
    //! Integration tests against a real database. They run only when
    //! `DATABASE_URL` is set; otherwise each test returns early.

    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    async fn store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = connect(&url, 2).await.ok()?;
        migrate(&pool).await.ok()?;
        Some(PgStore::new(pool))
    }

    /// A chat id no other test run uses.
    fn fresh_chat() -> ChatId {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        ChatId(-((nanos % 1_000_000_000_000) as i64) - 1)
    }

    #[tokio::test]
    async fn settings_upsert_overwrites() {
        let Some(s) = store().await else { return };
        let chat = fresh_chat();
        s.set_chat_setting(chat, "ads_threshold", "0.5").await.unwrap();
        s.set_chat_setting(chat, "ads_threshold", "0.9").await.unwrap();
        let got = s.chat_settings(chat).await.unwrap();
        assert_eq!(got.get("ads_threshold").map(String::as_str), Some("0.9"));
    }

    #[tokio::test]
    async fn examples_filter_and_exclude() {
        let Some(s) = store().await else { return };
        let chat = fresh_chat();
        let a = s.insert_example(chat, "buy now", None, Label::Ad).await.unwrap();
        let b = s
            .insert_example(chat, "hello all", Some(UserId(5)), Label::NotAd)
            .await
            .unwrap();
        assert_eq!(s.count_examples(chat).await.unwrap(), 2);

        let ads = s.recent_examples(chat, Some(Label::Ad), 10, &[]).await.unwrap();
        assert_eq!(ads.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a]);

        let rest = s.recent_examples(chat, None, 10, &[a]).await.unwrap();
        assert_eq!(rest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b]);

        assert_eq!(s.clear_examples(chat).await.unwrap(), 2);
        assert!(s.example_label_counts(chat).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn whitelist_add_is_idempotent() {
        let Some(s) = store().await else { return };
        let chat = fresh_chat();
        assert!(s.whitelist_user_add(chat, UserId(7), None).await.unwrap());
        assert!(!s.whitelist_user_add(chat, UserId(7), None).await.unwrap());
        assert!(s.whitelist_user_contains(chat, UserId(7)).await.unwrap());

        assert!(s.whitelist_domain_add(chat, "example.com", None).await.unwrap());
        assert!(s
            .whitelist_domains_any(chat, &["x.org".into(), "example.com".into()])
            .await
            .unwrap());
        assert!(s.whitelist_domain_remove(chat, "example.com").await.unwrap());
        assert!(!s.whitelist_domains_any(chat, &["example.com".into()]).await.unwrap());
    }

    #[tokio::test]
    async fn decision_is_persisted_with_reason() {
        let Some(s) = store().await else { return };
        let chat = fresh_chat();
        s.save_decision(&NewDecision {
            chat_id: chat,
            message_id: MessageId(42),
            user_id: Some(UserId(1)),
            text: "promo".into(),
            label: None,
            is_ad: false,
            score: None,
            reason: "exception:timeout".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            decision_reasons(s.pool(), chat, MessageId(42)).await.unwrap(),
            vec!["exception:timeout".to_string()]
        );
        let records = s.decisions_since(chat, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, None);
    }

    #[tokio::test]
    async fn weekly_grant_is_idempotent_and_spend_is_atomic() {
        let Some(s) = store().await else { return };
        let chat = fresh_chat();
        let user = UserId(99);
        let week = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();

        assert_eq!(
            s.grant_weekly(chat, user, week, 1, 3).await.unwrap(),
            GrantOutcome::Granted { balance: 1 }
        );
        assert_eq!(
            s.grant_weekly(chat, user, week, 1, 3).await.unwrap(),
            GrantOutcome::AlreadyGranted { balance: 1 }
        );

        assert_eq!(
            s.spend(chat, user, 1, "ad spend").await.unwrap(),
            SpendOutcome::Spent { balance: 0 }
        );
        assert_eq!(
            s.spend(chat, user, 1, "ad spend").await.unwrap(),
            SpendOutcome::Exhausted
        );
        assert_eq!(s.balance(chat, user).await.unwrap(), 0);
        assert!(s.wallets().await.unwrap().contains(&(chat, user)));
    }
}
