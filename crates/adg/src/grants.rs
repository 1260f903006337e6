//! Daily run of the weekly token grant. Grants are idempotent per ISO week,
//! so running every day only funds wallets that missed this week's grant.

use std::{sync::Arc, time::Duration};

use adg_core::{ledger::next_grant_run, AdsGuard};
use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub async fn run(guard: Arc<AdsGuard>, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = next_grant_run(now);
        let dur = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(next = %next, "weekly grant scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(dur) => {
                if let Err(e) = guard.run_weekly_grants(Utc::now()).await {
                    tracing::warn!(error = %e, "weekly grant run failed");
                }
            }
        }
    }
}
