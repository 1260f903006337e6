use std::sync::Arc;

use adg_core::{
    config::Config,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    AdsGuard, GuardOptions, GuardPorts,
};
use adg_flowise::FlowiseClient;
use adg_postgres::PgStore;
use adg_telegram::{
    router::{self, AppState},
    TelegramMessenger,
};
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

mod grants;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    adg_core::logging::init("adg")?;

    let cfg = Config::load()?;

    let pool = adg_postgres::connect(&cfg.database_url, cfg.database_max_connections).await?;
    adg_postgres::migrate(&pool).await?;
    let store = Arc::new(PgStore::new(pool));
    tracing::info!("database ready");

    let classifier = Arc::new(FlowiseClient::from_config(&cfg)?);

    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let me = router::identity(&bot).await?;
    tracing::info!(bot = %me.username, "telegram identity resolved");

    // Throttling decorator in front of the raw adapter to stay clear of 429s;
    // the adapter still retries once on RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let guard = AdsGuard::new(
        GuardPorts {
            messenger,
            settings: store.clone(),
            store: store.clone(),
            ledger: store,
            classifier,
        },
        cfg.policy_defaults.clone(),
        GuardOptions {
            bot_username: Some(me.username.clone()),
            ..GuardOptions::from_config(&cfg)
        },
    );

    let cancel = CancellationToken::new();
    let grant_job = cfg
        .weekly_grant_enabled
        .then(|| tokio::spawn(grants::run(guard.clone(), cancel.clone())));

    let result = router::run_polling(bot, Arc::new(AppState { guard, me })).await;

    cancel.cancel();
    if let Some(job) = grant_job {
        let _ = job.await;
    }
    tracing::info!("ads guard stopped");
    result
}
