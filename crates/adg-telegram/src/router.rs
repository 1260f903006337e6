use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use adg_core::{callbacks::ButtonAction, AdsGuard, WatchOutcome};

use crate::convert::{self, BotIdentity};

#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<AdsGuard>,
    pub me: BotIdentity,
}

/// Resolve the bot's own identity (`getMe`).
pub async fn identity(bot: &Bot) -> anyhow::Result<BotIdentity> {
    let me = bot.get_me().await?;
    Ok(BotIdentity {
        id: adg_core::domain::UserId(me.id.0 as i64),
        username: me.username().to_string(),
    })
}

/// Long-poll until ctrl-c. Teloxide runs updates of one chat in order and
/// different chats concurrently.
pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!(bot = %state.me.username, "ads guard polling started");

    let handler = dptree::entry()
        .branch(
            Update::filter_callback_query()
                .filter(|q: CallbackQuery| q.data.as_deref().is_some_and(ButtonAction::is_ours))
                .endpoint(handle_callback),
        )
        .branch(Update::filter_edited_message().endpoint(handle_edited))
        .branch(Update::filter_message().endpoint(handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn trace_outcome(kind: &str, chat_id: i64, message_id: i32, outcome: &WatchOutcome) {
    tracing::debug!(kind, chat_id, message_id, ?outcome, "update handled");
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let inbound = convert::inbound(&msg, &state.me);
    let outcome = state.guard.watchdog(&inbound).await;
    trace_outcome("message", msg.chat.id.0, msg.id.0, &outcome);
    Ok(())
}

async fn handle_edited(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let inbound = convert::inbound(&msg, &state.me);
    let outcome = state.guard.on_edited_message(&inbound).await;
    trace_outcome("edited", msg.chat.id.0, msg.id.0, &outcome);
    Ok(())
}

async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    state.guard.on_callback(&convert::callback(&q)).await;
    Ok(())
}
