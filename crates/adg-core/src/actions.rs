//! Action executor helpers: tolerant edits, bulk delete with fallback,
//! autoclean, warn-edit cooldowns and the admin cache.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::{
        port::MessagingPort,
        types::{InlineButton, InlineKeyboard},
    },
    tasks::DelayedTasks,
    Error, Result,
};

const WARN_PRUNE_THRESHOLD: usize = 5000;

/// Edit that treats "message is not modified" as success.
pub async fn edit_tolerant(
    messenger: &dyn MessagingPort,
    msg: MessageRef,
    html: &str,
    keyboard: Option<&InlineKeyboard>,
) -> Result<()> {
    match messenger.edit_html(msg, html, keyboard).await {
        Ok(()) | Err(Error::NotModified) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bulk delete, falling back to one-by-one when the bulk call is refused or
/// unsupported. Returns how many messages are gone.
pub async fn delete_many(messenger: &dyn MessagingPort, chat_id: ChatId, ids: &[MessageId]) -> usize {
    if ids.is_empty() {
        return 0;
    }
    if messenger.capabilities().supports_bulk_delete {
        match messenger.delete_messages(chat_id, ids).await {
            Ok(()) => return ids.len(),
            Err(e) => tracing::debug!(chat_id = chat_id.0, error = %e, "bulk delete failed; deleting one by one"),
        }
    }

    let mut deleted = 0;
    for &id in ids {
        match messenger.delete_message(MessageRef::new(chat_id, id)).await {
            Ok(()) => deleted += 1,
            Err(e) => {
                tracing::debug!(chat_id = chat_id.0, message_id = id.0, error = %e, "delete failed")
            }
        }
    }
    deleted
}

/// Delete `msg` after `delay`. A zero delay means "keep".
pub fn schedule_delete(
    tasks: &DelayedTasks<MessageRef>,
    messenger: Arc<dyn MessagingPort>,
    msg: MessageRef,
    delay: Duration,
) {
    if delay.is_zero() {
        return;
    }
    tasks.schedule(msg, delay, async move {
        if let Err(e) = messenger.delete_message(msg).await {
            tracing::debug!(
                chat_id = msg.chat_id.0,
                message_id = msg.message_id.0,
                error = %e,
                "autoclean delete failed"
            );
        }
    });
}

pub fn keyboard(buttons: impl IntoIterator<Item = InlineButton>) -> InlineKeyboard {
    InlineKeyboard::new(buttons.into_iter().collect())
}

/// Last AD warning per offending message, for the warn-edit cooldown.
#[derive(Debug, Default)]
pub struct WarnCooldowns {
    sent: HashMap<MessageRef, (Instant, MessageId)>,
}

impl WarnCooldowns {
    /// The warning to edit instead of posting a new one, if the previous
    /// warning is younger than `cooldown`.
    pub fn recent(&self, key: &MessageRef, cooldown: Duration, now: Instant) -> Option<MessageId> {
        let (at, warning) = self.sent.get(key)?;
        (now.saturating_duration_since(*at) < cooldown).then_some(*warning)
    }

    pub fn record(&mut self, key: MessageRef, warning: MessageId, now: Instant, cooldown: Duration) {
        self.sent.insert(key, (now, warning));
        if self.sent.len() > WARN_PRUNE_THRESHOLD {
            self.sent
                .retain(|_, (at, _)| now.saturating_duration_since(*at) < cooldown);
        }
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

/// Per-chat administrator lists with a fixed TTL.
#[derive(Debug)]
pub struct AdminCache {
    ttl: Duration,
    chats: HashMap<ChatId, (Instant, HashSet<UserId>)>,
}

impl AdminCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            chats: HashMap::new(),
        }
    }

    /// `None` when the chat's list is missing or stale.
    pub fn is_admin(&self, chat_id: ChatId, user_id: UserId, now: Instant) -> Option<bool> {
        let (at, admins) = self.chats.get(&chat_id)?;
        (now.saturating_duration_since(*at) < self.ttl).then(|| admins.contains(&user_id))
    }

    pub fn store(&mut self, chat_id: ChatId, admins: impl IntoIterator<Item = UserId>, now: Instant) {
        self.chats
            .insert(chat_id, (now, admins.into_iter().collect()));
    }
}
