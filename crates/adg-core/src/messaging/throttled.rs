//! Flood control in front of the platform adapter.
//!
//! Calls fall into three lanes:
//! - notices (send, reply, edit) are spaced per chat and globally;
//! - enforcement and lookups (delete, restrict, admin queries, callback
//!   answers) only wait for the global slot, so a chatty group never delays
//!   removing an ad;
//! - the typing indicator is dropped instead of queued when its chat is busy.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, ChatMemberInfo, InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

/// Chats idle for this long lose their notice slot.
const CHAT_SLOT_IDLE: Duration = Duration::from_secs(600);
const CHAT_SLOT_PRUNE_THRESHOLD: usize = 1000;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between any two outbound calls.
    pub global_min_interval: Duration,
    /// Spacing between notices in one chat.
    pub notice_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(35),
            notice_min_interval: Duration::from_millis(1000),
        }
    }
}

/// Next free instant on a lane.
#[derive(Clone, Copy, Debug)]
struct Slot {
    next: Instant,
}

impl Slot {
    /// Book the earliest slot at or after `now`; returns how long to wait.
    fn book(&mut self, now: Instant, interval: Duration) -> Duration {
        let start = self.next.max(now);
        self.next = start + interval;
        start - now
    }

    fn busy(&self, now: Instant) -> bool {
        self.next > now
    }
}

#[derive(Debug)]
struct Slots {
    global: Slot,
    chats: HashMap<ChatId, Slot>,
}

pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        let now = Instant::now();
        Self {
            inner,
            cfg,
            slots: Mutex::new(Slots {
                global: Slot { next: now },
                chats: HashMap::new(),
            }),
        }
    }

    async fn pause(wait: Duration) {
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn global_lane(&self) {
        let wait = {
            let mut slots = self.slots.lock().await;
            slots.global.book(Instant::now(), self.cfg.global_min_interval)
        };
        Self::pause(wait).await;
    }

    async fn notice_lane(&self, chat_id: ChatId) {
        let wait = {
            let now = Instant::now();
            let mut slots = self.slots.lock().await;
            if slots.chats.len() > CHAT_SLOT_PRUNE_THRESHOLD {
                slots
                    .chats
                    .retain(|_, s| s.next + CHAT_SLOT_IDLE > now);
            }
            let global = slots.global.book(now, self.cfg.global_min_interval);
            let chat = slots
                .chats
                .entry(chat_id)
                .or_insert(Slot { next: now })
                .book(now, self.cfg.notice_min_interval);
            global.max(chat)
        };
        Self::pause(wait).await;
    }

    /// `false` when the chat already has a notice queued.
    async fn try_cosmetic(&self, chat_id: ChatId) -> bool {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        if slots.chats.get(&chat_id).is_some_and(|s| s.busy(now)) {
            return false;
        }
        slots.global.book(now, self.cfg.global_min_interval).is_zero()
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.notice_lane(chat_id).await;
        self.inner.send_html(chat_id, html, keyboard).await
    }

    async fn reply_html(
        &self,
        target: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.notice_lane(target.chat_id).await;
        self.inner.reply_html(target, html, keyboard).await
    }

    async fn edit_html(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        self.notice_lane(msg.chat_id).await;
        self.inner.edit_html(msg, html, keyboard).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.global_lane().await;
        self.inner.delete_message(msg).await
    }

    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<()> {
        self.global_lane().await;
        self.inner.delete_messages(chat_id, ids).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        if !self.try_cosmetic(chat_id).await {
            tracing::trace!(chat_id = chat_id.0, "chat action dropped; chat busy");
            return Ok(());
        }
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        self.global_lane().await;
        self.inner
            .answer_callback_query(callback_id, text, show_alert)
            .await
    }

    async fn restrict_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.global_lane().await;
        self.inner.restrict_member(chat_id, user_id, until).await
    }

    async fn chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        self.global_lane().await;
        self.inner.chat_administrators(chat_id).await
    }

    async fn chat_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatMemberInfo> {
        self.global_lane().await;
        self.inner.chat_member(chat_id, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeMessenger};

    fn throttled(fake: &Arc<FakeMessenger>, notice_ms: u64) -> ThrottledMessenger {
        ThrottledMessenger::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::ZERO,
                notice_min_interval: Duration::from_millis(notice_ms),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn notices_in_one_chat_are_spaced() {
        let fake = Arc::new(FakeMessenger::default());
        let t = throttled(&fake, 500);

        let start = Instant::now();
        for _ in 0..3 {
            t.send_html(ChatId(1), "hi", None).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(fake.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_skip_the_notice_queue() {
        let fake = Arc::new(FakeMessenger::default());
        let t = throttled(&fake, 5000);

        t.send_html(ChatId(1), "warn", None).await.unwrap();
        t.send_html(ChatId(1), "warn again", None).await.unwrap();
        let start = Instant::now();
        t.delete_message(MessageRef::new(ChatId(1), MessageId(3)))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_is_dropped_while_chat_is_busy() {
        let fake = Arc::new(FakeMessenger::default());
        let t = throttled(&fake, 5000);

        t.send_chat_action(ChatId(2), ChatAction::Typing).await.unwrap();
        t.send_html(ChatId(2), "notice", None).await.unwrap();
        t.send_chat_action(ChatId(2), ChatAction::Typing).await.unwrap();

        let actions = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Action(_)))
            .count();
        assert_eq!(actions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_chats_do_not_wait_on_each_other() {
        let fake = Arc::new(FakeMessenger::default());
        let t = throttled(&fake, 5000);

        let start = Instant::now();
        t.send_html(ChatId(1), "a", None).await.unwrap();
        t.send_html(ChatId(2), "b", None).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
