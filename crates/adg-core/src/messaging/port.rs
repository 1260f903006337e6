use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::types::{ChatAction, ChatMemberInfo, InlineKeyboard, MessagingCapabilities},
    Result,
};

/// Outbound messaging port used by the guard.
///
/// `edit_html` reports an unchanged edit as [`crate::Error::NotModified`];
/// every other refusal is [`crate::Error::Messaging`].
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef>;

    async fn reply_html(
        &self,
        target: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef>;

    /// `None` removes any keyboard.
    async fn edit_html(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()>;

    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    /// All-or-error bulk delete.
    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<()>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()>;

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()>;

    /// Revoke send permissions until `until`.
    async fn restrict_member(&self, chat_id: ChatId, user_id: UserId, until: DateTime<Utc>)
        -> Result<()>;

    async fn chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>>;

    async fn chat_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatMemberInfo>;
}
