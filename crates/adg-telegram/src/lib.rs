//! Telegram adapter (teloxide).
//!
//! This crate implements the `adg-core` MessagingPort over the Telegram Bot
//! API, maps teloxide updates into the guard's messenger-neutral types, and
//! wires the dispatcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use teloxide::{
    prelude::*,
    types::{
        ChatMemberKind, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode,
    },
    ApiError, RequestError,
};

use tokio::time::sleep;

pub mod convert;
pub mod router;

use adg_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, ChatMemberInfo, InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

/// `deleteMessages` accepts at most this many ids per call.
const BULK_DELETE_CHUNK: usize = 100;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    http: reqwest::Client,
    api_base: String,
}

/// Envelope of a raw Bot API reply.
#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        let api_base = bot.api_url().as_str().trim_end_matches('/').to_string();
        Self {
            bot,
            http: reqwest::Client::new(),
            api_base,
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn tg_user(user_id: UserId) -> Result<teloxide::types::UserId> {
        u64::try_from(user_id.0)
            .map(teloxide::types::UserId)
            .map_err(|_| Error::Messaging(format!("invalid user id {}", user_id.0)))
    }

    fn markup(keyboard: &InlineKeyboard) -> InlineKeyboardMarkup {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .iter()
            .map(|b| {
                vec![InlineKeyboardButton::callback(
                    b.label.clone(),
                    b.callback_data.clone(),
                )]
            })
            .collect();
        InlineKeyboardMarkup::new(rows)
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::Api(ApiError::MessageNotModified) => Error::NotModified,
            other => Error::Messaging(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    /// Raw `deleteMessages` call; teloxide 0.12 predates the method.
    async fn delete_chunk(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<()> {
        let url = format!("{}/bot{}/deleteMessages", self.api_base, self.bot.token());
        let ids: Vec<i32> = ids.iter().map(|m| m.0).collect();
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "chat_id": chat_id.0, "message_ids": ids }))
            .send()
            .await
            .map_err(|e| Error::Messaging(format!("deleteMessages request failed: {e}")))?;
        let reply: ApiReply = resp
            .json()
            .await
            .map_err(|e| Error::Messaging(format!("deleteMessages bad reply: {e}")))?;

        if reply.ok && reply.result.as_ref().and_then(|v| v.as_bool()) == Some(true) {
            Ok(())
        } else {
            Err(Error::Messaging(format!(
                "deleteMessages refused: {}",
                reply.description.unwrap_or_else(|| "unknown".to_string())
            )))
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_bulk_delete: true,
        }
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let markup = keyboard.map(Self::markup);
        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true);
                if let Some(m) = &markup {
                    req = req.reply_markup(m.clone());
                }
                req
            })
            .await?;

        Ok(MessageRef::new(chat_id, MessageId(msg.id.0)))
    }

    async fn reply_html(
        &self,
        target: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let markup = keyboard.map(Self::markup);
        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_message(Self::tg_chat(target.chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
                    .reply_to_message_id(Self::tg_msg_id(target.message_id))
                    .allow_sending_without_reply(true);
                if let Some(m) = &markup {
                    req = req.reply_markup(m.clone());
                }
                req
            })
            .await?;

        Ok(MessageRef::new(target.chat_id, MessageId(msg.id.0)))
    }

    async fn edit_html(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        // Omitting reply_markup drops any existing keyboard.
        let markup = keyboard.map(Self::markup);
        self.with_retry(|| {
            let mut req = self
                .bot
                .edit_message_text(
                    Self::tg_chat(msg.chat_id),
                    Self::tg_msg_id(msg.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
                .disable_web_page_preview(true);
            if let Some(m) = &markup {
                req = req.reply_markup(m.clone());
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }

    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<()> {
        for chunk in ids.chunks(BULK_DELETE_CHUNK) {
            self.delete_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
        };
        self.with_retry(|| self.bot.send_chat_action(Self::tg_chat(chat_id), tg_action))
            .await?;
        Ok(())
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string()).show_alert(show_alert);
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn restrict_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let user = Self::tg_user(user_id)?;
        self.with_retry(|| {
            self.bot
                .restrict_chat_member(Self::tg_chat(chat_id), user, ChatPermissions::empty())
                .until_date(until)
        })
        .await?;
        Ok(())
    }

    async fn chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let admins = self
            .with_retry(|| self.bot.get_chat_administrators(Self::tg_chat(chat_id)))
            .await?;
        Ok(admins
            .into_iter()
            .map(|m| UserId(m.user.id.0 as i64))
            .collect())
    }

    async fn chat_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatMemberInfo> {
        let user = Self::tg_user(user_id)?;
        let member = self
            .with_retry(|| self.bot.get_chat_member(Self::tg_chat(chat_id), user))
            .await?;
        Ok(ChatMemberInfo {
            user_id,
            first_name: member.user.first_name.clone(),
            privileged: matches!(
                member.kind,
                ChatMemberKind::Owner(_) | ChatMemberKind::Administrator(_)
            ),
        })
    }
}
