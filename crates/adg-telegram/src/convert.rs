//! teloxide update types → the guard's messenger-neutral model.

use teloxide::types::{Chat, Message, User};

use adg_core::{
    domain::{AlbumId, ChatId, MessageId, MessageRef, UserId},
    messaging::types::{CallbackQuery, ChatKind, ForwardOrigin, InboundMessage, Sender},
};

/// Who the bot is, resolved once via `getMe`.
#[derive(Clone, Debug)]
pub struct BotIdentity {
    pub id: UserId,
    /// Without the leading `@`.
    pub username: String,
}

impl BotIdentity {
    fn mentioned_in(&self, text: &str) -> bool {
        !self.username.is_empty()
            && text
                .to_lowercase()
                .contains(&format!("@{}", self.username.to_lowercase()))
    }
}

fn user_id(u: &User) -> UserId {
    UserId(u.id.0 as i64)
}

fn sender(u: &User) -> Sender {
    Sender {
        id: user_id(u),
        is_bot: u.is_bot,
        first_name: u.first_name.clone(),
        username: u.username.clone(),
    }
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_private() {
        ChatKind::Private
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else if chat.is_group() {
        ChatKind::Group
    } else {
        ChatKind::Channel
    }
}

fn forward_origin(msg: &Message) -> Option<ForwardOrigin> {
    if let Some(chat) = msg.forward_from_chat() {
        return Some(if chat.is_channel() {
            ForwardOrigin::Channel
        } else {
            ForwardOrigin::Group
        });
    }
    if let Some(user) = msg.forward_from_user() {
        return Some(if user.is_bot {
            ForwardOrigin::Bot
        } else {
            ForwardOrigin::User
        });
    }
    msg.forward_from_sender_name()
        .map(|_| ForwardOrigin::HiddenUser)
}

fn has_media(msg: &Message) -> bool {
    msg.photo().is_some()
        || msg.video().is_some()
        || msg.animation().is_some()
        || msg.document().is_some()
        || msg.audio().is_some()
        || msg.voice().is_some()
        || msg.video_note().is_some()
}

/// Map a message (new or edited). The replied-to message is mapped too,
/// one level deep as Telegram delivers it.
pub fn inbound(msg: &Message, me: &BotIdentity) -> InboundMessage {
    let reply_to = msg.reply_to_message().map(|r| Box::new(inbound(r, me)));
    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from())
        .is_some_and(|u| user_id(u) == me.id);
    let text = msg.text().map(str::to_string);
    let caption = msg.caption().map(str::to_string);
    let mentions_bot = text
        .as_deref()
        .or(caption.as_deref())
        .is_some_and(|t| me.mentioned_in(t));

    InboundMessage {
        chat_id: ChatId(msg.chat.id.0),
        chat_kind: chat_kind(&msg.chat),
        message_id: MessageId(msg.id.0),
        sender: msg.from().map(sender),
        sender_chat: msg.sender_chat().map(|c| ChatId(c.id.0)),
        sender_chat_title: msg
            .sender_chat()
            .and_then(|c| c.title())
            .map(str::to_string),
        text,
        caption,
        has_media: has_media(msg),
        album_id: msg.media_group_id().map(|g| AlbumId(g.to_string())),
        forward: forward_origin(msg),
        reply_to,
        addressed_to_bot: mentions_bot || replies_to_bot,
    }
}

pub fn callback(q: &teloxide::types::CallbackQuery) -> CallbackQuery {
    CallbackQuery {
        id: q.id.clone(),
        from: sender(&q.from),
        message: q
            .message
            .as_ref()
            .map(|m| MessageRef::new(ChatId(m.chat.id.0), MessageId(m.id.0))),
        message_reply_to: q
            .message
            .as_ref()
            .and_then(|m| m.reply_to_message())
            .map(|r| MessageId(r.id.0)),
        data: q.data.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn me() -> BotIdentity {
        BotIdentity {
            id: UserId(777),
            username: "GuardBot".into(),
        }
    }

    fn group() -> serde_json::Value {
        json!({"id": -1001, "type": "supergroup", "title": "Market"})
    }

    fn user(id: i64) -> serde_json::Value {
        json!({"id": id, "is_bot": id == 777, "first_name": "U"})
    }

    fn message(v: serde_json::Value) -> Message {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn album_photo_with_caption() {
        let msg = message(json!({
            "message_id": 10,
            "date": 1_700_000_000,
            "chat": group(),
            "from": user(5),
            "media_group_id": "alb-1",
            "caption": "two words",
            "photo": [{"file_id": "f", "file_unique_id": "u", "width": 10, "height": 10}]
        }));
        let m = inbound(&msg, &me());
        assert_eq!(m.chat_kind, ChatKind::Supergroup);
        assert!(m.has_media);
        assert_eq!(m.album_id, Some(AlbumId("alb-1".into())));
        assert_eq!(m.content(), "two words");
        assert_eq!(m.sender_id(), Some(UserId(5)));
        assert!(!m.addressed_to_bot);
    }

    #[test]
    fn channel_forward_is_entity() {
        let msg = message(json!({
            "message_id": 11,
            "date": 1_700_000_000,
            "chat": group(),
            "from": user(5),
            "text": "fresh deals",
            "forward_from_chat": {"id": -1002, "type": "channel", "title": "Deals"},
            "forward_date": 1_699_999_999
        }));
        let m = inbound(&msg, &me());
        assert_eq!(m.forward, Some(ForwardOrigin::Channel));
        assert!(m.is_entity_forward());
        assert!(!m.has_media);
    }

    #[test]
    fn mention_and_reply_to_bot_address_it() {
        let mention = message(json!({
            "message_id": 12,
            "date": 1_700_000_000,
            "chat": group(),
            "from": user(5),
            "text": "hey @guardbot what is this"
        }));
        assert!(inbound(&mention, &me()).addressed_to_bot);

        let reply = message(json!({
            "message_id": 13,
            "date": 1_700_000_000,
            "chat": group(),
            "from": user(5),
            "text": "thanks",
            "reply_to_message": {
                "message_id": 3,
                "date": 1_700_000_000,
                "chat": group(),
                "from": user(777),
                "text": "warning"
            }
        }));
        let m = inbound(&reply, &me());
        assert!(m.addressed_to_bot);
        assert_eq!(
            m.reply_to.as_ref().map(|r| r.message_id),
            Some(MessageId(3))
        );
    }
}
