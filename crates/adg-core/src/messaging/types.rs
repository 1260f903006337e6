use crate::domain::{AlbumId, ChatId, MessageId, MessageRef, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChatKind::Group | ChatKind::Supergroup)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub id: UserId,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

/// Where a forwarded message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOrigin {
    User,
    HiddenUser,
    Bot,
    Group,
    Channel,
}

impl ForwardOrigin {
    /// Forwards from channels, groups and bots get the stricter policy.
    pub fn is_entity(self) -> bool {
        matches!(
            self,
            ForwardOrigin::Bot | ForwardOrigin::Group | ForwardOrigin::Channel
        )
    }
}

/// Messenger-neutral view of an inbound (or edited) message.
///
/// Platform adapters fill this in; the guard never sees platform types.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub message_id: MessageId,
    pub sender: Option<Sender>,
    /// Set when the message was sent on behalf of a chat (anonymous admin,
    /// linked channel).
    pub sender_chat: Option<ChatId>,
    pub sender_chat_title: Option<String>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub has_media: bool,
    pub album_id: Option<AlbumId>,
    pub forward: Option<ForwardOrigin>,
    pub reply_to: Option<Box<InboundMessage>>,
    /// Mentions the bot or replies to one of its messages.
    pub addressed_to_bot: bool,
}

impl InboundMessage {
    pub fn msg_ref(&self) -> MessageRef {
        MessageRef::new(self.chat_id, self.message_id)
    }

    /// Text, or caption when there is no text, trimmed.
    pub fn content(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or_default()
            .trim()
    }

    pub fn sender_id(&self) -> Option<UserId> {
        self.sender.as_ref().map(|s| s.id)
    }

    pub fn is_entity_forward(&self) -> bool {
        self.forward.is_some_and(ForwardOrigin::is_entity)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallbackQuery {
    pub id: String,
    pub from: Sender,
    /// The message carrying the button.
    pub message: Option<MessageRef>,
    /// What that message replies to.
    pub message_reply_to: Option<MessageId>,
    pub data: String,
}

/// Outgoing "chat action" (typing indicator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Inline keyboard, one button per row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    pub fn single(button: InlineButton) -> Self {
        Self {
            buttons: vec![button],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMemberInfo {
    pub user_id: UserId,
    pub first_name: String,
    /// Owner or administrator.
    pub privileged: bool,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    /// One call can delete many messages of a chat.
    pub supports_bulk_delete: bool,
}
