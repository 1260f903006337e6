use std::fmt;

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric). Also used as the ledger tenant id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageRef {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// Media group ("album") id as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlbumId(pub String);

/// Album scoped to its chat; album ids are only unique per chat.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlbumKey {
    pub chat_id: ChatId,
    pub album_id: AlbumId,
}

/// Identity Telegram uses for messages sent by anonymous group admins
/// (`@GroupAnonymousBot`).
pub const ANONYMOUS_ADMIN: UserId = UserId(1_087_968_824);

/// Classifier label for few-shot examples and decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    Ad,
    NotAd,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Ad => "AD",
            Label::NotAd => "NOT_AD",
        }
    }

    /// Parse a stored/raw label. Legacy aliases for the negative class are accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "AD" => Some(Label::Ad),
            "NOT_AD" | "NOTAD" | "NEG" | "SAFE" => Some(Label::NotAd),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
