//! Inline button payloads: `adsw:<tag>[:<arg>]`.

use crate::domain::{MessageId, UserId};

pub const PREFIX: &str = "adsw";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonAction {
    /// Caption help for the pending media message.
    Guide(MessageId),
    /// Admin-only: mute the user and remove their post.
    Mute(UserId),
    Info,
}

type Decoder = fn(Option<&str>) -> Option<ButtonAction>;

const DECODERS: &[(&str, Decoder)] = &[
    ("guide", decode_guide),
    ("mute", decode_mute),
    ("info", decode_info),
];

fn decode_guide(arg: Option<&str>) -> Option<ButtonAction> {
    Some(ButtonAction::Guide(MessageId(arg?.parse().ok()?)))
}

fn decode_mute(arg: Option<&str>) -> Option<ButtonAction> {
    Some(ButtonAction::Mute(UserId(arg?.parse().ok()?)))
}

fn decode_info(arg: Option<&str>) -> Option<ButtonAction> {
    arg.is_none().then_some(ButtonAction::Info)
}

impl ButtonAction {
    pub fn tag(&self) -> &'static str {
        match self {
            ButtonAction::Guide(_) => "guide",
            ButtonAction::Mute(_) => "mute",
            ButtonAction::Info => "info",
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ButtonAction::Guide(m) => format!("{PREFIX}:{}:{}", self.tag(), m.0),
            ButtonAction::Mute(u) => format!("{PREFIX}:{}:{}", self.tag(), u.0),
            ButtonAction::Info => format!("{PREFIX}:{}", self.tag()),
        }
    }

    /// `None` for payloads that are not ours or are malformed.
    pub fn decode(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, ':');
        if parts.next()? != PREFIX {
            return None;
        }
        let tag = parts.next()?;
        let arg = parts.next();
        let (_, decode) = DECODERS.iter().find(|(t, _)| *t == tag)?;
        decode(arg)
    }

    pub fn is_ours(data: &str) -> bool {
        data.split(':').next() == Some(PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_tags() {
        assert_eq!(
            ButtonAction::decode("adsw:guide:77"),
            Some(ButtonAction::Guide(MessageId(77)))
        );
        assert_eq!(
            ButtonAction::decode("adsw:mute:123456"),
            Some(ButtonAction::Mute(UserId(123_456)))
        );
        assert_eq!(ButtonAction::decode("adsw:info"), Some(ButtonAction::Info));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert_eq!(ButtonAction::decode("adsw:mute:abc"), None);
        assert_eq!(ButtonAction::decode("adsw:mute"), None);
        assert_eq!(ButtonAction::decode("adsw:nuke:1"), None);
        assert_eq!(ButtonAction::decode("vote:1:2"), None);
        assert!(!ButtonAction::is_ours("vote:1:2"));
        assert!(ButtonAction::is_ours("adsw:nuke:1"));
    }

    #[test]
    fn encode_matches_decode() {
        for a in [
            ButtonAction::Guide(MessageId(5)),
            ButtonAction::Mute(UserId(9)),
            ButtonAction::Info,
        ] {
            assert_eq!(ButtonAction::decode(&a.encode()), Some(a));
        }
    }
}
