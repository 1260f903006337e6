//! Per-chat policy resolution.
//!
//! Every setting resolves chat scope → global scope → process defaults. The
//! process defaults come from `ADS_*` env vars layered over compiled-in
//! constants (see [`ChatPolicy::default`]). A failing store never blocks
//! moderation: the resolver logs and falls back to the defaults.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{domain::ChatId, errors::Error, Result};

/// Key/value settings storage (the `bot_config` / `chat_config` tables).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn global_settings(&self) -> Result<HashMap<String, String>>;
    async fn chat_settings(&self, chat_id: ChatId) -> Result<HashMap<String, String>>;
    async fn set_global_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn set_chat_setting(&self, chat_id: ChatId, key: &str, value: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    None,
    Warn,
    Delete,
}

impl PolicyAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "warn" => Some(Self::Warn),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warn => "warn",
            Self::Delete => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    Latest,
    Balanced,
}

impl SelectMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "latest" => Some(Self::Latest),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }
}

/// What happens to a caption warning once the caption turned out fine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessAction {
    Edit,
    Delete,
}

impl SuccessAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "edit" => Some(Self::Edit),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Every tunable the guard reads per chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKey {
    Feature,
    ChatflowId,
    Threshold,
    MaxFewshots,
    ExamplesHardcap,
    ExamplesSelect,
    Action,
    MinGap,
    ReplyExempt,
    ReplyExemptMaxlen,
    ReplyExemptAllowContact,
    ReplyExemptContactMaxlen,
    CaptionMinWords,
    NocapGrace,
    AllowForwardEntities,
    ForwardCaptionMinWords,
    ForwardGrace,
    AllowReplyAsCaption,
    ShortWarnCooldown,
    ReoffendGrace,
    ReoffendCooldown,
    WarnEditCooldown,
    WarnSuccessAction,
    WarnSuccessAutodel,
    Autoclean,
    MuteHours,
    MaxCarry,
}

impl PolicyKey {
    pub const ALL: [PolicyKey; 27] = [
        PolicyKey::Feature,
        PolicyKey::ChatflowId,
        PolicyKey::Threshold,
        PolicyKey::MaxFewshots,
        PolicyKey::ExamplesHardcap,
        PolicyKey::ExamplesSelect,
        PolicyKey::Action,
        PolicyKey::MinGap,
        PolicyKey::ReplyExempt,
        PolicyKey::ReplyExemptMaxlen,
        PolicyKey::ReplyExemptAllowContact,
        PolicyKey::ReplyExemptContactMaxlen,
        PolicyKey::CaptionMinWords,
        PolicyKey::NocapGrace,
        PolicyKey::AllowForwardEntities,
        PolicyKey::ForwardCaptionMinWords,
        PolicyKey::ForwardGrace,
        PolicyKey::AllowReplyAsCaption,
        PolicyKey::ShortWarnCooldown,
        PolicyKey::ReoffendGrace,
        PolicyKey::ReoffendCooldown,
        PolicyKey::WarnEditCooldown,
        PolicyKey::WarnSuccessAction,
        PolicyKey::WarnSuccessAutodel,
        PolicyKey::Autoclean,
        PolicyKey::MuteHours,
        PolicyKey::MaxCarry,
    ];

    /// Key in `bot_config` / `chat_config`.
    pub fn key(self) -> &'static str {
        match self {
            PolicyKey::Feature => "ads_feature",
            PolicyKey::ChatflowId => "ads_chatflow_id",
            PolicyKey::Threshold => "ads_threshold",
            PolicyKey::MaxFewshots => "ads_max_fewshots",
            PolicyKey::ExamplesHardcap => "ads_examples_hardcap",
            PolicyKey::ExamplesSelect => "ads_examples_select",
            PolicyKey::Action => "ads_action",
            PolicyKey::MinGap => "ads_min_gap_sec",
            PolicyKey::ReplyExempt => "ads_reply_exempt",
            PolicyKey::ReplyExemptMaxlen => "ads_reply_exempt_maxlen",
            PolicyKey::ReplyExemptAllowContact => "ads_reply_exempt_allow_contact",
            PolicyKey::ReplyExemptContactMaxlen => "ads_reply_exempt_contact_maxlen",
            PolicyKey::CaptionMinWords => "ads_caption_min_len",
            PolicyKey::NocapGrace => "ads_nocap_grace_sec",
            PolicyKey::AllowForwardEntities => "ads_allow_forward_entities",
            PolicyKey::ForwardCaptionMinWords => "ads_forward_caption_min_len",
            PolicyKey::ForwardGrace => "ads_forward_grace_sec",
            PolicyKey::AllowReplyAsCaption => "ads_allow_reply_as_caption",
            PolicyKey::ShortWarnCooldown => "ads_short_warn_cooldown_sec",
            PolicyKey::ReoffendGrace => "ads_reoffend_grace_sec",
            PolicyKey::ReoffendCooldown => "ads_reoffend_cooldown_sec",
            PolicyKey::WarnEditCooldown => "ads_warn_edit_cooldown_sec",
            PolicyKey::WarnSuccessAction => "ads_warn_success_action",
            PolicyKey::WarnSuccessAutodel => "ads_warn_success_autodel_sec",
            PolicyKey::Autoclean => "ads_autoclean_sec",
            PolicyKey::MuteHours => "ads_mute_hours",
            PolicyKey::MaxCarry => "tokens_max_carry",
        }
    }

    /// Env var providing the process-wide default.
    pub fn env_key(self) -> String {
        self.key().to_uppercase()
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_lowercase();
        Self::ALL.into_iter().find(|k| k.key() == key)
    }
}

/// Resolved per-chat settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatPolicy {
    pub feature_on: bool,
    pub chatflow_id: String,
    pub threshold: f64,
    pub max_fewshots: usize,
    pub examples_hardcap: usize,
    pub examples_select: SelectMode,
    pub action: PolicyAction,
    pub min_gap: Duration,
    pub reply_exempt: bool,
    pub reply_exempt_maxlen: usize,
    pub reply_exempt_allow_contact: bool,
    pub reply_exempt_contact_maxlen: usize,
    pub caption_min_words: usize,
    pub nocap_grace: Duration,
    pub allow_forward_entities: bool,
    pub forward_caption_min_words: usize,
    pub forward_grace: Duration,
    pub allow_reply_as_caption: bool,
    pub short_warn_cooldown: Duration,
    pub reoffend_grace: Duration,
    pub reoffend_cooldown: Duration,
    pub warn_edit_cooldown: Duration,
    pub warn_success_action: SuccessAction,
    pub warn_success_autodel: Duration,
    pub autoclean: Duration,
    pub mute_hours: u32,
    pub max_carry: i64,
}

/// The process-wide layer under global and chat scope.
pub type PolicyDefaults = ChatPolicy;

impl Default for ChatPolicy {
    fn default() -> Self {
        Self {
            feature_on: false,
            chatflow_id: String::new(),
            threshold: 0.78,
            max_fewshots: 10,
            examples_hardcap: 50,
            examples_select: SelectMode::Latest,
            action: PolicyAction::None,
            min_gap: Duration::from_secs(2),
            reply_exempt: true,
            reply_exempt_maxlen: 160,
            reply_exempt_allow_contact: true,
            reply_exempt_contact_maxlen: 360,
            caption_min_words: 10,
            nocap_grace: Duration::from_secs(300),
            allow_forward_entities: true,
            forward_caption_min_words: 20,
            forward_grace: Duration::from_secs(120),
            allow_reply_as_caption: true,
            short_warn_cooldown: Duration::from_secs(20),
            reoffend_grace: Duration::from_secs(60),
            reoffend_cooldown: Duration::from_secs(15),
            warn_edit_cooldown: Duration::from_secs(90),
            warn_success_action: SuccessAction::Edit,
            warn_success_autodel: Duration::ZERO,
            autoclean: Duration::from_secs(120),
            mute_hours: 100,
            max_carry: 1,
        }
    }
}

impl ChatPolicy {
    /// Compiled-in defaults overridden by `ADS_*` env vars.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        for key in PolicyKey::ALL {
            if let Ok(raw) = std::env::var(key.env_key()) {
                if !policy.apply(key, &raw) {
                    tracing::warn!(key = key.key(), value = %raw, "ignoring invalid env default");
                }
            }
        }
        policy
    }

    /// Apply one raw setting. Returns `false` (leaving the field untouched)
    /// when the value does not parse.
    pub fn apply(&mut self, key: PolicyKey, raw: &str) -> bool {
        let raw = raw.trim();
        match key {
            PolicyKey::Feature => set(&mut self.feature_on, parse_flag(raw)),
            PolicyKey::ChatflowId => {
                self.chatflow_id = raw.to_string();
                true
            }
            PolicyKey::Threshold => set(
                &mut self.threshold,
                raw.parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v)),
            ),
            PolicyKey::MaxFewshots => set(&mut self.max_fewshots, raw.parse().ok()),
            PolicyKey::ExamplesHardcap => set(&mut self.examples_hardcap, raw.parse().ok()),
            PolicyKey::ExamplesSelect => set(&mut self.examples_select, SelectMode::parse(raw)),
            PolicyKey::Action => set(&mut self.action, PolicyAction::parse(raw)),
            PolicyKey::MinGap => set(&mut self.min_gap, parse_secs(raw)),
            PolicyKey::ReplyExempt => set(&mut self.reply_exempt, parse_flag(raw)),
            PolicyKey::ReplyExemptMaxlen => set(&mut self.reply_exempt_maxlen, raw.parse().ok()),
            PolicyKey::ReplyExemptAllowContact => {
                set(&mut self.reply_exempt_allow_contact, parse_flag(raw))
            }
            PolicyKey::ReplyExemptContactMaxlen => {
                set(&mut self.reply_exempt_contact_maxlen, raw.parse().ok())
            }
            PolicyKey::CaptionMinWords => set(&mut self.caption_min_words, raw.parse().ok()),
            PolicyKey::NocapGrace => set(&mut self.nocap_grace, parse_secs(raw)),
            PolicyKey::AllowForwardEntities => {
                set(&mut self.allow_forward_entities, parse_flag(raw))
            }
            PolicyKey::ForwardCaptionMinWords => {
                set(&mut self.forward_caption_min_words, raw.parse().ok())
            }
            PolicyKey::ForwardGrace => set(&mut self.forward_grace, parse_secs(raw)),
            PolicyKey::AllowReplyAsCaption => {
                set(&mut self.allow_reply_as_caption, parse_flag(raw))
            }
            PolicyKey::ShortWarnCooldown => set(&mut self.short_warn_cooldown, parse_secs(raw)),
            PolicyKey::ReoffendGrace => set(&mut self.reoffend_grace, parse_secs(raw)),
            PolicyKey::ReoffendCooldown => set(&mut self.reoffend_cooldown, parse_secs(raw)),
            PolicyKey::WarnEditCooldown => set(&mut self.warn_edit_cooldown, parse_secs(raw)),
            PolicyKey::WarnSuccessAction => {
                set(&mut self.warn_success_action, SuccessAction::parse(raw))
            }
            PolicyKey::WarnSuccessAutodel => {
                set(&mut self.warn_success_autodel, parse_secs(raw))
            }
            PolicyKey::Autoclean => set(&mut self.autoclean, parse_secs(raw)),
            PolicyKey::MuteHours => set(&mut self.mute_hours, raw.parse().ok()),
            PolicyKey::MaxCarry => set(
                &mut self.max_carry,
                raw.parse::<i64>().ok().filter(|v| *v >= 0),
            ),
        }
    }

    fn layer(&mut self, values: &HashMap<String, String>) {
        for (k, v) in values {
            if let Some(key) = PolicyKey::from_key(k) {
                if !self.apply(key, v) {
                    tracing::debug!(key = %k, value = %v, "ignoring unparsable setting");
                }
            }
        }
    }

    /// Word minimum for a caption, stricter for forwards from external entities.
    pub fn caption_minimum(&self, is_entity_forward: bool) -> usize {
        let min = if is_entity_forward {
            self.forward_caption_min_words
        } else {
            self.caption_min_words
        };
        min.max(1)
    }

    pub fn grace_for(&self, is_entity_forward: bool) -> Duration {
        if is_entity_forward {
            self.forward_grace
        } else {
            self.nocap_grace
        }
    }

    pub fn effective_mute_hours(&self) -> u32 {
        self.mute_hours.max(1)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn parse_secs(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Config Resolver: layered settings lookup with typed setters.
#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<dyn SettingsStore>,
    defaults: ChatPolicy,
}

impl SettingsResolver {
    pub fn new(store: Arc<dyn SettingsStore>, defaults: ChatPolicy) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &ChatPolicy {
        &self.defaults
    }

    /// Resolve the policy for a chat. Store failures degrade to the defaults.
    pub async fn policy(&self, chat_id: ChatId) -> ChatPolicy {
        let mut policy = self.defaults.clone();

        match self.store.global_settings().await {
            Ok(values) => policy.layer(&values),
            Err(e) => tracing::warn!(error = %e, "global settings unavailable; using defaults"),
        }
        match self.store.chat_settings(chat_id).await {
            Ok(values) => policy.layer(&values),
            Err(e) => {
                tracing::warn!(chat_id = chat_id.0, error = %e, "chat settings unavailable")
            }
        }

        policy
    }

    /// Validate and persist a chat-scoped setting.
    pub async fn set_chat(&self, chat_id: ChatId, key: PolicyKey, value: &str) -> Result<()> {
        validate(key, value)?;
        self.store
            .set_chat_setting(chat_id, key.key(), value.trim())
            .await
    }

    /// Validate and persist a global setting.
    pub async fn set_global(&self, key: PolicyKey, value: &str) -> Result<()> {
        validate(key, value)?;
        self.store.set_global_setting(key.key(), value.trim()).await
    }
}

fn validate(key: PolicyKey, value: &str) -> Result<()> {
    let mut scratch = ChatPolicy::default();
    if scratch.apply(key, value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid value for {}: {value:?}",
            key.key()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn every_key_round_trips_through_from_key() {
        for key in PolicyKey::ALL {
            assert_eq!(PolicyKey::from_key(key.key()), Some(key));
        }
    }

    #[test]
    fn invalid_values_keep_previous_value() {
        let mut p = ChatPolicy::default();
        assert!(!p.apply(PolicyKey::Action, "explode"));
        assert_eq!(p.action, PolicyAction::None);
        assert!(!p.apply(PolicyKey::Threshold, "abc"));
        assert!(!p.apply(PolicyKey::Threshold, "1.5"));
        assert!(!p.apply(PolicyKey::Threshold, "-0.1"));
        assert!(!p.apply(PolicyKey::Threshold, "NaN"));
        assert!((p.threshold - 0.78).abs() < f64::EPSILON);
        assert!(p.apply(PolicyKey::Threshold, "1"));
        assert!(p.apply(PolicyKey::Feature, "ON"));
        assert!(p.feature_on);
    }

    #[test]
    fn caption_minimum_is_at_least_one() {
        let p = ChatPolicy {
            caption_min_words: 0,
            forward_caption_min_words: 7,
            ..ChatPolicy::default()
        };
        assert_eq!(p.caption_minimum(false), 1);
        assert_eq!(p.caption_minimum(true), 7);
    }

    #[tokio::test]
    async fn chat_scope_overrides_global_scope() {
        let store = Arc::new(MemoryStore::default());
        let resolver = SettingsResolver::new(store.clone(), ChatPolicy::default());

        resolver.set_global(PolicyKey::Action, "warn").await.unwrap();
        resolver.set_global(PolicyKey::Threshold, "0.5").await.unwrap();
        resolver
            .set_chat(ChatId(7), PolicyKey::Action, "delete")
            .await
            .unwrap();

        let p7 = resolver.policy(ChatId(7)).await;
        assert_eq!(p7.action, PolicyAction::Delete);
        assert!((p7.threshold - 0.5).abs() < f64::EPSILON);

        let p8 = resolver.policy(ChatId(8)).await;
        assert_eq!(p8.action, PolicyAction::Warn);
    }

    #[tokio::test]
    async fn setter_rejects_invalid_values() {
        let store = Arc::new(MemoryStore::default());
        let resolver = SettingsResolver::new(store, ChatPolicy::default());
        let err = resolver
            .set_chat(ChatId(1), PolicyKey::MuteHours, "forever")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn failing_store_degrades_to_defaults() {
        let store = Arc::new(MemoryStore::default());
        store.fail_settings(true);
        let defaults = ChatPolicy {
            feature_on: true,
            ..ChatPolicy::default()
        };
        let resolver = SettingsResolver::new(store, defaults.clone());
        assert_eq!(resolver.policy(ChatId(1)).await, defaults);
    }
}
