//! `AdsGuard`: the moderation pipeline for group messages, edits and warning
//! buttons, plus the admin operations around it.
//!
//! One guard instance owns all in-memory state. The state mutex is only held
//! for bookkeeping, never across a platform, store or classifier call, so every
//! step re-checks state after it awaits.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{Mutex, Semaphore},
    time::Instant,
};

use crate::{
    actions::{delete_many, edit_tolerant, keyboard, schedule_delete, AdminCache, WarnCooldowns},
    callbacks::ButtonAction,
    caption::{album_key, CaptionBook, DeferredWarning, PendingEntry},
    classify::{Classifier, ClassifyError, ClassifyRequest, Verdict},
    config::Config,
    decision::{decide, simulate, summarize, Decision, DecisionStats, MinGap, Simulation, StatsWindow},
    dedup::TtlCache,
    domain::{AlbumId, AlbumKey, ChatId, Label, MessageRef, UserId, ANONYMOUS_ADMIN},
    examples::{self, AddExampleOutcome, ExamplePreview, ExampleStats},
    ledger::{GrantOutcome, LedgerStore, SpendOutcome, TokenLedger},
    messaging::{
        port::MessagingPort,
        types::{CallbackQuery, ChatAction, InboundMessage, InlineButton, InlineKeyboard},
    },
    notices,
    settings::{ChatPolicy, PolicyAction, PolicyKey, SettingsResolver, SettingsStore, SuccessAction},
    store::{ModerationStore, NewDecision, WhitelistEntry},
    tasks::DelayedTasks,
    text::{count_words, extract_domains, has_contact_like, is_request_intent, normalize_domain, strip_mention},
    Error, Result,
};

const MESSAGE_SWEEP_THRESHOLD: usize = 5000;
const ALBUM_SWEEP_THRESHOLD: usize = 2000;

/// Why a message left the pipeline without a classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    NotGroup,
    FeatureOff,
    FromBot,
    Duplicate,
    AnonymousAdmin,
    Admin,
    WhitelistedUser,
    MediaReply,
    AddressedToBot,
    EmptyText,
    ReplyExempt,
    WhitelistedDomain,
    Command,
    MinGap,
    AlbumClassified,
    NotMedia,
    Cooldown,
}

/// What happened to a message classified as an ad (or not).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enforcement {
    Allowed,
    /// AD, but the chat's action is `none`.
    Tolerated,
    Warned,
    WarningEdited,
    WarnFailed,
    Deleted,
    QuotaDeleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    Skipped(Skip),
    CaptionPending,
    CaptionReopened,
    ForwardRemoved,
    Classified { is_ad: bool, enforcement: Enforcement },
}

/// Result of a dry-run classification.
#[derive(Clone, Debug, PartialEq)]
pub struct Probe {
    pub verdict: std::result::Result<Verdict, ClassifyError>,
    pub decision: Decision,
    pub examples_used: usize,
}

#[derive(Clone, Debug)]
pub struct GuardOptions {
    pub dedup_ttl: Duration,
    pub classify_max_concurrency: usize,
    pub admin_cache_ttl: Duration,
    /// Lower-cased, without `@`. Enables the bot-addressed exemption.
    pub bot_username: Option<String>,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(600),
            classify_max_concurrency: 4,
            admin_cache_ttl: Duration::from_secs(300),
            bot_username: None,
        }
    }
}

impl GuardOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            dedup_ttl: cfg.dedup_ttl,
            classify_max_concurrency: cfg.classify_max_concurrency.max(1),
            ..Self::default()
        }
    }
}

/// The ports a guard runs against.
pub struct GuardPorts {
    pub messenger: Arc<dyn MessagingPort>,
    pub settings: Arc<dyn SettingsStore>,
    pub store: Arc<dyn ModerationStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub classifier: Arc<dyn Classifier>,
}

struct GuardState {
    seen: TtlCache<MessageRef>,
    classified_albums: TtlCache<AlbumKey>,
    caption: CaptionBook,
    min_gap: MinGap,
    warns: WarnCooldowns,
    admins: AdminCache,
    autoclean: DelayedTasks<MessageRef>,
}

/// How an edit continues once its new caption has been measured.
enum EditStep {
    /// Sufficient: run the full pipeline, closing any caption warning.
    Rerun(Option<DeferredWarning>),
    /// Still short; the pending entry, if any.
    Short(Option<PendingEntry>),
}

/// The message being judged. Usually the inbound message itself; a pending
/// media message when a reply supplied its caption.
struct Subject<'a> {
    at: MessageRef,
    album_id: Option<AlbumId>,
    has_media: bool,
    entity_forward: bool,
    reply_to: Option<&'a InboundMessage>,
    via_reply: bool,
}

impl<'a> Subject<'a> {
    fn of(msg: &'a InboundMessage) -> Self {
        Self {
            at: msg.msg_ref(),
            album_id: msg.album_id.clone(),
            has_media: msg.has_media,
            entity_forward: msg.is_entity_forward(),
            reply_to: msg.reply_to.as_deref(),
            via_reply: false,
        }
    }
}

pub struct AdsGuard {
    messenger: Arc<dyn MessagingPort>,
    settings: SettingsResolver,
    store: Arc<dyn ModerationStore>,
    ledger: TokenLedger,
    classifier: Arc<dyn Classifier>,
    permits: Semaphore,
    bot_username: Option<String>,
    state: Mutex<GuardState>,
}

impl AdsGuard {
    pub fn new(ports: GuardPorts, defaults: ChatPolicy, options: GuardOptions) -> Arc<Self> {
        Arc::new(Self {
            messenger: ports.messenger,
            settings: SettingsResolver::new(ports.settings, defaults),
            store: ports.store,
            ledger: TokenLedger::new(ports.ledger),
            classifier: ports.classifier,
            permits: Semaphore::new(options.classify_max_concurrency.max(1)),
            bot_username: options
                .bot_username
                .map(|u| u.trim_start_matches('@').to_lowercase())
                .filter(|u| !u.is_empty()),
            state: Mutex::new(GuardState {
                seen: TtlCache::new(options.dedup_ttl, MESSAGE_SWEEP_THRESHOLD),
                classified_albums: TtlCache::new(options.dedup_ttl, ALBUM_SWEEP_THRESHOLD),
                caption: CaptionBook::new(options.dedup_ttl),
                min_gap: MinGap::default(),
                warns: WarnCooldowns::default(),
                admins: AdminCache::new(options.admin_cache_ttl),
                autoclean: DelayedTasks::new(),
            }),
        })
    }

    // ---- message pipeline ----

    /// Run one new (or re-submitted) group message through the pipeline.
    /// Never fails: every error is logged and degrades to a safe branch.
    pub async fn watchdog(self: &Arc<Self>, msg: &InboundMessage) -> WatchOutcome {
        self.run_pipeline(msg, None).await
    }

    /// `carried` is a caption warning left over from resolving `msg` by edit.
    async fn run_pipeline(
        self: &Arc<Self>,
        msg: &InboundMessage,
        carried: Option<DeferredWarning>,
    ) -> WatchOutcome {
        if !msg.chat_kind.is_group() {
            return WatchOutcome::Skipped(Skip::NotGroup);
        }
        let chat = msg.chat_id;
        let policy = self.settings.policy(chat).await;
        if !policy.feature_on {
            return WatchOutcome::Skipped(Skip::FeatureOff);
        }
        if msg.sender.as_ref().is_some_and(|s| s.is_bot) {
            return WatchOutcome::Skipped(Skip::FromBot);
        }

        let key = msg.msg_ref();
        let now = Instant::now();
        if !self.state.lock().await.seen.check_and_mark(key, now) {
            return WatchOutcome::Skipped(Skip::Duplicate);
        }
        let mut deferred = carried;

        if let Some(skip) = self.exemption(chat, msg).await {
            return WatchOutcome::Skipped(skip);
        }

        let mut text = msg.content().to_string();
        let mut subject = Subject::of(msg);

        if !text.is_empty() && policy.allow_reply_as_caption {
            if let Some(parent) = msg.reply_to.as_deref() {
                let mut st = self.state.lock().await;
                if let Some(pending) = st.caption.find_for_reply(parent) {
                    let sufficient = st.caption.entry(&pending).is_some_and(|e| {
                        count_words(&text) >= policy.caption_minimum(e.is_forward)
                    });
                    if sufficient {
                        if let Some(resolved) = st.caption.resolve(&pending, Some(msg.message_id), now) {
                            tracing::info!(
                                chat_id = chat.0,
                                message_id = pending.message_id.0,
                                reply_id = msg.message_id.0,
                                "caption supplied by reply"
                            );
                            deferred = resolved.deferred.or(deferred);
                            subject = Subject {
                                at: pending,
                                album_id: resolved.entry.album_id,
                                has_media: true,
                                entity_forward: resolved.entry.is_forward,
                                reply_to: None,
                                via_reply: true,
                            };
                        }
                    }
                }
            }
        }

        if let Some(album) = subject.album_id.as_ref() {
            let ak = album_key(chat, album);
            let mut st = self.state.lock().await;
            if text.is_empty() {
                text = st.caption.album_caption(&ak, now).unwrap_or_default().to_string();
            } else if !subject.via_reply {
                st.caption.cache_album_caption(ak, &text, now);
            }
        }

        if subject.has_media && subject.reply_to.is_some() {
            return WatchOutcome::Skipped(Skip::MediaReply);
        }

        if subject.entity_forward && !policy.allow_forward_entities {
            self.remove_forward(msg, subject.at, &policy).await;
            return WatchOutcome::ForwardRemoved;
        }

        if msg.addressed_to_bot && self.bot_addressed_exempt(&text, &policy) {
            return WatchOutcome::Skipped(Skip::AddressedToBot);
        }

        let minimum = policy.caption_minimum(subject.entity_forward);
        if subject.has_media && !subject.via_reply && count_words(&text) < minimum {
            return self.open_pending(msg, &subject, &policy, minimum).await;
        }

        if text.is_empty() {
            return WatchOutcome::Skipped(Skip::EmptyText);
        }
        if policy.reply_exempt && reply_exempt(subject.reply_to, &text, &policy) {
            return WatchOutcome::Skipped(Skip::ReplyExempt);
        }
        if self.domain_whitelisted(chat, &text).await {
            return WatchOutcome::Skipped(Skip::WhitelistedDomain);
        }
        if text.starts_with("/ads") {
            return WatchOutcome::Skipped(Skip::Command);
        }

        {
            let mut st = self.state.lock().await;
            let album = subject.album_id.as_ref().map(|a| album_key(chat, a));
            if album
                .as_ref()
                .is_some_and(|ak| st.classified_albums.seen(ak, now))
            {
                return WatchOutcome::Skipped(Skip::AlbumClassified);
            }
            if !st.min_gap.try_acquire(chat, policy.min_gap, now) {
                tracing::debug!(chat_id = chat.0, message_id = key.message_id.0, "min gap; skipped");
                return WatchOutcome::Skipped(Skip::MinGap);
            }
            if let Some(ak) = album {
                st.classified_albums.mark(ak, now);
            }
        }

        if let Err(e) = self
            .messenger
            .send_chat_action(chat, ChatAction::Typing)
            .await
        {
            tracing::debug!(chat_id = chat.0, error = %e, "typing indicator failed");
        }

        let is_reply = subject.reply_to.is_some() || subject.via_reply;
        let (verdict, _) = self.classify(chat, &policy, &text, is_reply).await;
        let decision = decide(&verdict, policy.threshold);
        tracing::info!(
            chat_id = chat.0,
            message_id = subject.at.message_id.0,
            label = decision.label.map(Label::as_str).unwrap_or("-"),
            score = decision.score,
            is_ad = decision.is_ad,
            reason = %decision.reason,
            "classified"
        );

        let row = NewDecision {
            chat_id: chat,
            message_id: subject.at.message_id,
            user_id: msg.sender_id(),
            text: text.clone(),
            label: decision.label,
            is_ad: decision.is_ad,
            score: decision.score,
            reason: decision.reason.clone(),
        };
        if let Err(e) = self.store.save_decision(&row).await {
            tracing::warn!(chat_id = chat.0, error = %e, "failed to persist decision");
        }

        if !decision.is_ad {
            if let Some(d) = deferred {
                self.close_deferred(chat, d, &policy).await;
            }
            return WatchOutcome::Classified {
                is_ad: false,
                enforcement: Enforcement::Allowed,
            };
        }

        let enforcement = self.enforce(msg, subject.at, &policy, deferred).await;
        WatchOutcome::Classified {
            is_ad: true,
            enforcement,
        }
    }

    /// Caption edits: resolve, nag, or re-open, then re-run the pipeline when
    /// the new caption is sufficient.
    pub async fn on_edited_message(self: &Arc<Self>, msg: &InboundMessage) -> WatchOutcome {
        if !msg.chat_kind.is_group() {
            return WatchOutcome::Skipped(Skip::NotGroup);
        }
        let chat = msg.chat_id;
        let policy = self.settings.policy(chat).await;
        if !policy.feature_on {
            return WatchOutcome::Skipped(Skip::FeatureOff);
        }
        if msg.sender.as_ref().is_some_and(|s| s.is_bot) {
            return WatchOutcome::Skipped(Skip::FromBot);
        }
        if let Some(skip) = self.exemption(chat, msg).await {
            return WatchOutcome::Skipped(skip);
        }

        let key = msg.msg_ref();
        let now = Instant::now();
        let minimum = policy.caption_minimum(msg.is_entity_forward());

        let step = {
            let mut st = self.state.lock().await;
            let mut text = msg.content().to_string();
            if text.is_empty() {
                if let Some(album) = msg.album_id.as_ref() {
                    text = st
                        .caption
                        .album_caption(&album_key(chat, album), now)
                        .unwrap_or_default()
                        .to_string();
                }
            }

            if count_words(&text) >= minimum {
                let resolved = st.caption.resolve(&key, None, now);
                if resolved.is_some() {
                    tracing::info!(chat_id = chat.0, message_id = key.message_id.0, "caption supplied by edit");
                }
                st.seen.forget(&key);
                EditStep::Rerun(resolved.and_then(|r| r.deferred))
            } else {
                EditStep::Short(st.caption.entry(&key).cloned())
            }
        };

        let pending = match step {
            EditStep::Short(pending) => pending,
            EditStep::Rerun(carried) => return self.run_pipeline(msg, carried).await,
        };

        if let Some(entry) = pending {
            let allowed = {
                let mut st = self.state.lock().await;
                st.caption
                    .short_warn_allowed(key, policy.short_warn_cooldown, now)
            };
            if allowed {
                if let Some(w) = entry.warning {
                    let kb = guide_keyboard(key);
                    if let Err(e) = edit_tolerant(
                        self.messenger.as_ref(),
                        MessageRef::new(chat, w),
                        &notices::caption_too_short(minimum),
                        Some(&kb),
                    )
                    .await
                    {
                        tracing::debug!(chat_id = chat.0, error = %e, "short caption notice failed");
                    }
                }
            }
            return WatchOutcome::CaptionPending;
        }

        {
            let mut st = self.state.lock().await;
            if !msg.has_media {
                let parent_pending = msg
                    .reply_to
                    .as_deref()
                    .is_some_and(|p| st.caption.is_pending(&p.msg_ref()));
                if !parent_pending {
                    return WatchOutcome::Skipped(Skip::NotMedia);
                }
            }
            if !st
                .caption
                .reoffend_allowed(key, policy.reoffend_cooldown, now)
            {
                return WatchOutcome::Skipped(Skip::Cooldown);
            }
        }

        let grace = policy.reoffend_grace;
        let warning = match self
            .messenger
            .reply_html(key, &notices::reopen(grace), Some(&guide_keyboard(key)))
            .await
        {
            Ok(w) => Some(w.message_id),
            Err(e) => {
                tracing::warn!(chat_id = chat.0, message_id = key.message_id.0, error = %e, "reopen warning failed");
                None
            }
        };

        let entry = PendingEntry {
            submitter: msg.sender_id(),
            grace,
            created_at: now,
            is_forward: msg.is_entity_forward(),
            album_id: msg.album_id.clone(),
            warning,
        };
        self.arm_pending(key, entry).await;
        tracing::info!(chat_id = chat.0, message_id = key.message_id.0, "caption reopened");
        WatchOutcome::CaptionReopened
    }

    // ---- buttons ----

    pub async fn on_callback(self: &Arc<Self>, q: &CallbackQuery) {
        let Some(action) = ButtonAction::decode(&q.data) else {
            self.answer(q, Some(notices::invalid_button()), false).await;
            return;
        };
        match action {
            ButtonAction::Guide(_) => {
                let min_words = match q.message {
                    Some(m) => self.settings.policy(m.chat_id).await.caption_min_words,
                    None => self.settings.defaults().caption_min_words,
                };
                self.answer(q, Some(&notices::guide_alert(min_words)), true)
                    .await;
            }
            ButtonAction::Info => {
                let hours = match q.message {
                    Some(m) => self.settings.policy(m.chat_id).await.effective_mute_hours(),
                    None => self.settings.defaults().effective_mute_hours(),
                };
                self.answer(q, Some(&notices::info_alert(hours)), true).await;
            }
            ButtonAction::Mute(target) => self.mute(q, target).await,
        }
    }

    async fn mute(self: &Arc<Self>, q: &CallbackQuery, target: UserId) {
        let Some(warning) = q.message else {
            self.answer(q, Some(notices::invalid_button()), true).await;
            return;
        };
        let chat = warning.chat_id;
        let policy = self.settings.policy(chat).await;
        let hours = policy.effective_mute_hours();

        if q.from.id != ANONYMOUS_ADMIN {
            match self.messenger.chat_member(chat, q.from.id).await {
                Ok(m) if m.privileged => {}
                Ok(_) => {
                    self.answer(q, Some(notices::admins_only()), true).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(chat_id = chat.0, error = %e, "admin check failed");
                    self.answer(q, Some(notices::permission_check_failed()), true)
                        .await;
                    return;
                }
            }
        }

        let member = match self.messenger.chat_member(chat, target).await {
            Ok(m) if m.privileged => {
                self.answer(q, Some(notices::cannot_mute_admin()), true).await;
                return;
            }
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(chat_id = chat.0, user_id = target.0, error = %e, "target lookup failed");
                self.answer(q, Some(notices::permission_check_failed()), true)
                    .await;
                return;
            }
        };

        let until = Utc::now() + chrono::Duration::hours(i64::from(hours));
        if let Err(e) = self.messenger.restrict_member(chat, target, until).await {
            tracing::warn!(chat_id = chat.0, user_id = target.0, error = %e, "restrict failed");
            self.answer(q, Some(&notices::action_failed(&e.to_string())), true)
                .await;
            return;
        }

        let recorded = self
            .state
            .lock()
            .await
            .caption
            .take_mute_targets(&warning, Instant::now());
        let ids = match recorded {
            Some(t) => t.all(),
            None => q.message_reply_to.into_iter().collect(),
        };
        let removed = delete_many(self.messenger.as_ref(), chat, &ids).await;

        if let Err(e) = edit_tolerant(
            self.messenger.as_ref(),
            warning,
            &notices::mute_done(&member.first_name, hours),
            None,
        )
        .await
        {
            tracing::debug!(chat_id = chat.0, error = %e, "mute confirmation edit failed");
        }
        {
            let st = self.state.lock().await;
            schedule_delete(
                &st.autoclean,
                self.messenger.clone(),
                warning,
                policy.autoclean,
            );
        }
        tracing::info!(
            chat_id = chat.0,
            user_id = target.0,
            by = q.from.id.0,
            hours,
            removed,
            "user muted"
        );
        self.answer(q, None, false).await;
    }

    async fn answer(&self, q: &CallbackQuery, text: Option<&str>, alert: bool) {
        if let Err(e) = self
            .messenger
            .answer_callback_query(&q.id, text, alert)
            .await
        {
            tracing::debug!(error = %e, "answer callback failed");
        }
    }

    // ---- pipeline stages ----

    async fn exemption(&self, chat: ChatId, msg: &InboundMessage) -> Option<Skip> {
        if msg.sender_chat == Some(chat) || msg.sender_id() == Some(ANONYMOUS_ADMIN) {
            return Some(Skip::AnonymousAdmin);
        }
        let user = msg.sender_id()?;
        if self.is_admin(chat, user).await {
            return Some(Skip::Admin);
        }
        match self.store.whitelist_user_contains(chat, user).await {
            Ok(true) => Some(Skip::WhitelistedUser),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(chat_id = chat.0, error = %e, "whitelist lookup failed");
                None
            }
        }
    }

    async fn is_admin(&self, chat: ChatId, user: UserId) -> bool {
        let now = Instant::now();
        if let Some(hit) = self.state.lock().await.admins.is_admin(chat, user, now) {
            return hit;
        }
        let admins = match self.messenger.chat_administrators(chat).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(chat_id = chat.0, error = %e, "admin list unavailable");
                Vec::new()
            }
        };
        let hit = admins.contains(&user);
        self.state.lock().await.admins.store(chat, admins, now);
        hit
    }

    fn bot_addressed_exempt(&self, text: &str, policy: &ChatPolicy) -> bool {
        let Some(username) = self.bot_username.as_deref() else {
            return false;
        };
        let cleaned = strip_mention(text, username);
        let short_ok = cleaned.chars().count() <= policy.reply_exempt_maxlen;
        is_request_intent(&cleaned) || (short_ok && !has_contact_like(&cleaned))
    }

    async fn domain_whitelisted(&self, chat: ChatId, text: &str) -> bool {
        let domains = extract_domains(text);
        if domains.is_empty() {
            return false;
        }
        match self.store.whitelist_domains_any(chat, &domains).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(chat_id = chat.0, error = %e, "domain whitelist lookup failed");
                false
            }
        }
    }

    async fn remove_forward(&self, msg: &InboundMessage, at: MessageRef, policy: &ChatPolicy) {
        match self.messenger.delete_message(at).await {
            Ok(()) => tracing::info!(chat_id = at.chat_id.0, message_id = at.message_id.0, "entity forward removed"),
            Err(e) => {
                tracing::warn!(chat_id = at.chat_id.0, error = %e, "forward delete failed; posting notice");
                match self
                    .messenger
                    .reply_html(msg.msg_ref(), &notices::forward_not_allowed(), None)
                    .await
                {
                    Ok(w) => {
                        let st = self.state.lock().await;
                        schedule_delete(&st.autoclean, self.messenger.clone(), w, policy.autoclean);
                    }
                    Err(e) => tracing::debug!(error = %e, "forward notice failed"),
                }
            }
        }
    }

    async fn open_pending(
        self: &Arc<Self>,
        msg: &InboundMessage,
        subject: &Subject<'_>,
        policy: &ChatPolicy,
        minimum: usize,
    ) -> WatchOutcome {
        let key = subject.at;
        let now = Instant::now();
        if let Some(album) = subject.album_id.as_ref() {
            let ak = album_key(key.chat_id, album);
            let mut st = self.state.lock().await;
            if !st.caption.join_album(&ak, key.message_id, now) {
                return WatchOutcome::CaptionPending;
            }
        }

        let grace = policy.grace_for(subject.entity_forward);
        let warning = match self
            .messenger
            .reply_html(key, &notices::nocap_warn(grace, minimum), Some(&guide_keyboard(key)))
            .await
        {
            Ok(w) => Some(w.message_id),
            Err(e) => {
                tracing::warn!(chat_id = key.chat_id.0, message_id = key.message_id.0, error = %e, "caption warning failed");
                None
            }
        };

        let entry = PendingEntry {
            submitter: msg.sender_id(),
            grace,
            created_at: now,
            is_forward: subject.entity_forward,
            album_id: subject.album_id.clone(),
            warning,
        };
        self.arm_pending(key, entry).await;
        tracing::info!(
            chat_id = key.chat_id.0,
            message_id = key.message_id.0,
            grace_secs = grace.as_secs(),
            "caption pending"
        );
        WatchOutcome::CaptionPending
    }

    async fn arm_pending(self: &Arc<Self>, key: MessageRef, entry: PendingEntry) {
        let grace = entry.grace;
        let mut st = self.state.lock().await;
        st.caption.open(key, entry, Instant::now());
        let guard = Arc::clone(self);
        st.caption.timers.schedule(key, grace, async move {
            guard.expire_pending(key).await;
        });
    }

    async fn expire_pending(&self, key: MessageRef) {
        let Some(expired) = self.state.lock().await.caption.expire(&key, Instant::now()) else {
            return;
        };
        let chat = key.chat_id;
        if expired.album_messages.is_empty() {
            if let Err(e) = self.messenger.delete_message(key).await {
                tracing::warn!(chat_id = chat.0, message_id = key.message_id.0, error = %e, "expired media delete failed");
            }
        } else {
            delete_many(self.messenger.as_ref(), chat, &expired.album_messages).await;
        }
        if let Some(w) = expired.entry.warning {
            if let Err(e) = self.messenger.delete_message(MessageRef::new(chat, w)).await {
                tracing::debug!(chat_id = chat.0, error = %e, "warning delete failed");
            }
        }
        tracing::info!(chat_id = chat.0, message_id = key.message_id.0, "caption grace expired");
    }

    async fn classify(
        &self,
        chat: ChatId,
        policy: &ChatPolicy,
        text: &str,
        is_reply: bool,
    ) -> (std::result::Result<Verdict, ClassifyError>, usize) {
        let shots = match examples::select_examples(
            self.store.as_ref(),
            chat,
            policy.examples_select,
            policy.max_fewshots,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(chat_id = chat.0, error = %e, "examples unavailable");
                Vec::new()
            }
        };
        let req = ClassifyRequest {
            chat_id: chat,
            chatflow_id: policy.chatflow_id.clone(),
            text: text.to_string(),
            examples: examples::render_examples(&shots),
            is_reply,
            has_contact: has_contact_like(text),
        };
        let verdict = match self.permits.acquire().await {
            Ok(_permit) => self.classifier.classify(&req).await,
            Err(e) => Err(ClassifyError::Transport(e.to_string())),
        };
        (verdict, shots.len())
    }

    async fn enforce(
        &self,
        msg: &InboundMessage,
        at: MessageRef,
        policy: &ChatPolicy,
        deferred: Option<DeferredWarning>,
    ) -> Enforcement {
        let chat = at.chat_id;
        if policy.action != PolicyAction::Delete {
            let user = msg.sender_id().unwrap_or(UserId(0));
            match self
                .ledger
                .gate(chat, user, Utc::now(), policy.max_carry)
                .await
            {
                Ok(SpendOutcome::Exhausted) => {
                    self.drop_deferred(chat, deferred).await;
                    self.quota_delete(at, policy).await;
                    return Enforcement::QuotaDeleted;
                }
                Ok(SpendOutcome::Spent { balance }) => {
                    tracing::debug!(chat_id = chat.0, user_id = user.0, balance, "ad token spent")
                }
                Err(e) => tracing::warn!(chat_id = chat.0, error = %e, "ledger unavailable; quota not applied"),
            }
        }

        match policy.action {
            PolicyAction::None => {
                if let Some(d) = deferred {
                    self.close_deferred(chat, d, policy).await;
                }
                Enforcement::Tolerated
            }
            PolicyAction::Warn => {
                self.drop_deferred(chat, deferred).await;
                self.warn(msg, at, policy).await
            }
            PolicyAction::Delete => {
                self.drop_deferred(chat, deferred).await;
                match self.messenger.delete_message(at).await {
                    Ok(()) => Enforcement::Deleted,
                    Err(e) => {
                        tracing::warn!(chat_id = chat.0, message_id = at.message_id.0, error = %e, "delete failed; warning instead");
                        self.warn(msg, at, policy).await
                    }
                }
            }
        }
    }

    async fn warn(&self, msg: &InboundMessage, at: MessageRef, policy: &ChatPolicy) -> Enforcement {
        let now = Instant::now();
        let recent = self
            .state
            .lock()
            .await
            .warns
            .recent(&at, policy.warn_edit_cooldown, now);
        if let Some(previous) = recent {
            if let Err(e) = edit_tolerant(
                self.messenger.as_ref(),
                MessageRef::new(at.chat_id, previous),
                &notices::still_ad(),
                None,
            )
            .await
            {
                tracing::debug!(chat_id = at.chat_id.0, error = %e, "warning edit failed");
            }
            return Enforcement::WarningEdited;
        }

        match self
            .messenger
            .reply_html(at, &notices::ad_detected(msg), None)
            .await
        {
            Ok(w) => {
                let mut st = self.state.lock().await;
                st.warns
                    .record(at, w.message_id, now, policy.warn_edit_cooldown);
                schedule_delete(&st.autoclean, self.messenger.clone(), w, policy.autoclean);
                Enforcement::Warned
            }
            Err(e) => {
                tracing::warn!(chat_id = at.chat_id.0, error = %e, "ad warning failed");
                Enforcement::WarnFailed
            }
        }
    }

    async fn quota_delete(&self, at: MessageRef, policy: &ChatPolicy) {
        if let Err(e) = self.messenger.delete_message(at).await {
            tracing::warn!(chat_id = at.chat_id.0, message_id = at.message_id.0, error = %e, "quota delete failed");
        }
        match self
            .messenger
            .send_html(at.chat_id, &notices::quota_exhausted(), None)
            .await
        {
            Ok(n) => {
                let st = self.state.lock().await;
                schedule_delete(&st.autoclean, self.messenger.clone(), n, policy.autoclean);
            }
            Err(e) => tracing::debug!(chat_id = at.chat_id.0, error = %e, "quota notice failed"),
        }
        tracing::info!(chat_id = at.chat_id.0, message_id = at.message_id.0, "weekly quota exhausted");
    }

    /// Close a deferred caption warning after a clean verdict.
    async fn close_deferred(&self, chat: ChatId, d: DeferredWarning, policy: &ChatPolicy) {
        let warning = MessageRef::new(chat, d.warning);
        match policy.warn_success_action {
            SuccessAction::Delete => {
                if let Err(e) = self.messenger.delete_message(warning).await {
                    tracing::debug!(chat_id = chat.0, error = %e, "warning delete failed");
                }
                self.state
                    .lock()
                    .await
                    .caption
                    .drop_mute_targets(&warning, Instant::now());
            }
            SuccessAction::Edit => {
                let hours = policy.effective_mute_hours();
                let mut buttons = vec![InlineButton::new(
                    notices::info_button(),
                    ButtonAction::Info.encode(),
                )];
                if let Some(user) = d.submitter {
                    buttons.push(InlineButton::new(
                        notices::mute_button(hours),
                        ButtonAction::Mute(user).encode(),
                    ));
                }
                if let Err(e) = edit_tolerant(
                    self.messenger.as_ref(),
                    warning,
                    &notices::caption_received(),
                    Some(&keyboard(buttons)),
                )
                .await
                {
                    tracing::debug!(chat_id = chat.0, error = %e, "warning close edit failed");
                }
                let st = self.state.lock().await;
                schedule_delete(
                    &st.autoclean,
                    self.messenger.clone(),
                    warning,
                    policy.warn_success_autodel,
                );
            }
        }
    }

    async fn drop_deferred(&self, chat: ChatId, deferred: Option<DeferredWarning>) {
        let Some(d) = deferred else {
            return;
        };
        let warning = MessageRef::new(chat, d.warning);
        if let Err(e) = self.messenger.delete_message(warning).await {
            tracing::debug!(chat_id = chat.0, error = %e, "warning delete failed");
        }
        self.state
            .lock()
            .await
            .caption
            .drop_mute_targets(&warning, Instant::now());
    }

    // ---- admin surface ----

    pub async fn policy(&self, chat: ChatId) -> ChatPolicy {
        self.settings.policy(chat).await
    }

    pub async fn set_chat_setting(&self, chat: ChatId, key: PolicyKey, value: &str) -> Result<()> {
        self.settings.set_chat(chat, key, value).await?;
        tracing::info!(chat_id = chat.0, key = key.key(), value, "chat setting updated");
        Ok(())
    }

    pub async fn set_global_setting(&self, key: PolicyKey, value: &str) -> Result<()> {
        self.settings.set_global(key, value).await?;
        tracing::info!(key = key.key(), value, "global setting updated");
        Ok(())
    }

    pub async fn add_example(
        &self,
        chat: ChatId,
        text: &str,
        user: Option<UserId>,
        label: Label,
    ) -> Result<AddExampleOutcome> {
        let hardcap = self.settings.policy(chat).await.examples_hardcap;
        examples::add_example(self.store.as_ref(), chat, text, user, label, hardcap).await
    }

    pub async fn list_examples(&self, chat: ChatId, limit: usize) -> Result<Vec<ExamplePreview>> {
        examples::list_examples(self.store.as_ref(), chat, limit).await
    }

    pub async fn clear_examples(&self, chat: ChatId) -> Result<u64> {
        let n = self.store.clear_examples(chat).await?;
        tracing::info!(chat_id = chat.0, removed = n, "examples cleared");
        Ok(n)
    }

    pub async fn example_stats(&self, chat: ChatId) -> Result<ExampleStats> {
        examples::example_stats(self.store.as_ref(), chat).await
    }

    pub async fn whitelist_user_add(&self, chat: ChatId, user: UserId, by: Option<UserId>) -> Result<bool> {
        self.store.whitelist_user_add(chat, user, by).await
    }

    pub async fn whitelist_user_remove(&self, chat: ChatId, user: UserId) -> Result<bool> {
        self.store.whitelist_user_remove(chat, user).await
    }

    pub async fn whitelist_users(&self, chat: ChatId, limit: usize) -> Result<Vec<WhitelistEntry<UserId>>> {
        self.store.whitelist_users(chat, limit).await
    }

    /// Accepts a bare domain or a URL; stores the normalized host.
    pub async fn whitelist_domain_add(&self, chat: ChatId, raw: &str, by: Option<UserId>) -> Result<bool> {
        let domain = domain_arg(raw)?;
        self.store.whitelist_domain_add(chat, &domain, by).await
    }

    pub async fn whitelist_domain_remove(&self, chat: ChatId, raw: &str) -> Result<bool> {
        let domain = domain_arg(raw)?;
        self.store.whitelist_domain_remove(chat, &domain).await
    }

    pub async fn whitelist_domains(&self, chat: ChatId, limit: usize) -> Result<Vec<WhitelistEntry<String>>> {
        self.store.whitelist_domains(chat, limit).await
    }

    pub async fn decision_stats(&self, chat: ChatId, window: StatsWindow) -> Result<DecisionStats> {
        let rows = self
            .store
            .decisions_since(chat, window.since(Utc::now()))
            .await?;
        Ok(summarize(&rows))
    }

    pub async fn simulate(&self, chat: ChatId, threshold: f64, window: StatsWindow) -> Result<Simulation> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!("threshold must be within 0..1, got {threshold}")));
        }
        let rows = self
            .store
            .decisions_since(chat, window.since(Utc::now()))
            .await?;
        Ok(simulate(&rows, threshold))
    }

    /// Classify `text` with the chat's examples and threshold. Nothing is
    /// persisted and no action is taken.
    pub async fn probe(&self, chat: ChatId, text: &str) -> Probe {
        let policy = self.settings.policy(chat).await;
        let (verdict, examples_used) = self.classify(chat, &policy, text.trim(), false).await;
        let decision = decide(&verdict, policy.threshold);
        Probe {
            verdict,
            decision,
            examples_used,
        }
    }

    pub async fn balance(&self, chat: ChatId, user: UserId) -> Result<i64> {
        let max_carry = self.settings.policy(chat).await.max_carry;
        self.ledger.balance(chat, user, Utc::now(), max_carry).await
    }

    /// Weekly grant for every known wallet. Returns how many were funded.
    pub async fn run_weekly_grants(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let mut granted = 0;
        for (tenant, user) in self.ledger.wallets().await? {
            let max_carry = self.settings.policy(tenant).await.max_carry;
            match self.ledger.grant_if_needed(tenant, user, now, max_carry).await {
                Ok(GrantOutcome::Granted { .. }) => granted += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(tenant = tenant.0, user = user.0, error = %e, "weekly grant failed"),
            }
        }
        tracing::info!(granted, "weekly grant run finished");
        Ok(granted)
    }
}

fn guide_keyboard(media: MessageRef) -> InlineKeyboard {
    InlineKeyboard::single(InlineButton::new(
        notices::guide_button(),
        ButtonAction::Guide(media.message_id).encode(),
    ))
}

/// A short reply to a request-like parent, or a contact-bearing reply within
/// the contact limit when that is allowed.
fn reply_exempt(parent: Option<&InboundMessage>, text: &str, policy: &ChatPolicy) -> bool {
    let Some(parent) = parent else {
        return false;
    };
    let parent_text = parent.content();
    if parent_text.is_empty() || !is_request_intent(parent_text) {
        return false;
    }
    let len = text.chars().count();
    let short_ok = len <= policy.reply_exempt_maxlen;
    let contact_ok = policy.reply_exempt_allow_contact
        && has_contact_like(text)
        && len <= policy.reply_exempt_contact_maxlen;
    short_ok || contact_ok
}

fn domain_arg(raw: &str) -> Result<String> {
    let domain = extract_domains(raw)
        .into_iter()
        .next()
        .unwrap_or_else(|| normalize_domain(raw));
    if domain.is_empty() || !domain.contains('.') {
        return Err(Error::Config(format!("not a domain: {raw:?}")));
    }
    Ok(domain)
}
