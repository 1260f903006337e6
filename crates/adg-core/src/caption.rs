//! Pending-caption bookkeeping.
//!
//! A media message without a sufficient caption is PENDING until it gets one
//! (RESOLVED), its grace timer fires (EXPIRED), or, after resolving, it is
//! edited back to an insufficient caption (REOPENED, a fresh PENDING entry).
//! This module only holds state; the guard performs the I/O around it.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::{
    dedup::{TtlCache, TtlMap},
    domain::{AlbumId, AlbumKey, ChatId, MessageId, MessageRef, UserId},
    messaging::types::InboundMessage,
    tasks::DelayedTasks,
};

const ALBUM_CAPTION_TTL: Duration = Duration::from_secs(48 * 3600);
const MUTE_TARGET_TTL: Duration = Duration::from_secs(30 * 60);
const MAP_SWEEP_THRESHOLD: usize = 5000;
const ALBUM_SWEEP_THRESHOLD: usize = 2000;

#[derive(Clone, Debug, PartialEq)]
pub struct PendingEntry {
    pub submitter: Option<UserId>,
    pub grace: Duration,
    pub created_at: Instant,
    pub is_forward: bool,
    pub album_id: Option<AlbumId>,
    pub warning: Option<MessageId>,
}

/// A caption warning whose closing waits for the classification result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredWarning {
    pub warning: MessageId,
    pub submitter: Option<UserId>,
}

/// What a mute button on a closed warning removes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MuteTargets {
    pub media: Vec<MessageId>,
    pub reply: Option<MessageId>,
}

impl MuteTargets {
    pub fn all(&self) -> Vec<MessageId> {
        self.media.iter().copied().chain(self.reply).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub entry: PendingEntry,
    pub deferred: Option<DeferredWarning>,
}

/// An entry removed because its grace period ran out.
#[derive(Clone, Debug, PartialEq)]
pub struct Expired {
    pub entry: PendingEntry,
    /// Album members to bulk-delete. Empty for single messages.
    pub album_messages: Vec<MessageId>,
}

pub struct CaptionBook {
    entries: HashMap<MessageRef, PendingEntry>,
    by_warning: HashMap<MessageRef, MessageRef>,
    by_album: HashMap<AlbumKey, MessageRef>,
    album_messages: HashMap<AlbumKey, Vec<MessageId>>,
    album_warned: TtlCache<AlbumKey>,
    album_captions: TtlMap<AlbumKey, String>,
    short_warn_at: HashMap<MessageRef, Instant>,
    reoffend_at: HashMap<MessageRef, Instant>,
    mute_targets: TtlMap<MessageRef, MuteTargets>,
    pub timers: DelayedTasks<MessageRef>,
}

impl CaptionBook {
    pub fn new(dedup_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_warning: HashMap::new(),
            by_album: HashMap::new(),
            album_messages: HashMap::new(),
            album_warned: TtlCache::new(dedup_ttl, ALBUM_SWEEP_THRESHOLD),
            album_captions: TtlMap::new(ALBUM_CAPTION_TTL, MAP_SWEEP_THRESHOLD),
            short_warn_at: HashMap::new(),
            reoffend_at: HashMap::new(),
            mute_targets: TtlMap::new(MUTE_TARGET_TTL, MAP_SWEEP_THRESHOLD),
            timers: DelayedTasks::new(),
        }
    }

    pub fn is_pending(&self, key: &MessageRef) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &MessageRef) -> Option<&PendingEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---- albums ----

    /// Register an album item. The first item of an album claims the single
    /// caption warning and returns `true`; later items join the claimed
    /// album. Items of an album with no live claim (already resolved or
    /// expired) are not tracked.
    pub fn join_album(&mut self, album: &AlbumKey, id: MessageId, now: Instant) -> bool {
        if self.album_warned.check_and_mark(album.clone(), now) {
            self.album_messages.insert(album.clone(), vec![id]);
            return true;
        }
        if let Some(ids) = self.album_messages.get_mut(album) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        false
    }

    pub fn cache_album_caption(&mut self, album: AlbumKey, caption: &str, now: Instant) {
        self.album_captions.insert(album, caption.to_string(), now);
    }

    pub fn album_caption(&self, album: &AlbumKey, now: Instant) -> Option<&str> {
        self.album_captions.get(album, now).map(String::as_str)
    }

    // ---- lifecycle ----

    /// Enter PENDING for `key`. Replaces any previous entry for the same key.
    pub fn open(&mut self, key: MessageRef, entry: PendingEntry, now: Instant) {
        if let Some(old) = self.entries.remove(&key) {
            self.unindex(&key, &old);
        }
        if let Some(w) = entry.warning {
            self.by_warning
                .insert(MessageRef::new(key.chat_id, w), key);
        }
        if let Some(album) = &entry.album_id {
            let ak = album_key(key.chat_id, album);
            self.by_album.insert(ak.clone(), key);
            self.album_warned.mark(ak, now);
        }
        self.entries.insert(key, entry);
    }

    /// The pending entry a reply refers to: through its warning message, the
    /// media message itself, or another member of the same album.
    pub fn find_for_reply(&self, parent: &InboundMessage) -> Option<MessageRef> {
        let parent_ref = parent.msg_ref();
        if let Some(key) = self.by_warning.get(&parent_ref) {
            if self.entries.contains_key(key) {
                return Some(*key);
            }
        }
        if self.entries.contains_key(&parent_ref) {
            return Some(parent_ref);
        }
        let album = parent.album_id.as_ref()?;
        let key = self.by_album.get(&album_key(parent.chat_id, album))?;
        self.entries.contains_key(key).then_some(*key)
    }

    /// PENDING → RESOLVED. Cancels the timer and records the mute targets of
    /// the warning: album members, plus the resolving reply when there is
    /// one. The warning is handed back so the caller can close it once the
    /// verdict is known.
    pub fn resolve(
        &mut self,
        key: &MessageRef,
        reply: Option<MessageId>,
        now: Instant,
    ) -> Option<Resolved> {
        self.timers.cancel(key);
        let entry = self.entries.remove(key)?;
        self.unindex(key, &entry);
        self.short_warn_at.remove(key);

        let album_ids = entry
            .album_id
            .as_ref()
            .and_then(|a| self.album_messages.remove(&album_key(key.chat_id, a)))
            .unwrap_or_default();

        let deferred = entry.warning.map(|warning| DeferredWarning {
            warning,
            submitter: entry.submitter,
        });
        if let Some(d) = deferred {
            let media = if album_ids.is_empty() && reply.is_some() {
                vec![key.message_id]
            } else {
                album_ids
            };
            if !media.is_empty() {
                self.mute_targets.insert(
                    MessageRef::new(key.chat_id, d.warning),
                    MuteTargets { media, reply },
                    now,
                );
            }
        }
        Some(Resolved { entry, deferred })
    }

    /// PENDING → EXPIRED. `None` when the entry was resolved meanwhile, or
    /// re-opened with a grace period that has not run out yet.
    pub fn expire(&mut self, key: &MessageRef, now: Instant) -> Option<Expired> {
        let due = self.entries.get(key)?;
        if now < due.created_at + due.grace {
            return None;
        }
        let entry = self.entries.remove(key)?;
        self.unindex(key, &entry);
        let album_messages = entry
            .album_id
            .as_ref()
            .and_then(|a| self.album_messages.remove(&album_key(key.chat_id, a)))
            .unwrap_or_default();
        self.short_warn_at.remove(key);
        Some(Expired {
            entry,
            album_messages,
        })
    }

    fn unindex(&mut self, key: &MessageRef, entry: &PendingEntry) {
        if let Some(w) = entry.warning {
            self.by_warning.remove(&MessageRef::new(key.chat_id, w));
        }
        if let Some(album) = &entry.album_id {
            let ak = album_key(key.chat_id, album);
            if self.by_album.get(&ak) == Some(key) {
                self.by_album.remove(&ak);
            }
        }
    }

    // ---- mute targets ----

    pub fn take_mute_targets(&mut self, warning: &MessageRef, now: Instant) -> Option<MuteTargets> {
        let out = self.mute_targets.remove(warning, now);
        self.mute_targets.sweep(now);
        out
    }

    pub fn drop_mute_targets(&mut self, warning: &MessageRef, now: Instant) {
        self.mute_targets.remove(warning, now);
    }

    // ---- cooldowns ----

    /// Short "still too short" edits of a pending warning.
    pub fn short_warn_allowed(&mut self, key: MessageRef, cooldown: Duration, now: Instant) -> bool {
        cooldown_gate(&mut self.short_warn_at, key, cooldown, now)
    }

    /// Re-opening a resolved message.
    pub fn reoffend_allowed(&mut self, key: MessageRef, cooldown: Duration, now: Instant) -> bool {
        cooldown_gate(&mut self.reoffend_at, key, cooldown, now)
    }
}

fn cooldown_gate(
    map: &mut HashMap<MessageRef, Instant>,
    key: MessageRef,
    cooldown: Duration,
    now: Instant,
) -> bool {
    if let Some(last) = map.get(&key) {
        if now.saturating_duration_since(*last) < cooldown {
            return false;
        }
    }
    map.insert(key, now);
    if map.len() > MAP_SWEEP_THRESHOLD {
        map.retain(|_, at| now.saturating_duration_since(*at) < cooldown);
    }
    true
}

pub fn album_key(chat_id: ChatId, album: &AlbumId) -> AlbumKey {
    AlbumKey {
        chat_id,
        album_id: album.clone(),
    }
}
