//! In-memory fakes of the ports, shared by unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    classify::{Classifier, ClassifyError, ClassifyRequest, Verdict},
    domain::{ChatId, Label, MessageId, MessageRef, UserId},
    ledger::{GrantOutcome, LedgerStore, SpendOutcome},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, ChatMemberInfo, InlineKeyboard, MessagingCapabilities},
    },
    settings::SettingsStore,
    store::{DecisionRecord, Example, ModerationStore, NewDecision, WhitelistEntry},
    Error, Result,
};

// ---- store ----

#[derive(Default)]
struct StoreData {
    fail_settings: bool,
    global: HashMap<String, String>,
    chat: HashMap<(ChatId, String), String>,
    next_id: i64,
    examples: Vec<Example>,
    decisions: Vec<(NewDecision, DateTime<Utc>)>,
    users: Vec<(ChatId, WhitelistEntry<UserId>)>,
    domains: Vec<(ChatId, WhitelistEntry<String>)>,
    balances: HashMap<(ChatId, UserId), i64>,
    weeks: HashSet<(ChatId, UserId, NaiveDate)>,
    ledger: Vec<(ChatId, UserId, &'static str, i64)>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn fail_settings(&self, fail: bool) {
        self.data.lock().unwrap().fail_settings = fail;
    }

    pub fn set_balance(&self, tenant: ChatId, user: UserId, balance: i64) {
        self.data
            .lock()
            .unwrap()
            .balances
            .insert((tenant, user), balance);
    }

    pub fn has_week_marker(&self, tenant: ChatId, user: UserId, week: NaiveDate) -> bool {
        self.data.lock().unwrap().weeks.contains(&(tenant, user, week))
    }

    pub fn spend_rows(&self, tenant: ChatId, user: UserId) -> usize {
        self.data
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|(t, u, kind, _)| *t == tenant && *u == user && *kind == "spend_ad")
            .count()
    }

    pub fn decisions(&self) -> Vec<NewDecision> {
        self.data
            .lock()
            .unwrap()
            .decisions
            .iter()
            .map(|(d, _)| d.clone())
            .collect()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn global_settings(&self) -> Result<HashMap<String, String>> {
        let data = self.data.lock().unwrap();
        if data.fail_settings {
            return Err(Error::Store("settings offline".into()));
        }
        Ok(data.global.clone())
    }

    async fn chat_settings(&self, chat_id: ChatId) -> Result<HashMap<String, String>> {
        let data = self.data.lock().unwrap();
        if data.fail_settings {
            return Err(Error::Store("settings offline".into()));
        }
        Ok(data
            .chat
            .iter()
            .filter(|((c, _), _)| *c == chat_id)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_global_setting(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .global
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_chat_setting(&self, chat_id: ChatId, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .chat
            .insert((chat_id, key.to_string()), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl ModerationStore for MemoryStore {
    async fn count_examples(&self, chat_id: ChatId) -> Result<i64> {
        let data = self.data.lock().unwrap();
        Ok(data.examples.iter().filter(|e| e.chat_id == chat_id).count() as i64)
    }

    async fn insert_example(
        &self,
        chat_id: ChatId,
        text: &str,
        user_id: Option<UserId>,
        label: Label,
    ) -> Result<i64> {
        let mut data = self.data.lock().unwrap();
        data.next_id += 1;
        let id = data.next_id;
        data.examples.push(Example {
            id,
            chat_id,
            text: text.to_string(),
            label,
            user_id,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn recent_examples(
        &self,
        chat_id: ChatId,
        label: Option<Label>,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<Example>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .examples
            .iter()
            .rev()
            .filter(|e| e.chat_id == chat_id)
            .filter(|e| label.map_or(true, |l| e.label == l))
            .filter(|e| !exclude.contains(&e.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear_examples(&self, chat_id: ChatId) -> Result<u64> {
        let mut data = self.data.lock().unwrap();
        let before = data.examples.len();
        data.examples.retain(|e| e.chat_id != chat_id);
        Ok((before - data.examples.len()) as u64)
    }

    async fn example_label_counts(&self, chat_id: ChatId) -> Result<Vec<(Label, i64)>> {
        let data = self.data.lock().unwrap();
        let mut counts: HashMap<Label, i64> = HashMap::new();
        for e in data.examples.iter().filter(|e| e.chat_id == chat_id) {
            *counts.entry(e.label).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn save_decision(&self, decision: &NewDecision) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .decisions
            .push((decision.clone(), Utc::now()));
        Ok(())
    }

    async fn decisions_since(
        &self,
        chat_id: ChatId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DecisionRecord>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .decisions
            .iter()
            .filter(|(d, at)| d.chat_id == chat_id && since.map_or(true, |s| *at >= s))
            .map(|(d, _)| DecisionRecord {
                label: d.label,
                is_ad: d.is_ad,
                score: d.score,
            })
            .collect())
    }

    async fn whitelist_user_add(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        added_by: Option<UserId>,
    ) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        if data
            .users
            .iter()
            .any(|(c, e)| *c == chat_id && e.identity == user_id)
        {
            return Ok(false);
        }
        data.users.push((
            chat_id,
            WhitelistEntry {
                identity: user_id,
                added_by,
                added_at: Utc::now(),
            },
        ));
        Ok(true)
    }

    async fn whitelist_user_remove(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let before = data.users.len();
        data.users
            .retain(|(c, e)| !(*c == chat_id && e.identity == user_id));
        Ok(data.users.len() != before)
    }

    async fn whitelist_user_contains(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let data = self.data.lock().unwrap();
        Ok(data
            .users
            .iter()
            .any(|(c, e)| *c == chat_id && e.identity == user_id))
    }

    async fn whitelist_users(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<WhitelistEntry<UserId>>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .users
            .iter()
            .rev()
            .filter(|(c, _)| *c == chat_id)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn whitelist_domain_add(
        &self,
        chat_id: ChatId,
        domain: &str,
        added_by: Option<UserId>,
    ) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        if data
            .domains
            .iter()
            .any(|(c, e)| *c == chat_id && e.identity == domain)
        {
            return Ok(false);
        }
        data.domains.push((
            chat_id,
            WhitelistEntry {
                identity: domain.to_string(),
                added_by,
                added_at: Utc::now(),
            },
        ));
        Ok(true)
    }

    async fn whitelist_domain_remove(&self, chat_id: ChatId, domain: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let before = data.domains.len();
        data.domains
            .retain(|(c, e)| !(*c == chat_id && e.identity == domain));
        Ok(data.domains.len() != before)
    }

    async fn whitelist_domains_any(&self, chat_id: ChatId, domains: &[String]) -> Result<bool> {
        let data = self.data.lock().unwrap();
        Ok(data
            .domains
            .iter()
            .any(|(c, e)| *c == chat_id && domains.contains(&e.identity)))
    }

    async fn whitelist_domains(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<WhitelistEntry<String>>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .domains
            .iter()
            .rev()
            .filter(|(c, _)| *c == chat_id)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn grant_weekly(
        &self,
        tenant: ChatId,
        user: UserId,
        week_start: NaiveDate,
        amount: i64,
        max_carry: i64,
    ) -> Result<GrantOutcome> {
        let mut data = self.data.lock().unwrap();
        let balance = *data.balances.entry((tenant, user)).or_insert(0);
        if !data.weeks.insert((tenant, user, week_start)) {
            return Ok(GrantOutcome::AlreadyGranted { balance });
        }
        if balance >= max_carry {
            return Ok(GrantOutcome::CarryCapped { balance });
        }
        let new_balance = (balance + amount).min(max_carry);
        data.balances.insert((tenant, user), new_balance);
        data.ledger
            .push((tenant, user, "grant", new_balance - balance));
        Ok(GrantOutcome::Granted {
            balance: new_balance,
        })
    }

    async fn spend(
        &self,
        tenant: ChatId,
        user: UserId,
        amount: i64,
        _note: &str,
    ) -> Result<SpendOutcome> {
        let mut data = self.data.lock().unwrap();
        let balance = *data.balances.entry((tenant, user)).or_insert(0);
        if balance < amount {
            return Ok(SpendOutcome::Exhausted);
        }
        data.balances.insert((tenant, user), balance - amount);
        data.ledger.push((tenant, user, "spend_ad", amount));
        Ok(SpendOutcome::Spent {
            balance: balance - amount,
        })
    }

    async fn balance(&self, tenant: ChatId, user: UserId) -> Result<i64> {
        let data = self.data.lock().unwrap();
        Ok(data.balances.get(&(tenant, user)).copied().unwrap_or(0))
    }

    async fn wallets(&self) -> Result<Vec<(ChatId, UserId)>> {
        let data = self.data.lock().unwrap();
        let mut keys: Vec<_> = data.balances.keys().copied().collect();
        keys.sort_by_key(|(c, u)| (c.0, u.0));
        Ok(keys)
    }
}

// ---- messenger ----

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Send(ChatId, String),
    Reply(MessageRef, String),
    Edit(MessageRef, String, Option<InlineKeyboard>),
    Delete(MessageRef),
    DeleteMany(ChatId, Vec<MessageId>),
    Action(ChatId),
    Answer(String, Option<String>, bool),
    Restrict(ChatId, UserId, DateTime<Utc>),
}

#[derive(Default)]
struct MessengerData {
    calls: Vec<Call>,
    next_id: i32,
    fail_bulk_delete: bool,
    failing_deletes: HashSet<MessageRef>,
    not_modified: bool,
    fail_restrict: bool,
    admins: Vec<UserId>,
    members: HashMap<UserId, ChatMemberInfo>,
}

/// Records every call; sent messages get ids from 1000 upwards.
#[derive(Default)]
pub struct FakeMessenger {
    data: Mutex<MessengerData>,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.data.lock().unwrap().calls.clone()
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(chat, html) => Some((chat, html)),
                Call::Reply(target, html) => Some((target.chat_id, html)),
                _ => None,
            })
            .collect()
    }

    pub fn replies(&self) -> Vec<(MessageRef, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Reply(target, html) => Some((target, html)),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String, Option<InlineKeyboard>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit(msg, html, kb) => Some((msg, html, kb)),
                _ => None,
            })
            .collect()
    }

    /// Ids removed successfully, single or bulk, in call order.
    pub fn deleted(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .flat_map(|c| match c {
                Call::Delete(msg) => vec![msg.message_id],
                Call::DeleteMany(_, ids) => ids,
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<(Option<String>, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Answer(_, text, alert) => Some((text, alert)),
                _ => None,
            })
            .collect()
    }

    pub fn restricts(&self) -> Vec<(UserId, DateTime<Utc>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Restrict(_, user, until) => Some((user, until)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.data.lock().unwrap().calls.clear();
    }

    pub fn fail_bulk_delete(&self, fail: bool) {
        self.data.lock().unwrap().fail_bulk_delete = fail;
    }

    pub fn fail_delete(&self, msg: MessageRef) {
        self.data.lock().unwrap().failing_deletes.insert(msg);
    }

    pub fn edits_not_modified(&self, on: bool) {
        self.data.lock().unwrap().not_modified = on;
    }

    pub fn fail_restrict(&self, fail: bool) {
        self.data.lock().unwrap().fail_restrict = fail;
    }

    pub fn set_admins(&self, admins: &[UserId]) {
        self.data.lock().unwrap().admins = admins.to_vec();
    }

    pub fn set_member(&self, user_id: UserId, first_name: &str, privileged: bool) {
        self.data.lock().unwrap().members.insert(
            user_id,
            ChatMemberInfo {
                user_id,
                first_name: first_name.to_string(),
                privileged,
            },
        );
    }

    fn next_ref(data: &mut MessengerData, chat_id: ChatId) -> MessageRef {
        data.next_id += 1;
        MessageRef::new(chat_id, MessageId(999 + data.next_id))
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_bulk_delete: true,
        }
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        _keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(Call::Send(chat_id, html.to_string()));
        Ok(Self::next_ref(&mut data, chat_id))
    }

    async fn reply_html(
        &self,
        target: MessageRef,
        html: &str,
        _keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(Call::Reply(target, html.to_string()));
        Ok(Self::next_ref(&mut data, target.chat_id))
    }

    async fn edit_html(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.not_modified {
            return Err(Error::NotModified);
        }
        data.calls
            .push(Call::Edit(msg, html.to_string(), keyboard.cloned()));
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.failing_deletes.contains(&msg) {
            return Err(Error::Messaging("message can't be deleted".into()));
        }
        data.calls.push(Call::Delete(msg));
        Ok(())
    }

    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.fail_bulk_delete {
            return Err(Error::Messaging("bulk delete refused".into()));
        }
        data.calls.push(Call::DeleteMany(chat_id, ids.to_vec()));
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, _action: ChatAction) -> Result<()> {
        self.data.lock().unwrap().calls.push(Call::Action(chat_id));
        Ok(())
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        self.data.lock().unwrap().calls.push(Call::Answer(
            callback_id.to_string(),
            text.map(str::to_string),
            show_alert,
        ));
        Ok(())
    }

    async fn restrict_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.fail_restrict {
            return Err(Error::Messaging("not enough rights".into()));
        }
        data.calls.push(Call::Restrict(chat_id, user_id, until));
        Ok(())
    }

    async fn chat_administrators(&self, _chat_id: ChatId) -> Result<Vec<UserId>> {
        Ok(self.data.lock().unwrap().admins.clone())
    }

    async fn chat_member(&self, _chat_id: ChatId, user_id: UserId) -> Result<ChatMemberInfo> {
        self.data
            .lock()
            .unwrap()
            .members
            .get(&user_id)
            .cloned()
            .ok_or_else(|| Error::Messaging("member not found".into()))
    }
}

// ---- classifier ----

/// Replays queued verdicts in order; `NOT_AD` once the queue is empty.
#[derive(Default)]
pub struct ScriptedClassifier {
    queue: Mutex<VecDeque<std::result::Result<Verdict, ClassifyError>>>,
    requests: Mutex<Vec<ClassifyRequest>>,
}

impl ScriptedClassifier {
    pub fn push(&self, outcome: std::result::Result<Verdict, ClassifyError>) {
        self.queue.lock().unwrap().push_back(outcome);
    }

    pub fn push_label(&self, label: Label, score: f64) {
        self.push(Ok(Verdict {
            label: Some(label),
            score: Some(score),
            reason: None,
        }));
    }

    pub fn requests(&self) -> Vec<ClassifyRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, req: &ClassifyRequest) -> std::result::Result<Verdict, ClassifyError> {
        self.requests.lock().unwrap().push(req.clone());
        self.queue.lock().unwrap().pop_front().unwrap_or(Ok(Verdict {
            label: Some(Label::NotAd),
            score: Some(0.1),
            reason: None,
        }))
    }
}
