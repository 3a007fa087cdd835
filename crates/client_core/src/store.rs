//! Conversation reconciliation state machine.
//!
//! Pure and synchronous: the async shell in `lib.rs` owns one [`ChatStore`]
//! behind a mutex and drives it with REST results and push events. Every
//! invariant the engine guarantees lives here: no duplicate messages per
//! conversation, monotonic unread counters that are zero for the active
//! conversation, a single pending send per conversation key, and typing
//! signals scoped to the active conversation only.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{ConversationKey, GroupId, MessageId, UserId},
    protocol::{GroupSummary, MessageDraft, MessagePayload, PushEvent, UserSummary},
};
use tracing::{debug, warn};

pub const DEFAULT_TYPING_TIMEOUT_SECS: i64 = 6;

/// Outcome of a selection operation. `changed` is false when the requested
/// key was already active; callers must not re-fetch history in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub active: Option<ConversationKey>,
    pub changed: bool,
}

/// The single optimistic in-flight send for one conversation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub draft: MessageDraft,
    pub begun_at: DateTime<Utc>,
}

/// Generation-tagged handle for one history fetch. A ticket issued before a
/// newer activation no longer matches and its late result is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    key: ConversationKey,
    generation: u64,
}

impl HistoryTicket {
    pub fn key(&self) -> ConversationKey {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Loaded { count: usize },
    Failed,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub conversation: ConversationKey,
    pub actor: UserId,
    pub since: DateTime<Utc>,
}

/// What one push event did to the store, so the shell can decide which
/// follow-up work (broadcast, roster re-fetch) the event earns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    MessageAppended(ConversationKey),
    UnreadIncremented(ConversationKey),
    SendConfirmed(ConversationKey),
    Duplicate(MessageId),
    PresenceUpdated(UserId),
    TypingStarted(ConversationKey),
    TypingStopped(ConversationKey),
    DirectoryUpdated,
    RosterRefetchNeeded(GroupId),
    Dropped,
}

/// Sidebar filter knobs: online-only toggle and case-insensitive name search.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidebarFilter<'a> {
    pub online_only: bool,
    pub name_contains: Option<&'a str>,
}

pub struct ChatStore {
    self_id: Option<UserId>,
    active: Option<ConversationKey>,
    users: Vec<UserSummary>,
    groups: Vec<GroupSummary>,
    messages: HashMap<ConversationKey, Vec<MessagePayload>>,
    unread: HashMap<ConversationKey, u64>,
    pending: HashMap<ConversationKey, PendingSend>,
    online: HashSet<UserId>,
    last_seen: HashMap<UserId, DateTime<Utc>>,
    last_activity: HashMap<ConversationKey, DateTime<Utc>>,
    typing: Option<TypingIndicator>,
    typing_timeout: Duration,
    history_inflight: Option<HistoryTicket>,
    history_generation: u64,
    users_loading: bool,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TYPING_TIMEOUT_SECS))
    }
}

impl ChatStore {
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            self_id: None,
            active: None,
            users: Vec::new(),
            groups: Vec::new(),
            messages: HashMap::new(),
            unread: HashMap::new(),
            pending: HashMap::new(),
            online: HashSet::new(),
            last_seen: HashMap::new(),
            last_activity: HashMap::new(),
            typing: None,
            typing_timeout,
            history_inflight: None,
            history_generation: 0,
            users_loading: false,
        }
    }

    pub fn set_self(&mut self, user_id: UserId) {
        self.self_id = Some(user_id);
    }

    // ----- selection -----------------------------------------------------

    pub fn select_direct(&mut self, peer_id: UserId) -> Selection {
        self.select(ConversationKey::Direct(peer_id))
    }

    pub fn select_group(&mut self, group_id: GroupId) -> Selection {
        self.select(ConversationKey::Group(group_id))
    }

    fn select(&mut self, key: ConversationKey) -> Selection {
        if self.active == Some(key) {
            return Selection {
                active: self.active,
                changed: false,
            };
        }
        self.active = Some(key);
        self.typing = None;
        // Reset synchronously with activation so no stale badge is readable.
        self.unread.insert(key, 0);
        Selection {
            active: self.active,
            changed: true,
        }
    }

    pub fn clear_selection(&mut self) -> Selection {
        if self.active.is_none() {
            return Selection {
                active: None,
                changed: false,
            };
        }
        self.active = None;
        self.typing = None;
        Selection {
            active: None,
            changed: true,
        }
    }

    pub fn active_conversation(&self) -> Option<ConversationKey> {
        self.active
    }

    // ----- history loading ------------------------------------------------

    pub fn begin_history_load(&mut self, key: ConversationKey) -> HistoryTicket {
        self.history_generation += 1;
        let ticket = HistoryTicket {
            key,
            generation: self.history_generation,
        };
        self.history_inflight = Some(ticket);
        ticket
    }

    /// Replace the conversation's backlog with a fresh fetch. A ticket that
    /// was superseded by a newer activation is discarded without touching
    /// any state; the newer fetch still owns the loading flag.
    pub fn complete_history_load(
        &mut self,
        ticket: HistoryTicket,
        backlog: Vec<MessagePayload>,
    ) -> HistoryOutcome {
        if self.history_inflight != Some(ticket) {
            debug!(conversation = %ticket.key, "history: discarding stale response");
            return HistoryOutcome::Stale;
        }
        self.history_inflight = None;

        if let Some(last) = backlog.last() {
            self.touch_activity(ticket.key, last.sent_at);
        }
        let count = backlog.len();
        self.messages.insert(ticket.key, backlog);
        HistoryOutcome::Loaded { count }
    }

    /// Failure path: release the loading flag, keep the previous backlog.
    pub fn abort_history_load(&mut self, ticket: HistoryTicket) -> HistoryOutcome {
        if self.history_inflight != Some(ticket) {
            return HistoryOutcome::Stale;
        }
        self.history_inflight = None;
        warn!(conversation = %ticket.key, "history: fetch failed, keeping previous backlog");
        HistoryOutcome::Failed
    }

    pub fn is_history_loading(&self) -> bool {
        self.history_inflight.is_some()
    }

    pub fn begin_users_load(&mut self) {
        self.users_loading = true;
    }

    pub fn finish_users_load(&mut self) {
        self.users_loading = false;
    }

    pub fn is_users_loading(&self) -> bool {
        self.users_loading
    }

    // ----- event reconciliation -------------------------------------------

    /// Single entry point for push events and send confirmations.
    ///
    /// Never fails: malformed events are dropped with a diagnostic log and
    /// the store is left untouched.
    pub fn apply_event(&mut self, event: PushEvent, now: DateTime<Utc>) -> Applied {
        match event {
            PushEvent::NewMessage { message } => self.reconcile_message(message),
            PushEvent::PresenceChanged { user_id, online } => {
                if online {
                    self.online.insert(user_id);
                } else {
                    self.online.remove(&user_id);
                    self.last_seen.insert(user_id, now);
                    if let Some(user) = self.user_mut(user_id) {
                        user.last_seen = Some(now);
                    }
                }
                Applied::PresenceUpdated(user_id)
            }
            PushEvent::UserLastSeen { user_id, last_seen } => {
                self.last_seen.insert(user_id, last_seen);
                if let Some(user) = self.user_mut(user_id) {
                    user.last_seen = Some(last_seen);
                }
                Applied::PresenceUpdated(user_id)
            }
            PushEvent::UserTyping { sender_id } => {
                self.route_typing(ConversationKey::Direct(sender_id), sender_id, true, now)
            }
            PushEvent::UserStopTyping { sender_id } => {
                self.route_typing(ConversationKey::Direct(sender_id), sender_id, false, now)
            }
            PushEvent::GroupTyping {
                group_id,
                sender_id,
            } => self.route_typing(ConversationKey::Group(group_id), sender_id, true, now),
            PushEvent::GroupStopTyping {
                group_id,
                sender_id,
            } => self.route_typing(ConversationKey::Group(group_id), sender_id, false, now),
            PushEvent::GroupMembersAdded { group_id } => Applied::RosterRefetchNeeded(group_id),
            PushEvent::GroupCreated { group } => {
                self.upsert_group(group);
                Applied::DirectoryUpdated
            }
            PushEvent::UserJoined { user } => {
                self.upsert_user(user);
                Applied::DirectoryUpdated
            }
        }
    }

    fn reconcile_message(&mut self, message: MessagePayload) -> Applied {
        let Some(target) = self.classify(&message) else {
            warn!(
                message_id = message.message_id.0,
                "reconcile: dropping message event without sender or group identity"
            );
            return Applied::Dropped;
        };
        if !message.has_body() {
            warn!(
                message_id = message.message_id.0,
                conversation = %target,
                "reconcile: dropping message event without text or image body"
            );
            return Applied::Dropped;
        }

        // The transport may deliver the same event more than once, and a
        // send confirmation and its push echo race each other; identity by
        // message id makes both paths commute.
        if self
            .messages
            .get(&target)
            .is_some_and(|list| list.iter().any(|m| m.message_id == message.message_id))
        {
            debug!(
                message_id = message.message_id.0,
                conversation = %target,
                "reconcile: duplicate message suppressed"
            );
            return Applied::Duplicate(message.message_id);
        }

        self.touch_activity(target, message.sent_at);

        let from_self = message.sender_id.is_some() && message.sender_id == self.self_id;
        if from_self {
            // The echo is authoritative for the pending slot, wherever the
            // POST response is at this point.
            self.pending.remove(&target);
        }

        if self.active == Some(target) {
            self.pending.remove(&target);
            self.messages.entry(target).or_default().push(message);
            Applied::MessageAppended(target)
        } else if from_self {
            // Own echo for a background conversation confirms the send but
            // is not unread; the backlog is fetched lazily on activation.
            Applied::SendConfirmed(target)
        } else {
            let counter = self.unread.entry(target).or_insert(0);
            *counter = counter.saturating_add(1);
            Applied::UnreadIncremented(target)
        }
    }

    /// Route a message payload to its conversation key.
    ///
    /// Group identity wins when present. For direct messages the key is the
    /// peer: the sender for incoming traffic, the recipient for echoes of
    /// our own sends.
    fn classify(&self, message: &MessagePayload) -> Option<ConversationKey> {
        if let Some(group_id) = message.group_id {
            return Some(ConversationKey::Group(group_id));
        }
        let sender_id = message.sender_id?;
        if Some(sender_id) == self.self_id {
            message.recipient_id.map(ConversationKey::Direct)
        } else {
            Some(ConversationKey::Direct(sender_id))
        }
    }

    fn touch_activity(&mut self, key: ConversationKey, at: DateTime<Utc>) {
        self.last_activity.insert(key, at);
        match key {
            ConversationKey::Direct(peer_id) => {
                if let Some(user) = self.user_mut(peer_id) {
                    user.last_activity = Some(at);
                }
            }
            ConversationKey::Group(group_id) => {
                if let Some(group) = self.groups.iter_mut().find(|g| g.group_id == group_id) {
                    group.last_activity = Some(at);
                }
            }
        }
    }

    // ----- typing ---------------------------------------------------------

    fn route_typing(
        &mut self,
        conversation: ConversationKey,
        actor: UserId,
        started: bool,
        now: DateTime<Utc>,
    ) -> Applied {
        if self.active != Some(conversation) {
            // No buffering: signals for inactive conversations are transient.
            debug!(conversation = %conversation, "typing: discarding signal for inactive conversation");
            return Applied::Dropped;
        }
        if started {
            self.typing = Some(TypingIndicator {
                conversation,
                actor,
                since: now,
            });
            Applied::TypingStarted(conversation)
        } else if self.typing.as_ref().is_some_and(|t| t.actor == actor) {
            self.typing = None;
            Applied::TypingStopped(conversation)
        } else {
            Applied::Dropped
        }
    }

    /// Who is typing in the active conversation, if the indicator has not
    /// outlived its deadline. A lost stop-typing event cannot leave the
    /// indicator stuck.
    pub fn typing_actor(&self, now: DateTime<Utc>) -> Option<UserId> {
        let indicator = self.typing.as_ref()?;
        if now.signed_duration_since(indicator.since) > self.typing_timeout {
            return None;
        }
        Some(indicator.actor)
    }

    /// Clear the indicator if its deadline has passed; returns the affected
    /// conversation so the shell can notify subscribers.
    pub fn expire_typing(&mut self, now: DateTime<Utc>) -> Option<ConversationKey> {
        let indicator = self.typing.as_ref()?;
        if now.signed_duration_since(indicator.since) <= self.typing_timeout {
            return None;
        }
        let conversation = indicator.conversation;
        self.typing = None;
        Some(conversation)
    }

    // ----- pending sends --------------------------------------------------

    /// Record the optimistic send for `key`, replacing any prior slot: at
    /// most one in-flight optimistic message exists per conversation.
    pub fn begin_send(&mut self, key: ConversationKey, draft: MessageDraft, now: DateTime<Utc>) {
        self.pending.insert(
            key,
            PendingSend {
                draft,
                begun_at: now,
            },
        );
    }

    /// Key-based clear; returns true when a slot existed.
    pub fn confirm_send(&mut self, key: ConversationKey) -> bool {
        self.pending.remove(&key).is_some()
    }

    /// Clear the slot and hand the draft back so the caller can offer retry.
    pub fn fail_send(&mut self, key: ConversationKey) -> Option<MessageDraft> {
        self.pending.remove(&key).map(|pending| pending.draft)
    }

    pub fn pending_for(&self, key: ConversationKey) -> Option<&PendingSend> {
        self.pending.get(&key)
    }

    // ----- unread ---------------------------------------------------------

    pub fn unread_count(&self, key: ConversationKey) -> u64 {
        self.unread.get(&key).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u64 {
        self.unread.values().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    /// Bulk-load counters from the server (session bootstrap). The active
    /// conversation's zero is never overwritten.
    pub fn seed_unread_counts(&mut self, counts: HashMap<ConversationKey, u64>) {
        for (key, count) in counts {
            if self.active == Some(key) {
                continue;
            }
            self.unread.insert(key, count);
        }
    }

    // ----- directory and presence -----------------------------------------

    pub fn replace_users(&mut self, users: Vec<UserSummary>) {
        for user in &users {
            if let Some(last_seen) = user.last_seen {
                self.last_seen.entry(user.user_id).or_insert(last_seen);
            }
        }
        self.users = users;
    }

    pub fn replace_groups(&mut self, groups: Vec<GroupSummary>) {
        self.groups = groups;
    }

    pub fn upsert_user(&mut self, user: UserSummary) {
        match self.user_mut(user.user_id) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }

    pub fn upsert_group(&mut self, group: GroupSummary) {
        match self
            .groups
            .iter_mut()
            .find(|g| g.group_id == group.group_id)
        {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    fn user_mut(&mut self, user_id: UserId) -> Option<&mut UserSummary> {
        self.users.iter_mut().find(|u| u.user_id == user_id)
    }

    pub fn users(&self) -> &[UserSummary] {
        &self.users
    }

    pub fn groups(&self) -> &[GroupSummary] {
        &self.groups
    }

    pub fn group(&self, group_id: GroupId) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&user_id).copied()
    }

    pub fn messages_for(&self, key: ConversationKey) -> &[MessagePayload] {
        self.messages.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    // ----- sidebar projections --------------------------------------------

    /// Users for the sidebar: self excluded, optional online-only and name
    /// filters, online users first, then most recent activity.
    pub fn sidebar_users(&self, filter: SidebarFilter<'_>) -> Vec<&UserSummary> {
        let needle = filter.name_contains.map(|n| n.to_lowercase());
        let mut rows: Vec<&UserSummary> = self
            .users
            .iter()
            .filter(|u| Some(u.user_id) != self.self_id)
            .filter(|u| !filter.online_only || self.online.contains(&u.user_id))
            .filter(|u| match &needle {
                Some(needle) => u.display_name.to_lowercase().contains(needle),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            let a_online = self.online.contains(&a.user_id);
            let b_online = self.online.contains(&b.user_id);
            b_online
                .cmp(&a_online)
                .then_with(|| self.user_recency(b).cmp(&self.user_recency(a)))
        });
        rows
    }

    fn user_recency(&self, user: &UserSummary) -> Option<DateTime<Utc>> {
        self.last_activity
            .get(&ConversationKey::Direct(user.user_id))
            .copied()
            .or(user.last_activity)
            .or(user.last_seen)
    }

    pub fn sorted_groups(&self) -> Vec<&GroupSummary> {
        let mut rows: Vec<&GroupSummary> = self.groups.iter().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
