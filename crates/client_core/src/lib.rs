use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationKey, GroupId, UserId},
    error::ApiError,
    protocol::{GroupSummary, MessageDraft, MessagePayload, PushEvent, UserSummary},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

pub mod store;
pub use store::{
    Applied, ChatStore, HistoryOutcome, HistoryTicket, PendingSend, Selection, SidebarFilter,
    TypingIndicator, DEFAULT_TYPING_TIMEOUT_SECS,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_HISTORY_PAGE_LIMIT: u32 = 100;
const DEFAULT_MAX_GROUP_MEMBERS: usize = 10;
const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(DEFAULT_TYPING_TIMEOUT_SECS as u64);
/// Slack added to the typing-expiry timer so the deadline check in the store
/// has strictly passed when the timer fires.
const TYPING_EXPIRY_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub history_page_limit: u32,
    pub max_group_members: usize,
    pub typing_timeout: Duration,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
            max_group_members: DEFAULT_MAX_GROUP_MEMBERS,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

/// Fan-out events for front ends. Dropping the receiver is the unsubscribe.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Push(PushEvent),
    HistoryLoaded {
        key: ConversationKey,
        count: usize,
    },
    UnreadChanged {
        key: ConversationKey,
        count: u64,
    },
    TypingExpired {
        key: ConversationKey,
    },
    SendFailed {
        key: ConversationKey,
        draft: MessageDraft,
        reason: String,
    },
    Error(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message draft must contain text or an image")]
    EmptyDraft,
    #[error("message image is not valid base64")]
    InvalidImage,
    #[error("no conversation selected")]
    NoActiveConversation,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("failed to deliver message: {0}")]
    Transport(String),
}

/// Active-conversation projection for rendering layers.
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub active: Option<ConversationKey>,
    pub messages: Vec<MessagePayload>,
    pub pending: Option<MessageDraft>,
    pub typing_actor: Option<UserId>,
    pub unread_elsewhere: u64,
    pub history_loading: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SidebarQuery {
    pub online_only: bool,
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SidebarUserRow {
    pub user: UserSummary,
    pub online: bool,
    pub unread: u64,
}

#[derive(Debug, Clone)]
pub struct SidebarView {
    pub users: Vec<SidebarUserRow>,
    pub groups: Vec<GroupSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    user_id: UserId,
}

#[derive(Serialize)]
struct HistoryQuery {
    limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateGroupRequest {
    name: String,
    member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnreadCountEntry {
    conversation: ConversationKey,
    count: u64,
}

struct SessionState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    ws_started: bool,
}

/// Async shell around the [`ChatStore`] reconciler: drives REST calls, the
/// push-event stream, and event fan-out to subscribers.
pub struct ChatClient {
    http: Client,
    config: ChatClientConfig,
    session: Mutex<SessionState>,
    store: Mutex<ChatStore>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        Self::with_config(ChatClientConfig::default())
    }

    pub fn with_config(config: ChatClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let typing_timeout = chrono::Duration::from_std(config.typing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_TYPING_TIMEOUT_SECS));
        Arc::new(Self {
            http: Client::new(),
            config,
            session: Mutex::new(SessionState {
                server_url: None,
                user_id: None,
                ws_started: false,
            }),
            store: Mutex::new(ChatStore::new(typing_timeout)),
            events,
        })
    }

    pub async fn is_push_connected(&self) -> bool {
        self.session.lock().await.ws_started
    }

    async fn session(&self) -> Result<(String, UserId)> {
        let guard = self.session.lock().await;
        let server_url = guard
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("not logged in: missing server_url"))?;
        let user_id = guard
            .user_id
            .ok_or_else(|| anyhow!("not logged in: missing user_id"))?;
        Ok((server_url, user_id))
    }

    fn typing_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.typing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_TYPING_TIMEOUT_SECS))
    }

    async fn fetch_history(&self, key: ConversationKey) -> Result<Vec<MessagePayload>> {
        let (server_url, _user_id) = self.session().await?;
        let url = match key {
            ConversationKey::Direct(peer_id) => format!("{server_url}/messages/{}", peer_id.0),
            ConversationKey::Group(group_id) => {
                format!("{server_url}/groups/{}/messages", group_id.0)
            }
        };
        let response = self
            .http
            .get(url)
            .query(&HistoryQuery {
                limit: self.config.history_page_limit,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode_api_error(response).await);
        }
        let backlog: Vec<MessagePayload> = response
            .json()
            .await
            .with_context(|| format!("invalid history payload for {key}"))?;
        Ok(backlog)
    }

    /// Activate `key`: reset its unread counter, then load its backlog.
    /// Reselecting the already-active conversation performs no fetch.
    async fn activate(&self, key: ConversationKey) -> Result<()> {
        let ticket = {
            let mut store = self.store.lock().await;
            let selection = match key {
                ConversationKey::Direct(peer_id) => store.select_direct(peer_id),
                ConversationKey::Group(group_id) => store.select_group(group_id),
            };
            if !selection.changed {
                return Ok(());
            }
            store.begin_history_load(key)
        };

        match self.fetch_history(key).await {
            Ok(backlog) => {
                let outcome = {
                    let mut store = self.store.lock().await;
                    store.complete_history_load(ticket, backlog)
                };
                if let HistoryOutcome::Loaded { count } = outcome {
                    let _ = self.events.send(ClientEvent::HistoryLoaded { key, count });
                }
                Ok(())
            }
            Err(err) => {
                self.store.lock().await.abort_history_load(ticket);
                Err(err).with_context(|| format!("failed to load history for {key}"))
            }
        }
    }

    async fn refresh_groups(&self) -> Result<Vec<GroupSummary>> {
        let (server_url, _user_id) = self.session().await?;
        let groups: Vec<GroupSummary> = self
            .http
            .get(format!("{server_url}/groups"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.store.lock().await.replace_groups(groups.clone());
        Ok(groups)
    }

    /// Apply one push event to the store and fan out whatever the outcome
    /// earns. Duplicates and discarded signals are silent.
    async fn reconcile_push_event(self: &Arc<Self>, event: PushEvent) {
        let applied = {
            let mut store = self.store.lock().await;
            store.apply_event(event.clone(), Utc::now())
        };

        match applied {
            Applied::Dropped | Applied::Duplicate(_) => return,
            Applied::UnreadIncremented(key) => {
                let count = self.store.lock().await.unread_count(key);
                let _ = self.events.send(ClientEvent::UnreadChanged { key, count });
            }
            Applied::TypingStarted(_) => self.arm_typing_expiry(),
            Applied::RosterRefetchNeeded(group_id) => {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = client.refresh_groups().await {
                        let _ = client.events.send(ClientEvent::Error(format!(
                            "failed to refresh groups after membership change for group {}: {err}",
                            group_id.0
                        )));
                    }
                });
            }
            _ => {}
        }

        let _ = self.events.send(ClientEvent::Push(event));
    }

    /// One timer per typing signal; a refreshed indicator carries a newer
    /// deadline, so a stale timer firing is a no-op.
    fn arm_typing_expiry(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let sleep_for = self.config.typing_timeout + TYPING_EXPIRY_GRACE;
        tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;
            let expired = {
                let mut store = client.store.lock().await;
                store.expire_typing(Utc::now())
            };
            if let Some(key) = expired {
                let _ = client.events.send(ClientEvent::TypingExpired { key });
            }
        });
    }

    async fn spawn_push_reader(self: &Arc<Self>, server_url: &str, user_id: UserId) -> Result<()> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?user_id={}", user_id.0);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect push stream: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => client.reconcile_push_event(event).await,
                        // Local recovery: malformed frames are logged, never
                        // surfaced to subscribers.
                        Err(err) => warn!("push: dropping malformed event frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("push stream failed: {err}")));
                        break;
                    }
                }
            }
            let mut session = client.session.lock().await;
            session.ws_started = false;
        });

        Ok(())
    }

    fn validate_draft(draft: &MessageDraft) -> Result<(), SendError> {
        if draft.is_empty() {
            return Err(SendError::EmptyDraft);
        }
        if let Some(image_b64) = &draft.image_b64 {
            if STANDARD.decode(image_b64).is_err() {
                return Err(SendError::InvalidImage);
            }
        }
        Ok(())
    }
}

/// Surface the server's own error message when the body carries one.
async fn decode_api_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api_error) => anyhow::Error::new(api_error),
        Err(_) => anyhow!("request failed with status {status}"),
    }
}

/// Front-end facing handle, one implementation per transport arrangement.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId>;
    async fn fetch_users(&self) -> Result<Vec<UserSummary>>;
    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>>;
    async fn fetch_unread_counts(&self) -> Result<()>;
    async fn select_user(&self, peer_id: UserId) -> Result<()>;
    async fn select_group(&self, group_id: GroupId) -> Result<()>;
    async fn clear_selection(&self);
    async fn send_message(&self, draft: MessageDraft) -> Result<MessagePayload, SendError>;
    async fn create_group(&self, name: &str, member_ids: Vec<UserId>) -> Result<GroupSummary>;
    async fn conversation_view(&self) -> ConversationView;
    async fn sidebar(&self, query: SidebarQuery) -> SidebarView;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl ChatHandle for Arc<ChatClient> {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        url::Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;

        let res = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body: LoginResponse = res.json().await?;

        {
            let mut session = self.session.lock().await;
            session.server_url = Some(server_url.to_string());
            session.user_id = Some(body.user_id);
            session.ws_started = false;
        }
        {
            let mut store = self.store.lock().await;
            *store = ChatStore::new(self.typing_timeout_chrono());
            store.set_self(body.user_id);
        }

        if let Err(err) = self.spawn_push_reader(server_url, body.user_id).await {
            let mut session = self.session.lock().await;
            session.server_url = None;
            session.user_id = None;
            session.ws_started = false;
            return Err(err);
        }

        {
            let mut session = self.session.lock().await;
            session.ws_started = true;
        }

        info!(user_id = body.user_id.0, "chat: logged in");
        Ok(body.user_id)
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>> {
        let (server_url, _user_id) = self.session().await?;
        {
            self.store.lock().await.begin_users_load();
        }
        let result: Result<Vec<UserSummary>> = async {
            let users = self
                .http
                .get(format!("{server_url}/messages/users"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(users)
        }
        .await;

        let mut store = self.store.lock().await;
        store.finish_users_load();
        match result {
            Ok(users) => {
                store.replace_users(users.clone());
                Ok(users)
            }
            Err(err) => Err(err).context("failed to fetch users"),
        }
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        self.refresh_groups().await
    }

    async fn fetch_unread_counts(&self) -> Result<()> {
        let (server_url, _user_id) = self.session().await?;
        let entries: Vec<UnreadCountEntry> = self
            .http
            .get(format!("{server_url}/messages/unread-counts"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let counts: HashMap<ConversationKey, u64> = entries
            .into_iter()
            .map(|entry| (entry.conversation, entry.count))
            .collect();
        self.store.lock().await.seed_unread_counts(counts);
        Ok(())
    }

    async fn select_user(&self, peer_id: UserId) -> Result<()> {
        self.activate(ConversationKey::Direct(peer_id)).await
    }

    async fn select_group(&self, group_id: GroupId) -> Result<()> {
        self.activate(ConversationKey::Group(group_id)).await
    }

    async fn clear_selection(&self) {
        self.store.lock().await.clear_selection();
    }

    async fn send_message(&self, draft: MessageDraft) -> Result<MessagePayload, SendError> {
        ChatClient::validate_draft(&draft)?;

        let (server_url, _user_id) = self
            .session()
            .await
            .map_err(|_| SendError::NotLoggedIn)?;

        let key = {
            let mut store = self.store.lock().await;
            let Some(key) = store.active_conversation() else {
                return Err(SendError::NoActiveConversation);
            };
            store.begin_send(key, draft.clone(), Utc::now());
            key
        };

        let url = match key {
            ConversationKey::Direct(peer_id) => {
                format!("{server_url}/messages/send/{}", peer_id.0)
            }
            ConversationKey::Group(group_id) => {
                format!("{server_url}/groups/{}/messages", group_id.0)
            }
        };

        let result: Result<MessagePayload> = async {
            let response = self.http.post(url).json(&draft).send().await?;
            if !response.status().is_success() {
                return Err(decode_api_error(response).await);
            }
            let confirmed = response.json().await?;
            Ok(confirmed)
        }
        .await;

        match result {
            Ok(confirmed) => {
                // The push echo may already have cleared the pending slot and
                // appended the message; dedup-by-id makes this a no-op then.
                self.reconcile_push_event(PushEvent::NewMessage {
                    message: confirmed.clone(),
                })
                .await;
                Ok(confirmed)
            }
            Err(err) => {
                let reason = err.to_string();
                let returned = self.store.lock().await.fail_send(key);
                if let Some(draft) = returned {
                    let _ = self.events.send(ClientEvent::SendFailed {
                        key,
                        draft,
                        reason: reason.clone(),
                    });
                }
                Err(SendError::Transport(reason))
            }
        }
    }

    async fn create_group(&self, name: &str, member_ids: Vec<UserId>) -> Result<GroupSummary> {
        if member_ids.len() > self.config.max_group_members {
            return Err(anyhow!(
                "group membership is capped at {} members, got {}",
                self.config.max_group_members,
                member_ids.len()
            ));
        }

        let (server_url, _user_id) = self.session().await?;
        let group: GroupSummary = self
            .http
            .post(format!("{server_url}/groups"))
            .json(&CreateGroupRequest {
                name: name.to_string(),
                member_ids,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.store.lock().await.upsert_group(group.clone());
        let _ = self.events.send(ClientEvent::Push(PushEvent::GroupCreated {
            group: group.clone(),
        }));
        Ok(group)
    }

    async fn conversation_view(&self) -> ConversationView {
        let store = self.store.lock().await;
        let active = store.active_conversation();
        ConversationView {
            active,
            messages: active
                .map(|key| store.messages_for(key).to_vec())
                .unwrap_or_default(),
            pending: active
                .and_then(|key| store.pending_for(key))
                .map(|pending| pending.draft.clone()),
            typing_actor: store.typing_actor(Utc::now()),
            unread_elsewhere: store.total_unread(),
            history_loading: store.is_history_loading(),
        }
    }

    async fn sidebar(&self, query: SidebarQuery) -> SidebarView {
        let store = self.store.lock().await;
        let filter = SidebarFilter {
            online_only: query.online_only,
            name_contains: query.name_contains.as_deref(),
        };
        let users = store
            .sidebar_users(filter)
            .into_iter()
            .map(|user| SidebarUserRow {
                online: store.is_online(user.user_id),
                unread: store.unread_count(ConversationKey::Direct(user.user_id)),
                user: user.clone(),
            })
            .collect();
        let groups = store.sorted_groups().into_iter().cloned().collect();
        SidebarView { users, groups }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
