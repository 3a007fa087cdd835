use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, MessageId, UserId};

/// One chat message as delivered by the history API or the push stream.
///
/// Identity fields are optional at the wire layer so that the reconciler, not
/// the deserializer, owns the malformed-event drop rule: a payload with
/// neither a sender nor a group cannot be routed to any conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_b64: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl MessagePayload {
    /// A well-formed message carries text, an image, or both.
    pub fn has_body(&self) -> bool {
        self.text.is_some() || self.image_b64.is_some()
    }
}

/// Body of an outgoing send before the server has confirmed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_b64: Option<String>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image_b64: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.image_b64.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub member_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Events delivered over the push stream, one variant per named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage {
        message: MessagePayload,
    },
    UserTyping {
        sender_id: UserId,
    },
    UserStopTyping {
        sender_id: UserId,
    },
    GroupTyping {
        group_id: GroupId,
        sender_id: UserId,
    },
    GroupStopTyping {
        group_id: GroupId,
        sender_id: UserId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    UserLastSeen {
        user_id: UserId,
        last_seen: DateTime<Utc>,
    },
    GroupMembersAdded {
        group_id: GroupId,
    },
    GroupCreated {
        group: GroupSummary,
    },
    UserJoined {
        user: UserSummary,
    },
}
