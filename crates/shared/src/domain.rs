use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);

/// Opaque key addressing one conversation: a direct peer chat or a group chat.
///
/// Exactly one of the two identities is carried; every per-conversation map in
/// the engine (messages, unread counters, pending sends) is keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    Direct(UserId),
    Group(GroupId),
}

impl ConversationKey {
    pub fn as_direct(&self) -> Option<UserId> {
        match self {
            ConversationKey::Direct(peer_id) => Some(*peer_id),
            ConversationKey::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<GroupId> {
        match self {
            ConversationKey::Direct(_) => None,
            ConversationKey::Group(group_id) => Some(*group_id),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationKey::Direct(peer_id) => write!(f, "direct:{}", peer_id.0),
            ConversationKey::Group(group_id) => write!(f, "group:{}", group_id.0),
        }
    }
}
