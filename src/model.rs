use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Opaque unique identifier of an inbox item.
///
/// Stable across fetch and push delivery — the store deduplicates on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// Logical grouping key for inbox items.
///
/// Messages belong to a peer (`User`) or a `Group`; notifications all live
/// in the single global `Notifications` feed. Displays as a path segment
/// (`notifications`, `user/{id}`, `group/{id}`) for REST routing.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum ConversationKey {
    #[default]
    Notifications,
    User(String),
    Group(String),
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notifications => f.write_str("notifications"),
            Self::User(id) => write!(f, "user/{id}"),
            Self::Group(id) => write!(f, "group/{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A notification or chat message.
///
/// `payload` is opaque associative data (title/body for notifications,
/// sender/content for messages) — the sync core never looks inside it.
/// Messages have no server-side read flag; `is_read` simply defaults to
/// false and follows the same local rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub conversation_key: ConversationKey,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// ItemPage
// ---------------------------------------------------------------------------

/// One page of a paginated item listing.
///
/// `next_cursor` is an opaque token; `None` means the listing is complete.
/// Items within a page come back in no particular order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage {
    pub items: Vec<Item>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// InboxSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one conversation's collection.
///
/// `items` is sorted ascending by `(created_at, id)`. `unread_count` is
/// computed from the items at snapshot time — never cached separately, so
/// the two can not drift apart.
#[derive(Debug, Clone)]
pub struct InboxSnapshot {
    pub items: Vec<Item>,
    pub unread_count: usize,
}
