use thiserror::Error;

use crate::model::ItemId;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Whether a failure is worth retrying.
///
/// Transient failures (network blips, 5xx, throttling) are absorbed and
/// retried internally with backoff. Permanent failures (auth, malformed
/// request) surface to the caller as typed results — no silent retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    /// Classify an HTTP status code.
    ///
    /// 408/425/429 and all 5xx are transient; every other 4xx is permanent.
    pub fn for_status(status: u16) -> Self {
        match status {
            408 | 425 | 429 => Self::Transient,
            500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient)
    }
}

// ---------------------------------------------------------------------------
// FetchError
// ---------------------------------------------------------------------------

/// Failure of a `list_items` call.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct FetchError {
    pub class: ErrorClass,
    pub message: String,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Permanent, message: message.into() }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self { class: ErrorClass::for_status(status), message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.class.is_transient()
    }
}

// ---------------------------------------------------------------------------
// MutationError
// ---------------------------------------------------------------------------

/// Failure of one or more read-state persistence calls.
///
/// `failed_ids` lists exactly the items whose optimistic local update was
/// rolled back, so the caller can offer a retry affordance per item.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct MutationError {
    pub failed_ids: Vec<ItemId>,
    pub class: ErrorClass,
    pub message: String,
}

impl MutationError {
    pub fn single(id: ItemId, class: ErrorClass, message: impl Into<String>) -> Self {
        Self { failed_ids: vec![id], class, message: message.into() }
    }

    pub fn from_status(id: ItemId, status: u16, message: impl Into<String>) -> Self {
        Self::single(id, ErrorClass::for_status(status), message)
    }

    /// The item is not present in the local collection at all.
    pub fn unknown_item(id: ItemId) -> Self {
        let message = format!("unknown item '{id}'");
        Self::single(id, ErrorClass::Permanent, message)
    }

    /// Aggregate for `mark_all_read`: the ids whose individual call failed.
    pub fn partial(failed_ids: Vec<ItemId>) -> Self {
        let message = format!("{} read-state update(s) failed", failed_ids.len());
        Self { failed_ids, class: ErrorClass::Transient, message }
    }
}

// ---------------------------------------------------------------------------
// ConnectionError
// ---------------------------------------------------------------------------

/// Push transport failure. Never invalidates already-hydrated data; the
/// sync layer degrades and keeps the last good snapshot visible.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ConnectionError {
    pub message: String,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
