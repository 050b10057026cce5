//! Inbox synchronization core for the hrdesk client.
//!
//! Keeps a locally cached collection of notifications or chat messages
//! consistent with the server under concurrent push delivery, manual
//! refresh, and read/unread mutations. No rendering, no transport protocol
//! — those live behind the [`ItemApi`] and [`PushTransport`] seams.
//!
//! # Pieces
//!
//! - [`InboxStore`] — single source of truth for one conversation: merges
//!   fetched and pushed items (dedupe by id, monotonic read state), applies
//!   optimistic read mutations with rollback, notifies observers.
//! - [`EventStreamClient`] — push-hub subscription with automatic reconnect
//!   and capped exponential backoff.
//! - [`SyncController`] — initial paginated load with bounded retry, then
//!   the live subscription; degrades without discarding data when the hub
//!   is unreachable.
//! - [`InboxService`] — one controller per open conversation, with explicit
//!   open/close/switch lifecycle.
//!
//! # Example
//!
//! ```ignore
//! let api = Arc::new(HttpItemApi::new("https://hr.example.com/api").with_bearer(token));
//! let service = InboxService::new(api, transport, SyncConfig::default());
//!
//! let store = service.open(ConversationKey::Notifications);
//! let sub = store.subscribe(|| render());
//!
//! let snap = store.snapshot();
//! println!("{} unread", snap.unread_count);
//! store.mark_all_read().await?;
//!
//! store.unsubscribe(sub);
//! service.close(&ConversationKey::Notifications).await;
//! ```

pub mod api;
pub mod error;
pub mod model;
pub mod service;
pub mod store;
pub mod stream;
pub mod sync;

pub use api::{HttpItemApi, ItemApi};
pub use error::{ConnectionError, ErrorClass, FetchError, MutationError};
pub use model::{ConversationKey, InboxSnapshot, Item, ItemId, ItemPage};
pub use service::InboxService;
pub use store::{ChangeHandler, InboxStore, SubscriptionId};
pub use stream::{
    ConnectionState, EventStreamClient, PushEvent, PushSession, PushTransport, StreamConfig,
    StreamHandle,
};
pub use sync::{SyncConfig, SyncController, SyncState};
