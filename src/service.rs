use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::ItemApi;
use crate::model::ConversationKey;
use crate::store::InboxStore;
use crate::stream::PushTransport;
use crate::sync::{SyncConfig, SyncController, SyncState};

/// Registry of live sync controllers, one per conversation.
///
/// The embedding application constructs one service with its api, transport,
/// and config, then opens and closes conversations as the UI navigates.
/// Conversations are independent: each has its own store, fetch retry loop,
/// and push subscription.
pub struct InboxService {
    api: Arc<dyn ItemApi>,
    transport: Arc<dyn PushTransport>,
    config: SyncConfig,
    active: Mutex<HashMap<ConversationKey, SyncController>>,
}

impl InboxService {
    pub fn new(
        api: Arc<dyn ItemApi>,
        transport: Arc<dyn PushTransport>,
        config: SyncConfig,
    ) -> Self {
        Self { api, transport, config, active: Mutex::new(HashMap::new()) }
    }

    /// Start syncing a conversation (idempotent) and return its store.
    ///
    /// Opening an already-open key returns the existing store unchanged.
    pub fn open(&self, key: ConversationKey) -> Arc<InboxStore> {
        let mut active = self.active.lock().unwrap();
        if let Some(controller) = active.get(&key) {
            debug!(%key, "conversation already open");
            return controller.store();
        }
        info!(%key, "opening conversation");
        let controller = SyncController::start(
            key.clone(),
            Arc::clone(&self.api),
            Arc::clone(&self.transport),
            self.config.clone(),
        );
        let store = controller.store();
        active.insert(key, controller);
        store
    }

    /// The store for an open conversation, if any.
    pub fn store(&self, key: &ConversationKey) -> Option<Arc<InboxStore>> {
        self.active.lock().unwrap().get(key).map(|c| c.store())
    }

    /// Watch the sync state of an open conversation, if any (so the UI can
    /// show loading/reconnecting without touching the controller).
    pub fn state(&self, key: &ConversationKey) -> Option<watch::Receiver<SyncState>> {
        self.active.lock().unwrap().get(key).map(|c| c.state())
    }

    /// Stop syncing a conversation: cancels any in-flight fetch and
    /// disconnects its push stream. Unknown keys are a no-op.
    pub async fn close(&self, key: &ConversationKey) {
        let controller = self.active.lock().unwrap().remove(key);
        if let Some(controller) = controller {
            info!(%key, "closing conversation");
            controller.shutdown().await;
        }
    }

    /// Navigate between conversations: the old key is fully shut down
    /// before the new one connects.
    pub async fn switch(&self, from: &ConversationKey, to: ConversationKey) -> Arc<InboxStore> {
        self.close(from).await;
        self.open(to)
    }

    /// Shut down every open conversation.
    pub async fn shutdown(&self) {
        let all: Vec<SyncController> = {
            let mut active = self.active.lock().unwrap();
            active.drain().map(|(_, controller)| controller).collect()
        };
        for controller in all {
            controller.shutdown().await;
        }
    }
}
