use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ItemApi;
use crate::error::FetchError;
use crate::model::{ConversationKey, Item};
use crate::store::InboxStore;
use crate::stream::{
    ConnectionState, EventStreamClient, PushEvent, PushTransport, StreamConfig, backoff_delay,
};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Initial-load retry policy plus the stream policy to sync with.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Total fetch attempts before giving up on a transient failure.
    pub fetch_max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub fetch_backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub fetch_backoff_cap: Duration,
    pub stream: StreamConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_max_attempts: 4,
            fetch_backoff_base: Duration::from_millis(500),
            fetch_backoff_cap: Duration::from_secs(10),
            stream: StreamConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// `Idle → Loading → Ready` on the happy path; `Loading → Retrying →
/// Loading` on transient fetch failures; `Loading → Error` on permanent
/// failure or retry exhaustion; `Ready ↔ Degraded` tracks the push stream
/// (hydrated data stays visible while degraded). Shutdown returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading,
    Retrying,
    Ready,
    Degraded,
    Error,
}

// ---------------------------------------------------------------------------
// SyncController
// ---------------------------------------------------------------------------

/// Orchestrates one conversation: initial paginated load into the store,
/// then the push subscription, merging every delivered item.
///
/// Owns the [`InboxStore`] and a single spawned task. `shutdown()` cancels
/// any in-flight fetch (no late hydrate into a store nobody displays) and
/// disconnects the stream.
pub struct SyncController {
    key: ConversationKey,
    store: Arc<InboxStore>,
    state: watch::Receiver<SyncState>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SyncController {
    /// Spawn the sync task for one conversation. Must be called within a
    /// tokio runtime.
    pub fn start(
        key: ConversationKey,
        api: Arc<dyn ItemApi>,
        transport: Arc<dyn PushTransport>,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::new(InboxStore::new(key.clone(), Arc::clone(&api)));
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let cancel = CancellationToken::new();

        let task_key = key.clone();
        let task_store = Arc::clone(&store);
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            run(task_key, api, transport, config, task_store, state_tx, task_cancel).await;
        });

        Self { key, store, state: state_rx, cancel, join }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The store this controller feeds. Share it with as many observers as
    /// needed; they all see the same snapshots.
    pub fn store(&self) -> Arc<InboxStore> {
        Arc::clone(&self.store)
    }

    /// Watch the controller state machine.
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Cancel the sync task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

enum LoadOutcome {
    Loaded,
    Cancelled,
    Failed(FetchError),
}

async fn run(
    key: ConversationKey,
    api: Arc<dyn ItemApi>,
    transport: Arc<dyn PushTransport>,
    config: SyncConfig,
    store: Arc<InboxStore>,
    state: watch::Sender<SyncState>,
    cancel: CancellationToken,
) {
    let _ = state.send(SyncState::Loading);
    match initial_load(&key, api.as_ref(), &store, &config, &state, &cancel).await {
        LoadOutcome::Loaded => {}
        LoadOutcome::Cancelled => {
            let _ = state.send(SyncState::Idle);
            return;
        }
        LoadOutcome::Failed(err) => {
            error!(%key, "initial load failed: {err}");
            let _ = state.send(SyncState::Error);
            return;
        }
    }
    let _ = state.send(SyncState::Ready);
    info!(%key, items = store.snapshot().items.len(), "inbox sync ready");

    let mut stream = EventStreamClient::connect(transport, config.stream.clone());
    let mut stream_state = stream.state();
    let mut stream_state_done = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next_event() => match event {
                Some(event) => ingest_event(&store, &key, event),
                None => {
                    // The stream loop has ended; it only does so terminally.
                    if *stream_state.borrow() == ConnectionState::Failed {
                        warn!(%key, "push stream failed, serving last good snapshot");
                        let _ = state.send(SyncState::Degraded);
                    }
                    cancel.cancelled().await;
                    break;
                }
            },
            changed = stream_state.changed(), if !stream_state_done => {
                if changed.is_err() {
                    stream_state_done = true;
                    continue;
                }
                let current = *stream_state.borrow_and_update();
                match current {
                    ConnectionState::Connected => {
                        let _ = state.send(SyncState::Ready);
                    }
                    ConnectionState::Reconnecting | ConnectionState::Failed => {
                        let _ = state.send(SyncState::Degraded);
                    }
                    ConnectionState::Connecting | ConnectionState::Disconnected => {}
                }
            }
        }
    }

    stream.disconnect().await;
    let _ = state.send(SyncState::Idle);
    info!(%key, "inbox sync stopped");
}

/// Paginate `list_items` until the cursor runs out, hydrating each page.
/// Transient failures retry with capped backoff up to the configured number
/// of attempts; a retried fetch restarts from the first page and relies on
/// the store's dedupe for pages already merged.
async fn initial_load(
    key: &ConversationKey,
    api: &dyn ItemApi,
    store: &InboxStore,
    config: &SyncConfig,
    state: &watch::Sender<SyncState>,
    cancel: &CancellationToken,
) -> LoadOutcome {
    let mut attempt: u32 = 0;
    loop {
        match fetch_all(key, api, store, cancel).await {
            Ok(true) => return LoadOutcome::Loaded,
            Ok(false) => return LoadOutcome::Cancelled,
            Err(err) if err.is_transient() && attempt + 1 < config.fetch_max_attempts => {
                let delay =
                    backoff_delay(config.fetch_backoff_base, config.fetch_backoff_cap, attempt);
                attempt += 1;
                warn!(%key, attempt, ?delay, "transient fetch failure, retrying: {err}");
                let _ = state.send(SyncState::Retrying);
                tokio::select! {
                    _ = cancel.cancelled() => return LoadOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = state.send(SyncState::Loading);
            }
            Err(err) => return LoadOutcome::Failed(err),
        }
    }
}

/// Returns `Ok(false)` when cancelled mid-flight; nothing is hydrated after
/// cancellation.
async fn fetch_all(
    key: &ConversationKey,
    api: &dyn ItemApi,
    store: &InboxStore,
    cancel: &CancellationToken,
) -> Result<bool, FetchError> {
    let mut cursor: Option<String> = None;
    loop {
        let page = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            page = api.list_items(key, cursor.as_deref()) => page?,
        };
        debug!(%key, items = page.items.len(), "hydrating page");
        store.hydrate(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(true),
        }
    }
}

fn ingest_event(store: &InboxStore, key: &ConversationKey, event: PushEvent) {
    match serde_json::from_value::<Item>(event.payload) {
        Ok(item) => {
            if item.conversation_key != *key {
                // One hub connection multiplexes every conversation.
                debug!(%key, other = %item.conversation_key, "skipping item for other conversation");
                return;
            }
            store.ingest_pushed(item);
        }
        Err(err) => {
            warn!(%key, "undecodable push payload: {err}");
            store.note_malformed();
        }
    }
}
