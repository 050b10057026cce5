use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::api::ItemApi;
use crate::error::MutationError;
use crate::model::{ConversationKey, InboxSnapshot, Item, ItemId};

/// Callback invoked after every visible mutation of the store.
pub type ChangeHandler = Arc<dyn Fn() + Send + Sync>;

/// Unique handle for an observer registration, returned by
/// [`InboxStore::subscribe`]. Pass it to [`InboxStore::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Collection {
    items: HashMap<ItemId, Item>,
    /// Previously-unseen items that arrived via push (the badge counter).
    new_count: u64,
    /// Items dropped because they had no usable id or an undecodable payload.
    dropped: u64,
}

/// Single source of truth for one conversation's item collection.
///
/// - `hydrate(items)` merges a fetched batch (dedupe by id).
/// - `ingest_pushed(item)` merges one pushed item, tracking the new-item badge.
/// - `mark_read(id)` / `mark_all_read()` flip read flags optimistically and
///   reconcile with the injected persistence API, rolling back on failure.
/// - `snapshot()` reads the sorted collection plus the derived unread count.
/// - `subscribe(handler)` registers a change observer.
///
/// All merges go through a single mutex, so two merges never interleave on
/// the underlying collection. Persistence awaits happen outside the lock.
/// Read state is monotonic: a stale fetch can never regress a locally-read
/// item back to unread.
pub struct InboxStore {
    key: ConversationKey,
    api: Arc<dyn ItemApi>,
    state: Mutex<Collection>,
    handlers: Mutex<Vec<(SubscriptionId, ChangeHandler)>>,
    next_id: AtomicU64,
}

impl InboxStore {
    pub fn new(key: ConversationKey, api: Arc<dyn ItemApi>) -> Self {
        Self {
            key,
            api,
            state: Mutex::new(Collection { items: HashMap::new(), new_count: 0, dropped: 0 }),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge a fetched batch into the collection.
    ///
    /// Fetch is authoritative for content: an existing entry's payload and
    /// timestamp are overwritten by the fetched copy, but its read flag only
    /// ever moves unread → read. Items with an empty id are dropped and
    /// counted, never fatal.
    pub fn hydrate(&self, items: Vec<Item>) {
        let mut changed = false;
        {
            let mut state = self.state.lock().unwrap();
            for item in items {
                if Self::merge(&mut state, item, false) {
                    changed = true;
                }
            }
        }
        if changed {
            self.notify();
        }
    }

    /// Merge a single pushed item.
    ///
    /// Same dedupe rule as [`hydrate`](Self::hydrate); additionally this is
    /// the only path that increments the new-item badge, and only for ids
    /// never seen before — redelivered duplicates do not inflate it.
    pub fn ingest_pushed(&self, item: Item) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            Self::merge(&mut state, item, true)
        };
        if changed {
            self.notify();
        }
    }

    /// Record an incoming item that could not be decoded at all.
    pub fn note_malformed(&self) {
        self.state.lock().unwrap().dropped += 1;
    }

    fn merge(state: &mut Collection, item: Item, pushed: bool) -> bool {
        if item.id.is_empty() {
            warn!(key = %item.conversation_key, "dropping item without id");
            state.dropped += 1;
            return false;
        }
        match state.items.entry(item.id.clone()) {
            Entry::Occupied(mut entry) => {
                // Read state is monotonic across merges.
                let is_read = entry.get().is_read || item.is_read;
                let mut item = item;
                item.is_read = is_read;
                entry.insert(item);
            }
            Entry::Vacant(entry) => {
                entry.insert(item);
                if pushed {
                    state.new_count += 1;
                }
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Read-state mutations
    // -----------------------------------------------------------------------

    /// Optimistically mark one item read, then persist.
    ///
    /// The local flip is visible to observers immediately. On persistence
    /// failure the flag reverts to its prior value and the error reports the
    /// failed id. Racing calls on an already-read item are local no-ops whose
    /// persistence call may still fire (idempotent on the server).
    pub async fn mark_read(&self, id: &ItemId) -> Result<(), MutationError> {
        let prior = {
            let mut state = self.state.lock().unwrap();
            match state.items.get_mut(id) {
                Some(item) => {
                    let prior = item.is_read;
                    item.is_read = true;
                    prior
                }
                None => return Err(MutationError::unknown_item(id.clone())),
            }
        };
        if !prior {
            self.notify();
        }

        match self.api.mark_item_read(id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(item) = state.items.get_mut(id) {
                        item.is_read = prior;
                    }
                }
                if !prior {
                    self.notify();
                }
                warn!(key = %self.key, %id, "mark_read rolled back: {err}");
                Err(err)
            }
        }
    }

    /// Optimistically mark every unread item read, then persist each flag.
    ///
    /// Persistence calls run concurrently, one per id. Only the ids whose
    /// call failed are reverted; successes stay committed. Partial failure
    /// is reported as `MutationError` carrying exactly the failed ids.
    pub async fn mark_all_read(&self) -> Result<(), MutationError> {
        let unread: Vec<ItemId> = {
            let mut state = self.state.lock().unwrap();
            let mut unread = Vec::new();
            for (id, item) in state.items.iter_mut() {
                if !item.is_read {
                    item.is_read = true;
                    unread.push(id.clone());
                }
            }
            unread
        };
        if unread.is_empty() {
            return Ok(());
        }
        self.notify();
        debug!(key = %self.key, count = unread.len(), "mark_all_read");

        let mut calls = JoinSet::new();
        for id in unread {
            let api = Arc::clone(&self.api);
            calls.spawn(async move {
                let result = api.mark_item_read(&id).await;
                (id, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(err))) => {
                    warn!(key = %self.key, %id, "mark_all_read: {err}");
                    failed.push(id);
                }
                Err(err) => warn!(key = %self.key, "mark_all_read task failed: {err}"),
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        failed.sort();
        {
            let mut state = self.state.lock().unwrap();
            for id in &failed {
                if let Some(item) = state.items.get_mut(id) {
                    item.is_read = false;
                }
            }
        }
        self.notify();
        Err(MutationError::partial(failed))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Point-in-time view: items sorted ascending by `(created_at, id)` and
    /// the unread count derived from them. Pure read, no side effects.
    pub fn snapshot(&self) -> InboxSnapshot {
        let state = self.state.lock().unwrap();
        let mut items: Vec<Item> = state.items.values().cloned().collect();
        items.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let unread_count = items.iter().filter(|i| !i.is_read).count();
        InboxSnapshot { items, unread_count }
    }

    /// Items that arrived via push and had never been seen before.
    pub fn new_count(&self) -> u64 {
        self.state.lock().unwrap().new_count
    }

    /// Reset the new-item badge (e.g. when the inbox panel is opened).
    pub fn acknowledge_new(&self) {
        self.state.lock().unwrap().new_count = 0;
    }

    /// Incoming items dropped as malformed since construction.
    pub fn dropped_malformed(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Register a change observer. Returns a handle for [`unsubscribe`].
    ///
    /// Handlers run after the mutation is visible, outside the state lock,
    /// so they may call [`snapshot`](Self::snapshot) freely.
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn subscribe(&self, handler: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().unwrap().push((id, Arc::new(handler)));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.lock().unwrap().retain(|(sub, _)| *sub != id);
    }

    fn notify(&self) {
        let handlers: Vec<ChangeHandler> = {
            let handlers = self.handlers.lock().unwrap();
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::error::ErrorClass;
    use crate::model::ItemPage;

    /// Scripted persistence: calls for ids in `fail` are rejected, every
    /// call is counted.
    struct TestApi {
        fail: HashSet<&'static str>,
        calls: AtomicUsize,
    }

    impl TestApi {
        fn ok() -> Arc<Self> {
            Arc::new(Self { fail: HashSet::new(), calls: AtomicUsize::new(0) })
        }

        fn failing(ids: &[&'static str]) -> Arc<Self> {
            Arc::new(Self { fail: ids.iter().copied().collect(), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ItemApi for TestApi {
        async fn list_items(
            &self,
            _key: &ConversationKey,
            _cursor: Option<&str>,
        ) -> Result<ItemPage, crate::error::FetchError> {
            Ok(ItemPage::default())
        }

        async fn mark_item_read(&self, id: &ItemId) -> Result<(), MutationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.contains(id.as_str()) {
                Err(MutationError::from_status(id.clone(), 500, "boom"))
            } else {
                Ok(())
            }
        }
    }

    fn item(id: &str, secs: i64, is_read: bool) -> Item {
        Item {
            id: ItemId::from(id),
            created_at: DateTime::from_timestamp(secs, 0).unwrap(),
            is_read,
            conversation_key: ConversationKey::Notifications,
            payload: serde_json::Map::new(),
        }
    }

    fn store() -> InboxStore {
        InboxStore::new(ConversationKey::Notifications, TestApi::ok())
    }

    #[test]
    fn hydrate_counts_unread() {
        let store = store();
        store.hydrate(vec![item("1", 10, false), item("2", 20, true)]);
        let snap = store.snapshot();
        assert_eq!(snap.items.len(), 2);
        assert_eq!(snap.unread_count, 1);
    }

    #[test]
    fn snapshot_sorted_by_created_at_ascending() {
        let store = store();
        store.hydrate(vec![item("c", 30, false), item("a", 10, false), item("b", 20, false)]);
        let snap = store.snapshot();
        let ids: Vec<&str> = snap.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn out_of_order_push_then_hydrate() {
        let store = store();
        store.ingest_pushed(item("b", 20, false));
        store.hydrate(vec![item("a", 10, false)]);
        let snap = store.snapshot();
        let ids: Vec<&str> = snap.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn ingest_pushed_is_idempotent() {
        let store = store();
        store.ingest_pushed(item("3", 30, false));
        store.ingest_pushed(item("3", 30, false));
        let snap = store.snapshot();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.unread_count, 1);
        // Redelivery does not inflate the badge.
        assert_eq!(store.new_count(), 1);
    }

    #[test]
    fn stale_hydrate_never_regresses_read_state() {
        let store = store();
        store.hydrate(vec![item("1", 10, true)]);
        store.hydrate(vec![item("1", 10, false)]);
        assert!(store.snapshot().items[0].is_read);
        assert_eq!(store.snapshot().unread_count, 0);
    }

    #[test]
    fn fetch_is_authoritative_for_payload() {
        let store = store();
        let mut stale = item("1", 10, false);
        stale.payload.insert("title".into(), "old".into());
        store.ingest_pushed(stale);

        let mut fresh = item("1", 10, false);
        fresh.payload.insert("title".into(), "new".into());
        store.hydrate(vec![fresh]);

        assert_eq!(store.snapshot().items[0].payload["title"], "new");
    }

    #[test]
    fn hydrate_drops_items_without_id() {
        let store = store();
        store.hydrate(vec![item("", 10, false), item("1", 20, false)]);
        assert_eq!(store.snapshot().items.len(), 1);
        assert_eq!(store.dropped_malformed(), 1);
    }

    #[test]
    fn acknowledge_resets_badge() {
        let store = store();
        store.ingest_pushed(item("1", 10, false));
        assert_eq!(store.new_count(), 1);
        store.acknowledge_new();
        assert_eq!(store.new_count(), 0);
    }

    #[tokio::test]
    async fn mark_read_commits_on_success() {
        let api = TestApi::ok();
        let store = InboxStore::new(ConversationKey::Notifications, api.clone());
        store.hydrate(vec![item("1", 10, false), item("2", 20, true)]);
        assert_eq!(store.snapshot().unread_count, 1);

        store.mark_read(&ItemId::from("1")).await.unwrap();
        assert_eq!(store.snapshot().unread_count, 0);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn mark_read_rolls_back_on_failure() {
        let store = InboxStore::new(ConversationKey::Notifications, TestApi::failing(&["1"]));
        store.hydrate(vec![item("1", 10, false)]);

        let err = store.mark_read(&ItemId::from("1")).await.unwrap_err();
        assert_eq!(err.failed_ids, vec![ItemId::from("1")]);
        assert!(!store.snapshot().items[0].is_read);
        assert_eq!(store.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn mark_read_already_read_is_local_noop_but_persists() {
        let api = TestApi::ok();
        let store = InboxStore::new(ConversationKey::Notifications, api.clone());
        store.hydrate(vec![item("1", 10, false)]);

        store.mark_read(&ItemId::from("1")).await.unwrap();
        store.mark_read(&ItemId::from("1")).await.unwrap();
        assert!(store.snapshot().items[0].is_read);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn mark_read_unknown_id_is_permanent_error() {
        let store = store();
        let err = store.mark_read(&ItemId::from("ghost")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(err.failed_ids, vec![ItemId::from("ghost")]);
    }

    #[tokio::test]
    async fn mark_all_read_reverts_only_failed_ids() {
        let store = InboxStore::new(ConversationKey::Notifications, TestApi::failing(&["3"]));
        store.hydrate(vec![item("1", 10, false), item("2", 20, true), item("3", 30, false)]);

        let err = store.mark_all_read().await.unwrap_err();
        assert_eq!(err.failed_ids, vec![ItemId::from("3")]);

        let snap = store.snapshot();
        let by_id: HashMap<&str, bool> =
            snap.items.iter().map(|i| (i.id.as_str(), i.is_read)).collect();
        assert!(by_id["1"], "successful id stays committed");
        assert!(by_id["2"]);
        assert!(!by_id["3"], "failed id reverts to unread");
        assert_eq!(snap.unread_count, 1);
    }

    #[tokio::test]
    async fn mark_all_read_with_nothing_unread_skips_persistence() {
        let api = TestApi::ok();
        let store = InboxStore::new(ConversationKey::Notifications, api.clone());
        store.hydrate(vec![item("1", 10, true)]);
        store.mark_all_read().await.unwrap();
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn observers_fire_on_every_visible_mutation() {
        let store = Arc::new(store());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.hydrate(vec![item("1", 10, false)]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        store.ingest_pushed(item("2", 20, false));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        store.mark_read(&ItemId::from("1")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        store.unsubscribe(sub);
        store.ingest_pushed(item("3", 30, false));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
