//! In-process implementation of [`RemoteStore`].
//!
//! Behaves like the hosted document store the engine targets: ordered range
//! queries over typed values, opaque cursors, atomic batches and change
//! subscriptions that re-run their query on every write to the collection.
//! Documents lacking the ordering field are left out of ordered queries.
//!
//! Failure injection ([`set_offline`](MemoryStore::set_offline)), artificial
//! latency and a call journal make it usable as a test double.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
    },
    time::Duration,
};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    StoreError,
    store::{
        BatchOp, Cursor, DOCUMENT_ID_FIELD, Direction, DocPath, Fields, Query, QueryPage,
        RawRecord, RemoteStore, ResultStore, Snapshot, Subscription, Value, WriteBatch,
    },
};

type CollectionKey = (String, String);
type Collections = BTreeMap<CollectionKey, BTreeMap<String, Fields>>;

/// Operations recorded in the call journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Call {
    Query,
    Subscribe,
    Get,
    Set,
    Create,
    Update,
    Delete,
    Commit,
}

#[derive(Debug)]
struct Shared {
    collections: Mutex<Collections>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    journal: Mutex<Vec<Call>>,
    changes: broadcast::Sender<CollectionKey>,
}

impl Shared {
    fn collections(&self) -> ResultStore<MutexGuard<'_, Collections>> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn ensure_online(&self) -> ResultStore<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn notify(&self, user_id: &str, collection: &str) {
        // No receivers just means nobody is subscribed.
        let _ = self
            .changes
            .send((user_id.to_string(), collection.to_string()));
    }

    fn run_query(&self, user_id: &str, query: &Query) -> ResultStore<QueryPage> {
        self.ensure_online()?;
        let after = query.start_after.as_ref().map(decode_cursor).transpose()?;

        let collections = self.collections()?;
        let key = (user_id.to_string(), query.collection.clone());
        let Some(documents) = collections.get(&key) else {
            return Ok(QueryPage::default());
        };

        let field = query.order_by.field.as_str();
        let mut rows: Vec<(Value, &String, &Fields)> = documents
            .iter()
            .filter(|(_, fields)| {
                query
                    .filters
                    .iter()
                    .all(|filter| fields.get(&filter.field) == Some(&filter.value))
            })
            .filter_map(|(id, fields)| order_value(field, id, fields).map(|v| (v, id, fields)))
            .collect();

        let direction = query.order_by.direction;
        rows.sort_by(|a, b| position_cmp((&a.0, a.1), (&b.0, b.1), direction));

        let records: Vec<RawRecord> = rows
            .into_iter()
            .filter(|(value, id, _)| match &after {
                Some(cursor) => {
                    position_cmp((value, *id), (&cursor.value, &cursor.id), direction)
                        == Ordering::Greater
                }
                None => true,
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(_, id, fields)| RawRecord {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();

        let cursor = records
            .last()
            .and_then(|last| {
                order_value(field, &last.id, &last.fields).map(|value| CursorPosition {
                    value,
                    id: last.id.clone(),
                })
            })
            .map(|position| encode_cursor(&position))
            .transpose()?;

        Ok(QueryPage { records, cursor })
    }

    fn snapshot(&self, user_id: &str, query: &Query) -> Snapshot {
        self.run_query(user_id, query).map(|page| page.records)
    }
}

fn order_value(field: &str, id: &str, fields: &Fields) -> Option<Value> {
    if field == DOCUMENT_ID_FIELD {
        return Some(Value::from(id));
    }
    fields.get(field).cloned()
}

fn position_cmp(a: (&Value, &String), b: (&Value, &String), direction: Direction) -> Ordering {
    let ord = a.0.order_cmp(b.0).then_with(|| a.1.cmp(b.1));
    match direction {
        Direction::Ascending => ord,
        Direction::Descending => ord.reverse(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPosition {
    value: Value,
    id: String,
}

fn encode_cursor(position: &CursorPosition) -> ResultStore<Cursor> {
    let bytes = serde_json::to_vec(position)
        .map_err(|_| StoreError::Invalid("invalid cursor".to_string()))?;
    Ok(Cursor::new(
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
    ))
}

fn decode_cursor(cursor: &Cursor) -> ResultStore<CursorPosition> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor.as_str().as_bytes())
        .map_err(|_| StoreError::Invalid("invalid cursor".to_string()))?;
    serde_json::from_slice(&bytes).map_err(|_| StoreError::Invalid("invalid cursor".to_string()))
}

/// Shared handle to an in-memory document store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                collections: Mutex::new(BTreeMap::new()),
                offline: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
                journal: Mutex::new(Vec::new()),
                changes,
            }),
        }
    }

    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Delay applied before every operation.
    pub fn set_latency(&self, latency: Duration) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.shared
            .latency_ms
            .store(latency_ms, AtomicOrdering::SeqCst);
    }

    /// Operations issued so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.shared
            .journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().into_iter().filter(|c| *c == call).count()
    }

    /// Writes a document as another writer would, bypassing failure
    /// injection and the journal. Subscribers are notified.
    pub fn put_raw(&self, path: &DocPath, fields: Fields) {
        if let Ok(mut collections) = self.shared.collections() {
            collections
                .entry((path.user_id.clone(), path.collection.clone()))
                .or_default()
                .insert(path.id.clone(), fields);
        }
        self.shared.notify(&path.user_id, &path.collection);
    }

    /// Number of documents in a collection.
    pub fn len(&self, user_id: &str, collection: &str) -> usize {
        self.shared
            .collections()
            .map(|collections| {
                collections
                    .get(&(user_id.to_string(), collection.to_string()))
                    .map_or(0, BTreeMap::len)
            })
            .unwrap_or_default()
    }

    async fn begin(&self, call: Call) -> ResultStore<()> {
        let latency = self.shared.latency_ms.load(AtomicOrdering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if let Ok(mut journal) = self.shared.journal.lock() {
            journal.push(call);
        }
        self.shared.ensure_online()
    }
}

impl RemoteStore for MemoryStore {
    async fn query(&self, user_id: &str, query: &Query) -> ResultStore<QueryPage> {
        self.begin(Call::Query).await?;
        self.shared.run_query(user_id, query)
    }

    async fn subscribe(&self, user_id: &str, query: &Query) -> ResultStore<Subscription> {
        self.begin(Call::Subscribe).await?;

        let (tx, rx) = mpsc::channel(16);
        let mut changes = self.shared.changes.subscribe();
        let shared = Arc::clone(&self.shared);
        let user_id = user_id.to_string();
        let query = query.clone();

        let task = tokio::spawn(async move {
            if tx.send(shared.snapshot(&user_id, &query)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok((user, collection)) => {
                        if user != user_id || collection != query.collection {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscription lagged, re-reading window");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if tx.send(shared.snapshot(&user_id, &query)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }

    async fn get(&self, path: &DocPath) -> ResultStore<Option<RawRecord>> {
        self.begin(Call::Get).await?;
        let collections = self.shared.collections()?;
        Ok(collections
            .get(&(path.user_id.clone(), path.collection.clone()))
            .and_then(|documents| documents.get(&path.id))
            .map(|fields| RawRecord {
                id: path.id.clone(),
                fields: fields.clone(),
            }))
    }

    async fn set(&self, path: &DocPath, fields: Fields) -> ResultStore<()> {
        self.begin(Call::Set).await?;
        self.shared
            .collections()?
            .entry((path.user_id.clone(), path.collection.clone()))
            .or_default()
            .insert(path.id.clone(), fields);
        self.shared.notify(&path.user_id, &path.collection);
        Ok(())
    }

    async fn create(&self, user_id: &str, collection: &str, fields: Fields) -> ResultStore<String> {
        self.begin(Call::Create).await?;
        let id = Uuid::new_v4().to_string();
        self.shared
            .collections()?
            .entry((user_id.to_string(), collection.to_string()))
            .or_default()
            .insert(id.clone(), fields);
        self.shared.notify(user_id, collection);
        Ok(id)
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> ResultStore<()> {
        self.begin(Call::Update).await?;
        {
            let mut collections = self.shared.collections()?;
            let document = collections
                .get_mut(&(path.user_id.clone(), path.collection.clone()))
                .and_then(|documents| documents.get_mut(&path.id))
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            document.extend(fields);
        }
        self.shared.notify(&path.user_id, &path.collection);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> ResultStore<()> {
        self.begin(Call::Delete).await?;
        let removed = self
            .shared
            .collections()?
            .get_mut(&(path.user_id.clone(), path.collection.clone()))
            .and_then(|documents| documents.remove(&path.id))
            .is_some();
        if removed {
            self.shared.notify(&path.user_id, &path.collection);
        }
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> ResultStore<()> {
        self.begin(Call::Commit).await?;
        let mut touched: Vec<CollectionKey> = Vec::new();
        {
            let mut collections = self.shared.collections()?;

            // Check every update target first so a failing batch writes nothing.
            for op in &batch.ops {
                if let BatchOp::Update {
                    user_id,
                    collection,
                    id,
                    ..
                } = op
                {
                    let exists = collections
                        .get(&(user_id.clone(), collection.clone()))
                        .is_some_and(|documents| documents.contains_key(id));
                    if !exists {
                        return Err(StoreError::NotFound(
                            DocPath::new(user_id, collection, id).to_string(),
                        ));
                    }
                }
            }

            for op in batch.ops {
                match op {
                    BatchOp::Create {
                        user_id,
                        collection,
                        fields,
                    } => {
                        let key = (user_id, collection);
                        collections
                            .entry(key.clone())
                            .or_default()
                            .insert(Uuid::new_v4().to_string(), fields);
                        touched.push(key);
                    }
                    BatchOp::Update {
                        user_id,
                        collection,
                        id,
                        fields,
                    } => {
                        let key = (user_id, collection);
                        if let Some(document) = collections
                            .get_mut(&key)
                            .and_then(|documents| documents.get_mut(&id))
                        {
                            document.extend(fields);
                        }
                        touched.push(key);
                    }
                    BatchOp::Delete {
                        user_id,
                        collection,
                        id,
                    } => {
                        let key = (user_id, collection);
                        if let Some(documents) = collections.get_mut(&key) {
                            documents.remove(&id);
                        }
                        touched.push(key);
                    }
                }
            }
        }

        touched.sort();
        touched.dedup();
        for (user_id, collection) in touched {
            self.shared.notify(&user_id, &collection);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(amount: i64) -> Fields {
        let mut fields = Fields::new();
        fields.insert("n".to_string(), Value::Integer(amount));
        fields
    }

    fn ids(page: &QueryPage) -> Vec<&str> {
        page.records.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn ordered_pages_follow_the_cursor() {
        let store = MemoryStore::new();
        for (id, n) in [("a", 1), ("b", 3), ("c", 2), ("d", 5)] {
            store.put_raw(&DocPath::new("u", "items", id), doc(n));
        }

        let query = Query::collection("items")
            .order_by("n", Direction::Descending)
            .limit(2);
        let first = store.query("u", &query).await.unwrap();
        assert_eq!(ids(&first), vec!["d", "b"]);

        let next = store
            .query("u", &query.clone().start_after(first.cursor))
            .await
            .unwrap();
        assert_eq!(ids(&next), vec!["c", "a"]);

        let last = store
            .query("u", &query.start_after(next.cursor))
            .await
            .unwrap();
        assert!(last.records.is_empty());
        assert_eq!(last.cursor, None);
    }

    #[tokio::test]
    async fn documents_without_order_field_are_skipped() {
        let store = MemoryStore::new();
        store.put_raw(&DocPath::new("u", "items", "a"), doc(1));
        store.put_raw(&DocPath::new("u", "items", "b"), Fields::new());

        let query = Query::collection("items").order_by("n", Direction::Ascending);
        let page = store.query("u", &query).await.unwrap();
        assert_eq!(ids(&page), vec!["a"]);
    }

    #[tokio::test]
    async fn equality_filters_apply() {
        let store = MemoryStore::new();
        store.put_raw(&DocPath::new("u", "items", "a"), doc(1));
        store.put_raw(&DocPath::new("u", "items", "b"), doc(2));

        let query = Query::collection("items").filter_eq("n", 2_i64);
        let page = store.query("u", &query).await.unwrap();
        assert_eq!(ids(&page), vec!["b"]);
    }

    #[tokio::test]
    async fn garbage_cursor_is_rejected() {
        let store = MemoryStore::new();
        let query = Query::collection("items").start_after(Some(Cursor::new("%%%")));
        let err = store.query("u", &query).await.unwrap_err();
        assert_eq!(err, StoreError::Invalid("invalid cursor".to_string()));
    }

    #[tokio::test]
    async fn failing_batch_writes_nothing() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::default();
        batch.create("u", "items", doc(1));
        batch.update(&DocPath::new("u", "items", "missing"), doc(2));

        assert!(matches!(
            store.commit(batch).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.len("u", "items"), 0);
    }

    #[tokio::test]
    async fn offline_store_fails_and_journals() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store
            .delete(&DocPath::new("u", "items", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls(), vec![Call::Delete]);
    }

    #[test]
    fn oversized_latency_saturates() {
        let store = MemoryStore::new();
        store.set_latency(Duration::MAX);
        assert_eq!(
            store.shared.latency_ms.load(AtomicOrdering::SeqCst),
            u64::MAX
        );
    }

    #[tokio::test]
    async fn subscription_sees_later_writes() {
        let store = MemoryStore::new();
        let query = Query::collection("items").order_by("n", Direction::Ascending);
        let mut subscription = store.subscribe("u", &query).await.unwrap();

        assert_eq!(subscription.next().await, Some(Ok(Vec::new())));

        store.put_raw(&DocPath::new("u", "items", "a"), doc(1));
        let snapshot = subscription.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);

        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }
}
