//! Contract of the remote document store the engine synchronizes with.
//!
//! Documents live under user-scoped collections (`users/{uid}/{collection}/{id}`)
//! and carry a map of typed [`Value`]s. The store supports ordered, filtered
//! range queries with an opaque [`Cursor`], single-document reads and writes,
//! atomic batches and change subscriptions.
//!
//! [`RawRecord`] is the only shape remote data takes before validation: code
//! outside [`record`](crate::record) and the category document parser never
//! reads its fields.

use std::{cmp::Ordering, collections::BTreeMap, fmt, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::StoreError;

pub type ResultStore<T> = Result<T, StoreError>;

/// Pseudo-field that orders by document id.
pub const DOCUMENT_ID_FIELD: &str = "__id__";

/// Field map of a document.
pub type Fields = BTreeMap<String, Value>;

/// One delivery of a subscription: the whole visible window, or a failure.
pub type Snapshot = ResultStore<Vec<RawRecord>>;

/// Store-native timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Converts to a calendar instant, `None` when out of range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            seconds: value.timestamp(),
            nanos: value.timestamp_subsec_nanos(),
        }
    }
}

/// A typed field value as stored remotely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[serde(rename = "nullValue")]
    Null,
    #[serde(rename = "booleanValue")]
    Boolean(bool),
    #[serde(rename = "integerValue")]
    Integer(i64),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "timestampValue")]
    Timestamp(Timestamp),
    #[serde(rename = "stringValue")]
    String(String),
    #[serde(rename = "arrayValue")]
    Array(Vec<Value>),
    #[serde(rename = "mapValue")]
    Map(Fields),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Numeric view of integers and doubles.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(value) => Some(*value as f64),
            Value::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Position of the value's type in the cross-type sort order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
        }
    }

    /// Total order used by ordered queries: type rank first, then value.
    /// Integers and doubles compare numerically.
    pub fn order_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(_) | Value::Double(_), Value::Integer(_) | Value::Double(_)) => {
                let a = self.as_f64().unwrap_or_default();
                let b = other.as_f64().unwrap_or_default();
                a.total_cmp(&b)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ord = left.order_cmp(right);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((left_key, left), (right_key, right)) in a.iter().zip(b.iter()) {
                    let ord = left_key.cmp(right_key).then_with(|| left.order_cmp(right));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Value::Timestamp(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<Fields> for Value {
    fn from(value: Fields) -> Self {
        Value::Map(value)
    }
}

/// An untrusted document exactly as the store returned it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub fields: Fields,
}

/// Address of a single document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub user_id: String,
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(
        user_id: impl Into<String>,
        collection: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "users/{}/{}/{}", self.user_id, self.collection, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality predicate on a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// Opaque pagination token produced by a store for one query.
///
/// A cursor is only meaningful for the query (collection, ordering, filters)
/// that produced it. If the collection changes between pages, fetching from
/// an old cursor may yield duplicates or skip records; nothing checks this.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An ordered query over one user-scoped collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub order_by: OrderBy,
    /// Result cap; `None` returns the whole (remaining) collection.
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Return records strictly after this position.
    pub start_after: Option<Cursor>,
}

impl Query {
    /// Query over `collection` ordered by document id, ascending.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: OrderBy {
                field: DOCUMENT_ID_FIELD.to_string(),
                direction: Direction::Ascending,
            },
            limit: None,
            filters: Vec::new(),
            start_after: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = OrderBy {
            field: field.into(),
            direction,
        };
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }
}

/// One window of query results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub records: Vec<RawRecord>,
    /// Position of the last returned record, `None` when nothing was returned.
    pub cursor: Option<Cursor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Create {
        user_id: String,
        collection: String,
        fields: Fields,
    },
    Update {
        user_id: String,
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        user_id: String,
        collection: String,
        id: String,
    },
}

/// A group of writes applied atomically by [`RemoteStore::commit`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn create(&mut self, user_id: &str, collection: &str, fields: Fields) {
        self.ops.push(BatchOp::Create {
            user_id: user_id.to_string(),
            collection: collection.to_string(),
            fields,
        });
    }

    pub fn update(&mut self, path: &DocPath, fields: Fields) {
        self.ops.push(BatchOp::Update {
            user_id: path.user_id.clone(),
            collection: path.collection.clone(),
            id: path.id.clone(),
            fields,
        });
    }

    pub fn delete(&mut self, path: &DocPath) {
        self.ops.push(BatchOp::Delete {
            user_id: path.user_id.clone(),
            collection: path.collection.clone(),
            id: path.id.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A standing query. Each delivery replaces the previous window.
///
/// The producing task stops on [`unsubscribe`](Self::unsubscribe) or when the
/// subscription is dropped.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Snapshot>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Snapshot>, task: JoinHandle<()>) -> Self {
        Self {
            receiver,
            task: Some(task),
        }
    }

    /// Waits for the next snapshot; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver.close();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Remote document store consumed by the engine.
pub trait RemoteStore: Send + Sync + 'static {
    /// Runs an ordered query once.
    fn query(
        &self,
        user_id: &str,
        query: &Query,
    ) -> impl Future<Output = ResultStore<QueryPage>> + Send;

    /// Opens a standing query. The first snapshot is the current window.
    fn subscribe(
        &self,
        user_id: &str,
        query: &Query,
    ) -> impl Future<Output = ResultStore<Subscription>> + Send;

    /// Reads a document, `None` when it does not exist.
    fn get(&self, path: &DocPath) -> impl Future<Output = ResultStore<Option<RawRecord>>> + Send;

    /// Creates or fully replaces a document.
    fn set(&self, path: &DocPath, fields: Fields) -> impl Future<Output = ResultStore<()>> + Send;

    /// Creates a document with a store-assigned id and returns the id.
    fn create(
        &self,
        user_id: &str,
        collection: &str,
        fields: Fields,
    ) -> impl Future<Output = ResultStore<String>> + Send;

    /// Merges `fields` into an existing document.
    fn update(
        &self,
        path: &DocPath,
        fields: Fields,
    ) -> impl Future<Output = ResultStore<()>> + Send;

    /// Deletes a document. Deleting a missing document succeeds.
    fn delete(&self, path: &DocPath) -> impl Future<Output = ResultStore<()>> + Send;

    /// Applies every write of the batch or none of them.
    fn commit(&self, batch: WriteBatch) -> impl Future<Output = ResultStore<()>> + Send;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn timestamp_round_trips_through_datetime() {
        let at = Utc.with_ymd_and_hms(2023, 11, 5, 9, 30, 0).unwrap();
        assert_eq!(Timestamp::from(at).to_datetime(), Some(at));
    }

    #[test]
    fn out_of_range_timestamp_has_no_datetime() {
        let ts = Timestamp {
            seconds: i64::MAX,
            nanos: 0,
        };
        assert_eq!(ts.to_datetime(), None);
    }

    #[test]
    fn numbers_compare_across_integer_and_double() {
        assert_eq!(Value::Integer(2).order_cmp(&Value::Double(2.5)), Ordering::Less);
        assert_eq!(Value::Double(3.0).order_cmp(&Value::Integer(3)), Ordering::Equal);
    }

    #[test]
    fn mixed_types_order_by_rank() {
        assert_eq!(Value::Null.order_cmp(&Value::from("a")), Ordering::Less);
        assert_eq!(
            Value::from("a").order_cmp(&Value::Timestamp(Timestamp::now())),
            Ordering::Greater
        );
    }

    #[test]
    fn value_serializes_with_type_tag() {
        let json = serde_json::to_value(Value::from("food")).unwrap();
        assert_eq!(json, serde_json::json!({ "stringValue": "food" }));
    }
}
