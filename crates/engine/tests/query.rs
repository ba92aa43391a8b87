use std::time::Duration;

use engine::{
    BindMode, Call, CategorySet, Direction, DocPath, Fields, MemoryStore, Query, QueryBinder,
    QueryState, RawRecord, Value, record,
};
use tokio::sync::watch;

fn note(n: i64) -> Fields {
    let mut fields = Fields::new();
    fields.insert("n".to_string(), Value::Integer(n));
    fields
}

fn notes() -> Query {
    Query::collection("notes").order_by("n", Direction::Ascending)
}

/// Keeps even numbers only.
fn evens(raw: RawRecord) -> Option<i64> {
    match raw.fields.get("n") {
        Some(Value::Integer(n)) if n % 2 == 0 => Some(*n),
        _ => None,
    }
}

async fn wait_until<T>(
    rx: &mut watch::Receiver<QueryState<T>>,
    f: impl FnMut(&QueryState<T>) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
        .await
        .expect("state never reached")
        .expect("binder dropped");
}

#[tokio::test]
async fn one_shot_keeps_what_the_transform_accepts() {
    let store = MemoryStore::new();
    for n in 1..=5 {
        store.put_raw(&DocPath::new("u", "notes", format!("n{n}")), note(n));
    }

    let binder = QueryBinder::bind(&store, Some("u"), notes(), BindMode::OneShot, evens).await;
    let state = binder.state();
    assert_eq!(state.items, vec![2, 4]);
    assert!(!state.loading);
    assert_eq!(state.error, None);
    assert!(!binder.is_live());
}

#[tokio::test]
async fn one_shot_failure_clears_items() {
    let store = MemoryStore::new();
    store.put_raw(&DocPath::new("u", "notes", "a"), note(2));
    store.set_offline(true);

    let binder = QueryBinder::bind(&store, Some("u"), notes(), BindMode::OneShot, evens).await;
    let state = binder.state();
    assert!(state.items.is_empty());
    assert!(!state.loading);
    assert!(state.error.is_some());
}

#[tokio::test]
async fn missing_user_binds_empty_without_io() {
    let store = MemoryStore::new();
    store.put_raw(&DocPath::new("u", "notes", "a"), note(2));

    for mode in [BindMode::OneShot, BindMode::Continuous] {
        let binder = QueryBinder::bind(&store, None, notes(), mode, evens).await;
        assert_eq!(binder.state(), QueryState::default());
    }
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn continuous_binding_tracks_writes() {
    let store = MemoryStore::new();
    store.put_raw(&DocPath::new("u", "notes", "a"), note(2));

    let binder = QueryBinder::bind(&store, Some("u"), notes(), BindMode::Continuous, evens).await;
    let mut rx = binder.watch();
    wait_until(&mut rx, |s| s.items == vec![2]).await;
    assert!(binder.is_live());

    store.put_raw(&DocPath::new("u", "notes", "b"), note(3));
    store.put_raw(&DocPath::new("u", "notes", "c"), note(4));
    wait_until(&mut rx, |s| s.items == vec![2, 4]).await;

    // Writes to other users do not leak in.
    store.put_raw(&DocPath::new("v", "notes", "d"), note(0));
    store.put_raw(&DocPath::new("u", "notes", "e"), note(6));
    wait_until(&mut rx, |s| s.items == vec![2, 4, 6]).await;
}

#[tokio::test]
async fn subscription_error_keeps_the_last_items() {
    let store = MemoryStore::new();
    store.put_raw(&DocPath::new("u", "notes", "a"), note(2));

    let binder = QueryBinder::bind(&store, Some("u"), notes(), BindMode::Continuous, evens).await;
    let mut rx = binder.watch();
    wait_until(&mut rx, |s| s.items == vec![2]).await;

    store.set_offline(true);
    store.put_raw(&DocPath::new("u", "notes", "b"), note(4));
    wait_until(&mut rx, |s| s.error.is_some()).await;
    assert_eq!(binder.state().items, vec![2]);

    store.set_offline(false);
    store.put_raw(&DocPath::new("u", "notes", "c"), note(6));
    wait_until(&mut rx, |s| s.error.is_none()).await;
    assert_eq!(binder.state().items, vec![2, 4, 6]);
}

#[tokio::test]
async fn failed_subscribe_reports_error() {
    let store = MemoryStore::new();
    store.set_offline(true);

    let binder = QueryBinder::bind(&store, Some("u"), notes(), BindMode::Continuous, evens).await;
    let state = binder.state();
    assert!(!state.loading);
    assert!(state.error.is_some());
    assert!(!binder.is_live());
    assert_eq!(store.calls(), vec![Call::Subscribe]);
}

#[tokio::test]
async fn released_binder_stops_updating() {
    let store = MemoryStore::new();
    store.put_raw(&DocPath::new("u", "notes", "a"), note(2));

    let mut binder =
        QueryBinder::bind(&store, Some("u"), notes(), BindMode::Continuous, evens).await;
    let mut rx = binder.watch();
    wait_until(&mut rx, |s| s.items == vec![2]).await;

    binder.release();
    tokio::task::yield_now().await;
    store.put_raw(&DocPath::new("u", "notes", "b"), note(4));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!binder.is_live());
    assert_eq!(binder.state().items, vec![2]);
}

#[tokio::test]
async fn expense_transform_validates_records() {
    let store = MemoryStore::new();
    let mut good = Fields::new();
    good.insert(record::AMOUNT.to_string(), Value::Integer(7));
    good.insert(record::CATEGORY.to_string(), Value::from("travel"));
    good.insert(record::CREATED_AT.to_string(), Value::Integer(1));
    let mut bad = good.clone();
    bad.insert(record::AMOUNT.to_string(), Value::Double(-1.0));
    store.put_raw(&DocPath::new("u", record::EXPENSES_COLLECTION, "good"), good);
    store.put_raw(&DocPath::new("u", record::EXPENSES_COLLECTION, "bad"), bad);

    let query = Query::collection(record::EXPENSES_COLLECTION)
        .order_by(record::CREATED_AT, Direction::Descending);
    let transform = record::expense_transform("u", CategorySet::defaults());
    let binder = QueryBinder::bind(&store, Some("u"), query, BindMode::OneShot, transform).await;

    let items = binder.state().items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "good");
    assert_eq!(items[0].amount, 7.0);
    assert_eq!(items[0].description, "");
}
