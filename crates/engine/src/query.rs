//! Generic binding of a store query to observable, validated state.
//!
//! A [`QueryBinder`] runs one [`Query`] either once or as a standing
//! subscription and exposes the transformed records together with loading and
//! error flags. Records the transform rejects are dropped silently.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::store::{Query, RawRecord, RemoteStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMode {
    /// Read the query once.
    OneShot,
    /// Keep the results in step with the store until released.
    Continuous,
}

/// Observable result of a bound query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T> {
    pub items: Vec<T>,
    pub loading: bool,
    pub error: Option<String>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loading: false,
            error: None,
        }
    }
}

/// A query bound to state. Dropping the binder releases its subscription.
pub struct QueryBinder<T> {
    state: Arc<watch::Sender<QueryState<T>>>,
    task: Option<JoinHandle<()>>,
}

impl<T> QueryBinder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Binds `query` for `user_id`. Without a user the result is empty.
    ///
    /// In one-shot mode this returns once the query settled. In continuous
    /// mode it returns once the subscription is open; results arrive through
    /// [`watch`](Self::watch).
    pub async fn bind<S, F>(
        store: &S,
        user_id: Option<&str>,
        query: Query,
        mode: BindMode,
        transform: F,
    ) -> Self
    where
        S: RemoteStore,
        F: Fn(RawRecord) -> Option<T> + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(QueryState {
            items: Vec::new(),
            loading: true,
            error: None,
        });
        let mut binder = Self {
            state: Arc::new(state),
            task: None,
        };

        let Some(user_id) = user_id.map(str::trim).filter(|id| !id.is_empty()) else {
            debug!(collection = %query.collection, "no user, binding empty result");
            binder.state.send_modify(|s| s.loading = false);
            return binder;
        };

        match mode {
            BindMode::OneShot => binder.fetch_once(store, user_id, &query, &transform).await,
            BindMode::Continuous => binder.listen(store, user_id, &query, transform).await,
        }
        binder
    }

    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.state.subscribe()
    }

    /// Whether a subscription is still feeding this binder.
    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the subscription, keeping the last delivered items.
    pub fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    async fn fetch_once<S, F>(&mut self, store: &S, user_id: &str, query: &Query, transform: &F)
    where
        S: RemoteStore,
        F: Fn(RawRecord) -> Option<T>,
    {
        match store.query(user_id, query).await {
            Ok(page) => {
                let items: Vec<T> = page.records.into_iter().filter_map(transform).collect();
                self.state.send_modify(|s| {
                    s.items = items;
                    s.loading = false;
                    s.error = None;
                });
            }
            Err(err) => {
                warn!(collection = %query.collection, "query failed: {err}");
                self.state.send_modify(|s| {
                    s.items.clear();
                    s.loading = false;
                    s.error = Some(err.to_string());
                });
            }
        }
    }

    async fn listen<S, F>(&mut self, store: &S, user_id: &str, query: &Query, transform: F)
    where
        S: RemoteStore,
        F: Fn(RawRecord) -> Option<T> + Send + Sync + 'static,
    {
        let mut subscription = match store.subscribe(user_id, query).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(collection = %query.collection, "subscription failed: {err}");
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(err.to_string());
                });
                return;
            }
        };

        let state = Arc::clone(&self.state);
        let collection = query.collection.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                match snapshot {
                    Ok(records) => {
                        let items: Vec<T> = records.into_iter().filter_map(&transform).collect();
                        state.send_modify(|s| {
                            s.items = items;
                            s.loading = false;
                            s.error = None;
                        });
                    }
                    // Keep the last good window on screen.
                    Err(err) => {
                        warn!(%collection, "subscription error: {err}");
                        state.send_modify(|s| {
                            s.loading = false;
                            s.error = Some(err.to_string());
                        });
                    }
                }
            }
            debug!(%collection, "subscription closed");
        }));
    }
}

impl<T> Drop for QueryBinder<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
