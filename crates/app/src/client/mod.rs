//! [`RemoteStore`] over the REST document API.
//!
//! Collections live under `users/{uid}/{collection}`; queries and batches are
//! posted as JSON in the store's typed-value format. Change subscriptions are
//! emulated by polling the query and forwarding only windows that differ from
//! the previous one.

use std::time::Duration;

use engine::{
    DocPath, Fields, Query, QueryPage, RawRecord, RemoteStore, ResultStore, Snapshot, StoreError,
    Subscription, WriteBatch,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: Url,
    http: reqwest::Client,
    token: Option<String>,
    poll_interval: Duration,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>, poll_interval: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| AppError::Input(format!("invalid base_url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Input(format!("invalid base_url: {base_url}")));
        }
        Ok(Self {
            base_url,
            http: reqwest::Client::builder().build()?,
            token: token.filter(|t| !t.trim().is_empty()),
            poll_interval: poll_interval.max(Duration::from_millis(100)),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> ResultStore<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid(format!("invalid base_url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn document(&self, path: &DocPath) -> ResultStore<Url> {
        self.endpoint(&["users", &path.user_id, &path.collection, &path.id])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> ResultStore<Response> {
        let res = request.send().await.map_err(transport)?;
        if res.status().is_success() {
            return Ok(res);
        }

        let status = res.status();
        let body = res
            .json::<ErrorResponse>()
            .await
            .map(|err| err.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(status_error(status, body))
    }
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn status_error(status: StatusCode, body: String) -> StoreError {
    match status.as_u16() {
        401 | 403 => StoreError::PermissionDenied,
        404 => StoreError::NotFound(body),
        409 => StoreError::Conflict(body),
        400 | 422 => StoreError::Invalid(body),
        _ => StoreError::Unavailable(format!("{status}: {body}")),
    }
}

impl RemoteStore for HttpStore {
    async fn query(&self, user_id: &str, query: &Query) -> ResultStore<QueryPage> {
        let action = format!("{}:query", query.collection);
        let url = self.endpoint(&["users", user_id, &action])?;
        let res = self.send(self.request(Method::POST, url).json(query)).await?;
        res.json::<QueryPage>().await.map_err(transport)
    }

    async fn subscribe(&self, user_id: &str, query: &Query) -> ResultStore<Subscription> {
        let first = self.query(user_id, query).await?.records;

        let (tx, rx) = mpsc::channel(16);
        let store = self.clone();
        let user_id = user_id.to_string();
        let query = query.clone();

        let task = tokio::spawn(async move {
            let mut last: Snapshot = Ok(first);
            if tx.send(last.clone()).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = store
                    .query(&user_id, &query)
                    .await
                    .map(|page| page.records);
                if snapshot == last {
                    continue;
                }
                if let Err(err) = &snapshot {
                    warn!(%user_id, collection = %query.collection, "poll failed: {err}");
                }
                if tx.send(snapshot.clone()).await.is_err() {
                    break;
                }
                last = snapshot;
            }
            debug!(%user_id, collection = %query.collection, "polling stopped");
        });

        Ok(Subscription::new(rx, task))
    }

    async fn get(&self, path: &DocPath) -> ResultStore<Option<RawRecord>> {
        let url = self.document(path)?;
        match self.send(self.request(Method::GET, url)).await {
            Ok(res) => res.json::<RawRecord>().await.map(Some).map_err(transport),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set(&self, path: &DocPath, fields: Fields) -> ResultStore<()> {
        let url = self.document(path)?;
        self.send(self.request(Method::PUT, url).json(&fields)).await?;
        Ok(())
    }

    async fn create(&self, user_id: &str, collection: &str, fields: Fields) -> ResultStore<String> {
        let url = self.endpoint(&["users", user_id, collection])?;
        let res = self
            .send(self.request(Method::POST, url).json(&fields))
            .await?;
        let created = res.json::<CreatedResponse>().await.map_err(transport)?;
        Ok(created.id)
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> ResultStore<()> {
        let url = self.document(path)?;
        self.send(self.request(Method::PATCH, url).json(&fields)).await?;
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> ResultStore<()> {
        let url = self.document(path)?;
        match self.send(self.request(Method::DELETE, url)).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn commit(&self, batch: WriteBatch) -> ResultStore<()> {
        let url = self.endpoint(&["batch:commit"])?;
        self.send(self.request(Method::POST, url).json(&batch)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> HttpStore {
        HttpStore::new(base, None, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn endpoints_nest_under_the_base_path() {
        let store = store("http://localhost:8080/api/");
        let url = store
            .document(&DocPath::new("alice", "expenses", "e1"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/users/alice/expenses/e1"
        );

        let url = store.endpoint(&["batch:commit"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/batch:commit");
    }

    #[test]
    fn path_segments_are_escaped() {
        let store = store("http://localhost:8080");
        let url = store
            .document(&DocPath::new("a/b", "expenses", "x y"))
            .unwrap();
        assert_eq!(url.path(), "/users/a%2Fb/expenses/x%20y");
    }

    #[test]
    fn statuses_map_to_store_errors() {
        let body = || "boom".to_string();
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED, body()),
            StoreError::PermissionDenied
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, body()),
            StoreError::PermissionDenied
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, body()),
            StoreError::NotFound("boom".to_string())
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, body()),
            StoreError::Conflict("boom".to_string())
        );
        assert_eq!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, body()),
            StoreError::Invalid("boom".to_string())
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, body()),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(HttpStore::new("not a url", None, Duration::from_secs(1)).is_err());
        assert!(HttpStore::new("mailto:me@example.com", None, Duration::from_secs(1)).is_err());
    }
}
