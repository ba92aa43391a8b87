//! Paginated, mutable view over a user's expenses.
//!
//! [`ExpenseController`] owns one page of validated expenses (newest first),
//! the cursor to fetch the next one and the loading/error flags, and keeps
//! that page consistent with the remote store across mutations:
//!
//! - **add** writes the record and then reloads the first page, so the new
//!   record shows up with its store-assigned id and normalized fields;
//! - **update** writes the partial fields and overlays them on the local
//!   record in place, without a refetch;
//! - **remove** deletes the record and drops it from the page, leaving the
//!   cursor and `has_more` alone.
//!
//! Local state only changes after the store confirmed the write.
//!
//! Fetch results carry the epoch they started in. [`refresh`], a user switch
//! or a newer first-page load bump the epoch, and results from older epochs
//! are discarded on arrival. Pages are not de-duplicated: if the collection
//! changes between two page loads, the next page may repeat or skip records.
//!
//! [`refresh`]: ExpenseController::refresh

use std::sync::Arc;

use api_types::expense::{Expense, ExpensePatch, NewExpense};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::{
    EngineError, ResultEngine,
    categories::CategorySet,
    query::{BindMode, QueryBinder},
    record::{
        CREATED_AT, EXPENSES_COLLECTION, expense_transform_following, new_expense_fields,
        patch_fields, validate_expense,
    },
    store::{Cursor, Direction, DocPath, Query, RawRecord, RemoteStore},
};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Coarse state of the page, for rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing fetched yet.
    Idle,
    Loading,
    WithData,
    Empty,
    Error,
}

/// Snapshot of the controller state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageState {
    pub user_id: Option<String>,
    /// Newest first, unique ids under a quiescent store.
    pub expenses: Vec<Expense>,
    pub cursor: Option<Cursor>,
    /// Whether the last page came back full. The store reports no totals.
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<String>,
    fetched: bool,
    epoch: u64,
}

impl PageState {
    pub fn phase(&self) -> Phase {
        if self.loading {
            Phase::Loading
        } else if self.error.is_some() {
            Phase::Error
        } else if !self.fetched {
            Phase::Idle
        } else if self.expenses.is_empty() {
            Phase::Empty
        } else {
            Phase::WithData
        }
    }
}

pub struct ExpenseController<S> {
    store: Arc<S>,
    page_size: usize,
    categories: watch::Receiver<CategorySet>,
    state: watch::Sender<PageState>,
    write_lock: Mutex<()>,
}

impl<S> ExpenseController<S>
where
    S: RemoteStore,
{
    /// Controller for `user_id` validating against the default categories.
    pub fn new(store: Arc<S>, user_id: Option<String>) -> Self {
        let (_, categories) = watch::channel(CategorySet::defaults());
        let (state, _) = watch::channel(PageState {
            user_id: user_id.filter(|id| !id.trim().is_empty()),
            ..Default::default()
        });
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
            categories,
            state,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Follow a category source, typically [`CategoryResolver::watch`].
    /// Later fetches validate against whatever set is current then.
    ///
    /// [`CategoryResolver::watch`]: crate::CategoryResolver::watch
    pub fn with_categories(mut self, categories: watch::Receiver<CategorySet>) -> Self {
        self.categories = categories;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn state(&self) -> PageState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PageState> {
        self.state.subscribe()
    }

    /// Loads the newest page from scratch.
    ///
    /// On failure the previous page, cursor and `has_more` stay as they were.
    /// A failure that arrives after a newer load started is dropped.
    pub async fn load_first_page(&self) -> ResultEngine<()> {
        let mut ticket = (0, None);
        self.state.send_modify(|s| {
            s.epoch += 1;
            s.loading = true;
            s.error = None;
            ticket = (s.epoch, s.user_id.clone());
        });
        let (epoch, user_id) = ticket;

        let Some(user_id) = user_id else {
            debug!("no user, expense page is empty");
            self.apply(epoch, |s| {
                s.expenses.clear();
                s.cursor = None;
                s.has_more = false;
                s.loading = false;
                s.fetched = true;
            });
            return Ok(());
        };

        match self.store.query(&user_id, &self.page_query(None)).await {
            Ok(page) => {
                let received = page.records.len();
                let expenses = self.validate_page(page.records, &user_id);
                let has_more = received == self.page_size;
                let applied = self.apply(epoch, |s| {
                    s.expenses = expenses;
                    s.cursor = page.cursor;
                    s.has_more = has_more;
                    s.loading = false;
                    s.fetched = true;
                });
                if applied {
                    info!(%user_id, received, has_more, "loaded first expense page");
                }
                Ok(())
            }
            Err(err) => {
                let err = EngineError::from(err);
                warn!(%user_id, "first page failed: {err}");
                let message = err.to_string();
                let applied = self.apply(epoch, |s| {
                    s.loading = false;
                    s.error = Some(message);
                });
                if applied { Err(err) } else { Ok(()) }
            }
        }
    }

    /// Appends the page after the cursor.
    ///
    /// Does nothing while a fetch is in flight, before the first page was
    /// loaded, or once a short page signalled the end.
    pub async fn load_next_page(&self) -> ResultEngine<()> {
        let mut ticket = None;
        self.state.send_if_modified(|s| {
            if s.loading || !s.has_more {
                return false;
            }
            let (Some(cursor), Some(user_id)) = (s.cursor.clone(), s.user_id.clone()) else {
                return false;
            };
            s.loading = true;
            s.error = None;
            ticket = Some((s.epoch, user_id, cursor));
            true
        });
        let Some((epoch, user_id, cursor)) = ticket else {
            debug!("next page not available");
            return Ok(());
        };

        match self
            .store
            .query(&user_id, &self.page_query(Some(cursor)))
            .await
        {
            Ok(page) => {
                let received = page.records.len();
                let expenses = self.validate_page(page.records, &user_id);
                let has_more = received == self.page_size;
                self.apply(epoch, |s| {
                    s.expenses.extend(expenses);
                    if page.cursor.is_some() {
                        s.cursor = page.cursor;
                    }
                    s.has_more = has_more;
                    s.loading = false;
                });
                debug!(%user_id, received, has_more, "loaded next expense page");
                Ok(())
            }
            Err(err) => {
                let err = EngineError::from(err);
                warn!(%user_id, "next page failed: {err}");
                let message = err.to_string();
                let applied = self.apply(epoch, |s| {
                    s.loading = false;
                    s.error = Some(message);
                });
                if applied { Err(err) } else { Ok(()) }
            }
        }
    }

    /// Creates an expense and reloads the first page. Returns the new id.
    ///
    /// A failed reload does not fail the add; it is reported through the
    /// page error.
    pub async fn add_expense(&self, payload: NewExpense) -> ResultEngine<String> {
        let id = {
            let _write = self.write_lock.lock().await;
            let user_id = self.require_user()?;
            if let Err(err) = self.check_new(&payload) {
                self.record_error(&user_id, &err);
                return Err(err);
            }

            let fields = new_expense_fields(&payload, Utc::now());
            match self
                .store
                .create(&user_id, EXPENSES_COLLECTION, fields)
                .await
            {
                Ok(id) => {
                    info!(%user_id, %id, "expense added");
                    id
                }
                Err(err) => {
                    let err = EngineError::from(err);
                    self.record_error(&user_id, &err);
                    return Err(err);
                }
            }
        };

        if let Err(err) = self.load_first_page().await {
            warn!("expense added but reload failed: {err}");
        }
        Ok(id)
    }

    /// Writes `patch` and overlays it on the local record with a fresh
    /// `updated_at`. A record no longer in the page is left alone.
    pub async fn update_expense(&self, id: &str, patch: ExpensePatch) -> ResultEngine<()> {
        let _write = self.write_lock.lock().await;
        let user_id = self.require_user()?;
        if let Err(err) = self.check_patch(id, &patch) {
            self.record_error(&user_id, &err);
            return Err(err);
        }

        let now = Utc::now();
        let path = DocPath::new(&user_id, EXPENSES_COLLECTION, id);
        if let Err(err) = self.store.update(&path, patch_fields(&patch, now)).await {
            let err = EngineError::from(err);
            self.record_error(&user_id, &err);
            return Err(err);
        }

        let applied = self.apply_for_user(&user_id, |s| {
            match s.expenses.iter_mut().find(|e| e.id == id) {
                Some(expense) => {
                    expense.apply_patch(&patch, now);
                    true
                }
                None => false,
            }
        });
        if !applied {
            debug!(%id, "updated expense is not in the current page");
        }
        info!(%user_id, %id, "expense updated");
        Ok(())
    }

    /// Deletes the record and drops it from the page.
    pub async fn remove_expense(&self, id: &str) -> ResultEngine<()> {
        let _write = self.write_lock.lock().await;
        let user_id = self.require_user()?;
        if id.trim().is_empty() {
            let err = EngineError::InvalidArgument("expense id is required".to_string());
            self.record_error(&user_id, &err);
            return Err(err);
        }

        let path = DocPath::new(&user_id, EXPENSES_COLLECTION, id);
        if let Err(err) = self.store.delete(&path).await {
            let err = EngineError::from(err);
            self.record_error(&user_id, &err);
            return Err(err);
        }

        let applied = self.apply_for_user(&user_id, |s| {
            let before = s.expenses.len();
            s.expenses.retain(|e| e.id != id);
            s.expenses.len() != before
        });
        if !applied {
            debug!(%id, "removed expense is not in the current page");
        }
        info!(%user_id, %id, "expense removed");
        Ok(())
    }

    /// Forgets everything and loads the first page again.
    pub async fn refresh(&self) -> ResultEngine<()> {
        self.state.send_modify(|s| {
            *s = PageState {
                user_id: s.user_id.take(),
                epoch: s.epoch + 1,
                ..Default::default()
            };
        });
        self.load_first_page().await
    }

    /// Resets the controller for another identity (or none) and loads its
    /// first page. Results still in flight for the previous user are dropped.
    pub async fn switch_user(&self, user_id: Option<String>) -> ResultEngine<()> {
        let user_id = user_id.filter(|id| !id.trim().is_empty());
        self.state.send_modify(|s| {
            *s = PageState {
                user_id,
                epoch: s.epoch + 1,
                ..Default::default()
            };
        });
        self.load_first_page().await
    }

    /// Live view of the newest page window.
    ///
    /// The returned binder owns the subscription; drop or release it when
    /// the view goes away. Each snapshot is validated against the category
    /// set current when it arrives.
    pub async fn watch_live(&self) -> QueryBinder<Expense> {
        let user_id = self.state.borrow().user_id.clone();
        let transform = expense_transform_following(
            user_id.as_deref().unwrap_or_default(),
            self.categories.clone(),
        );
        QueryBinder::bind(
            self.store.as_ref(),
            user_id.as_deref(),
            self.page_query(None),
            BindMode::Continuous,
            transform,
        )
        .await
    }

    fn page_query(&self, cursor: Option<Cursor>) -> Query {
        Query::collection(EXPENSES_COLLECTION)
            .order_by(CREATED_AT, Direction::Descending)
            .limit(self.page_size)
            .start_after(cursor)
    }

    fn validate_page(&self, records: Vec<RawRecord>, user_id: &str) -> Vec<Expense> {
        let categories = self.categories.borrow().clone();
        let now: DateTime<Utc> = Utc::now();
        records
            .iter()
            .filter_map(|raw| validate_expense(raw, user_id, &categories, now))
            .collect()
    }

    fn require_user(&self) -> ResultEngine<String> {
        let user_id = self.state.borrow().user_id.clone();
        user_id.ok_or_else(|| {
            let err = EngineError::InvalidArgument("no signed-in user".to_string());
            self.state.send_modify(|s| s.error = Some(err.to_string()));
            err
        })
    }

    /// Applies `f` only if no newer epoch started since the fetch began.
    fn apply(&self, epoch: u64, f: impl FnOnce(&mut PageState)) -> bool {
        self.state.send_if_modified(|s| {
            if s.epoch != epoch {
                debug!(epoch, current = s.epoch, "discarding stale page result");
                return false;
            }
            f(s);
            true
        })
    }

    /// Applies `f` only if the page still belongs to `user_id`.
    fn apply_for_user(&self, user_id: &str, f: impl FnOnce(&mut PageState) -> bool) -> bool {
        self.state.send_if_modified(|s| {
            if s.user_id.as_deref() != Some(user_id) {
                return false;
            }
            f(s)
        })
    }

    fn record_error(&self, user_id: &str, err: &EngineError) {
        let message = err.to_string();
        self.apply_for_user(user_id, |s| {
            s.error = Some(message);
            true
        });
    }

    /// Written categories must belong to the current set.
    fn check_category(&self, category: &str) -> ResultEngine<()> {
        if category.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "category is required".to_string(),
            ));
        }
        if !self.categories.borrow().contains(category) {
            return Err(EngineError::InvalidArgument(format!(
                "unknown category '{category}'"
            )));
        }
        Ok(())
    }

    fn check_new(&self, payload: &NewExpense) -> ResultEngine<()> {
        check_amount(payload.amount)?;
        self.check_category(&payload.category)
    }

    fn check_patch(&self, id: &str, patch: &ExpensePatch) -> ResultEngine<()> {
        if id.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "expense id is required".to_string(),
            ));
        }
        if patch.is_empty() {
            return Err(EngineError::InvalidArgument(
                "update has no fields".to_string(),
            ));
        }
        if let Some(amount) = patch.amount {
            check_amount(amount)?;
        }
        if let Some(category) = &patch.category {
            self.check_category(category)?;
        }
        Ok(())
    }
}

fn check_amount(amount: f64) -> ResultEngine<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidArgument(format!(
            "amount must be a positive number, got {amount}"
        )));
    }
    Ok(())
}
