//! Client-side synchronization core for expense tracking.
//!
//! The engine keeps local views of a user's data consistent with a remote
//! document store:
//!
//! - [`record`] validates untrusted remote documents into [`Expense`]s;
//! - [`CategoryResolver`] resolves the category set across the remote store,
//!   a device-local cache and compiled-in defaults;
//! - [`ExpenseController`] serves a paginated, mutable page of expenses;
//! - [`QueryBinder`] binds any query, once or live, to observable state.
//!
//! The store itself is abstracted by [`RemoteStore`]; [`MemoryStore`] is an
//! in-process implementation.
//!
//! [`Expense`]: api_types::expense::Expense

pub use categories::{
    CATEGORY_CACHE_KEY, CategoryResolver, CategorySet, FALLBACK_CATEGORY, category_color,
};
pub use error::{EngineError, StoreError};
pub use expenses::{DEFAULT_PAGE_SIZE, ExpenseController, PageState, Phase};
pub use local_cache::{FileCache, LocalCache, MemoryCache};
pub use memory::{Call, MemoryStore};
pub use migrate::{MAX_BATCH_WRITES, copy_expenses};
pub use query::{BindMode, QueryBinder, QueryState};
pub use store::{
    Cursor, Direction, DocPath, Fields, Query, QueryPage, RawRecord, RemoteStore, ResultStore,
    Snapshot, Subscription, Timestamp, Value, WriteBatch,
};

mod categories;
mod error;
mod expenses;
mod local_cache;
mod memory;
mod migrate;
mod query;
pub mod record;
pub mod store;

pub type ResultEngine<T> = Result<T, EngineError>;
