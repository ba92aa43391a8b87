//! Expense categories and their resolution across storage tiers.
//!
//! Categories are read from, in order of preference:
//!
//! 1. the user's category document in the remote store,
//! 2. the device-local cache,
//! 3. the compiled-in defaults.
//!
//! Tiers are kept loosely in sync: [`CategoryResolver::save`] writes remote
//! first, then mirrors into the local cache. Reads never write down, so the
//! local cache can lag behind the remote document until the next save.

use std::sync::Arc;

use api_types::category::{Category, CategoryView};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::{
    EngineError, ResultEngine,
    local_cache::LocalCache,
    store::{DocPath, Fields, RawRecord, RemoteStore, Value},
};

/// Key every unknown or missing category falls back to.
pub const FALLBACK_CATEGORY: &str = "other";

/// Local cache key of the serialized category sequence.
pub const CATEGORY_CACHE_KEY: &str = "expense-categories";

const SETTINGS_COLLECTION: &str = "settings";
const CATEGORY_DOCUMENT: &str = "categories";
const CATEGORIES_FIELD: &str = "categories";

const BUILT_IN: &[(&str, &str)] = &[
    ("food", "Food & Dining"),
    ("housing", "Housing"),
    ("transportation", "Transportation"),
    ("utilities", "Utilities"),
    ("healthcare", "Healthcare"),
    ("entertainment", "Entertainment"),
    ("shopping", "Shopping"),
    ("education", "Education"),
    ("personal", "Personal Care"),
    ("travel", "Travel"),
    (FALLBACK_CATEGORY, "Other"),
];

const COLORS: &[(&str, &str)] = &[
    ("food", "#FF6B6B"),
    ("housing", "#4ECDC4"),
    ("transportation", "#45B7D1"),
    ("utilities", "#96CEB4"),
    ("healthcare", "#FF8A65"),
    ("entertainment", "#BA68C8"),
    ("shopping", "#F06292"),
    ("education", "#7986CB"),
    ("personal", "#FFD54F"),
    ("travel", "#4DB6AC"),
];

const OTHER_COLOR: &str = "#A0A0A0";

/// Presentation color of a category key.
pub fn category_color(key: &str) -> &'static str {
    COLORS
        .iter()
        .find_map(|(value, color)| (*value == key).then_some(*color))
        .unwrap_or(OTHER_COLOR)
}

/// Ordered category sequence with unique keys.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CategorySet {
    categories: Vec<Category>,
}

impl CategorySet {
    /// Builds a set, keeping the first occurrence of a repeated key.
    pub fn new(categories: Vec<Category>) -> Self {
        let mut unique: Vec<Category> = Vec::with_capacity(categories.len());
        for category in categories {
            if unique.iter().any(|c| c.value == category.value) {
                debug!(key = %category.value, "ignoring duplicate category key");
                continue;
            }
            unique.push(category);
        }
        Self { categories: unique }
    }

    pub fn defaults() -> Self {
        Self {
            categories: BUILT_IN
                .iter()
                .map(|(value, label)| Category::new(*value, *label))
                .collect(),
        }
    }

    pub fn is_built_in(key: &str) -> bool {
        BUILT_IN.iter().any(|(value, _)| *value == key)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn as_slice(&self) -> &[Category] {
        &self.categories
    }

    pub fn contains(&self, key: &str) -> bool {
        self.categories.iter().any(|c| c.value == key)
    }

    /// Label of `key`, or `key` itself when the set does not know it.
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        self.categories
            .iter()
            .find(|c| c.value == key)
            .map_or(key, |c| c.label.as_str())
    }

    pub fn display(&self) -> Vec<CategoryView> {
        self.categories
            .iter()
            .map(|c| CategoryView {
                value: c.value.clone(),
                label: c.label.clone(),
                color: category_color(&c.value).to_string(),
            })
            .collect()
    }

    /// Returns a copy with a new category whose key is derived from `label`.
    pub fn with_added(&self, label: &str) -> ResultEngine<Self> {
        let label = normalize_label(label)
            .ok_or_else(|| EngineError::InvalidArgument("category label is empty".to_string()))?;
        let key = category_key(&label).ok_or_else(|| {
            EngineError::InvalidArgument(format!("category '{label}' has no usable characters"))
        })?;
        if self.contains(&key) {
            return Err(EngineError::ExistingKey(key));
        }

        let mut categories = self.categories.clone();
        categories.push(Category::new(key, label));
        Ok(Self { categories })
    }

    /// Returns a copy without `key`. Built-in categories cannot be removed.
    pub fn without(&self, key: &str) -> ResultEngine<Self> {
        if Self::is_built_in(key) {
            return Err(EngineError::ProtectedCategory(key.to_string()));
        }
        if !self.contains(key) {
            return Err(EngineError::InvalidArgument(format!(
                "unknown category '{key}'"
            )));
        }
        Ok(Self {
            categories: self
                .categories
                .iter()
                .filter(|c| c.value != key)
                .cloned()
                .collect(),
        })
    }
}

impl From<CategorySet> for Vec<Category> {
    fn from(value: CategorySet) -> Self {
        value.categories
    }
}

fn normalize_label(input: &str) -> Option<String> {
    let mut out = String::new();
    for token in input.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Machine key for a label: accents folded, lowercase, words joined by `-`.
fn category_key(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in label.nfkd() {
        if is_combining_mark(ch) {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

fn category_document_path(user_id: &str) -> DocPath {
    DocPath::new(user_id, SETTINGS_COLLECTION, CATEGORY_DOCUMENT)
}

fn category_document(categories: &[Category]) -> Fields {
    let entries = categories
        .iter()
        .map(|c| {
            let mut entry = Fields::new();
            entry.insert("value".to_string(), Value::from(c.value.as_str()));
            entry.insert("label".to_string(), Value::from(c.label.as_str()));
            Value::Map(entry)
        })
        .collect();

    let mut fields = Fields::new();
    fields.insert(CATEGORIES_FIELD.to_string(), Value::Array(entries));
    fields
}

/// Reads the category sequence out of the remote document. Entries without a
/// string key are dropped; a missing label falls back to the key.
fn parse_category_document(raw: &RawRecord) -> Vec<Category> {
    let Some(entries) = raw.fields.get(CATEGORIES_FIELD).and_then(Value::as_array) else {
        debug!("category document has no category list");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let map = entry.as_map()?;
            let value = map.get("value").and_then(Value::as_str)?.trim();
            if value.is_empty() {
                return None;
            }
            let label = map
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or(value)
                .to_string();
            Some(Category::new(value, label))
        })
        .collect()
}

fn signed_in(user_id: Option<&str>) -> Option<&str> {
    user_id.map(str::trim).filter(|id| !id.is_empty())
}

/// Owns the category set currently in effect and the tiers it comes from.
///
/// Readers either take a [`current`](Self::current) copy on each access or
/// follow changes through [`watch`](Self::watch).
pub struct CategoryResolver<S, C> {
    store: Arc<S>,
    cache: C,
    current: watch::Sender<CategorySet>,
}

impl<S, C> CategoryResolver<S, C>
where
    S: RemoteStore,
    C: LocalCache,
{
    /// Starts from the local cache (or the defaults) without touching the
    /// remote store.
    pub fn new(store: Arc<S>, cache: C) -> Self {
        let (current, _) = watch::channel(CategorySet::default());
        let resolver = Self {
            store,
            cache,
            current,
        };
        resolver.current.send_replace(resolver.local_or_default());
        resolver
    }

    pub fn current(&self) -> CategorySet {
        self.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CategorySet> {
        self.current.subscribe()
    }

    /// Reads the user's remote category sequence.
    ///
    /// Returns an empty sequence when signed out or when the user never
    /// saved categories; callers decide whether to fall back to defaults.
    pub async fn load(&self, user_id: Option<&str>) -> ResultEngine<Vec<Category>> {
        let Some(user_id) = signed_in(user_id) else {
            warn!("loading categories without a signed-in user");
            return Ok(Vec::new());
        };
        Ok(self.fetch_remote(user_id).await?.unwrap_or_default())
    }

    /// Replaces the user's remote category sequence, then mirrors it locally.
    ///
    /// A remote failure leaves the local cache untouched.
    pub async fn save(&self, user_id: Option<&str>, categories: &[Category]) -> ResultEngine<()> {
        let Some(user_id) = signed_in(user_id) else {
            return Err(EngineError::InvalidArgument(
                "user id is required to save categories".to_string(),
            ));
        };

        self.store
            .set(
                &category_document_path(user_id),
                category_document(categories),
            )
            .await?;

        if let Err(err) = self.write_local(categories) {
            warn!("categories saved remotely but local mirror failed: {err}");
        }
        self.current
            .send_replace(CategorySet::new(categories.to_vec()));
        info!(user_id, count = categories.len(), "categories saved");
        Ok(())
    }

    /// Local cache, or the defaults when the cache is empty or unreadable.
    /// Never touches the remote store.
    pub fn local_or_default(&self) -> CategorySet {
        match self.read_local() {
            Ok(Some(categories)) => CategorySet::new(categories),
            Ok(None) => CategorySet::defaults(),
            Err(err) => {
                debug!("unreadable category cache: {err}");
                CategorySet::defaults()
            }
        }
    }

    /// Walks the tiers and publishes the result as the current set.
    ///
    /// An existing remote document wins even when it is empty. A missing
    /// document or a remote failure falls back to [`local_or_default`].
    ///
    /// [`local_or_default`]: Self::local_or_default
    pub async fn resolve(&self, user_id: Option<&str>) -> CategorySet {
        let resolved = match signed_in(user_id) {
            None => self.local_or_default(),
            Some(user_id) => match self.fetch_remote(user_id).await {
                Ok(Some(categories)) => CategorySet::new(categories),
                Ok(None) => self.local_or_default(),
                Err(err) => {
                    warn!("category lookup failed, using local tiers: {err}");
                    self.local_or_default()
                }
            },
        };
        self.current.send_replace(resolved.clone());
        resolved
    }

    /// Adds a category derived from `label` to the current set and saves.
    pub async fn add(&self, user_id: Option<&str>, label: &str) -> ResultEngine<CategorySet> {
        let updated = self.current().with_added(label)?;
        self.save(user_id, updated.as_slice()).await?;
        Ok(updated)
    }

    /// Removes a custom category from the current set and saves.
    pub async fn remove(&self, user_id: Option<&str>, key: &str) -> ResultEngine<CategorySet> {
        let updated = self.current().without(key)?;
        self.save(user_id, updated.as_slice()).await?;
        Ok(updated)
    }

    async fn fetch_remote(&self, user_id: &str) -> ResultEngine<Option<Vec<Category>>> {
        let document = self.store.get(&category_document_path(user_id)).await?;
        Ok(document.as_ref().map(parse_category_document))
    }

    fn read_local(&self) -> ResultEngine<Option<Vec<Category>>> {
        match self.cache.get(CATEGORY_CACHE_KEY)? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn write_local(&self, categories: &[Category]) -> ResultEngine<()> {
        let payload = serde_json::to_string(categories)?;
        self.cache.set(CATEGORY_CACHE_KEY, &payload)
    }
}
