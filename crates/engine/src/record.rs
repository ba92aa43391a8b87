//! Conversion between remote documents and [`Expense`]s.
//!
//! [`validate_expense`] is the single ingress point for untrusted expense
//! data. Each field is coerced on its own, so one malformed field never costs
//! the whole record; a record is only rejected when it still fails the
//! structural check after coercion. Rejected records are dropped from the
//! page they came in, never reported as a page error.

use api_types::expense::{Expense, ExpensePatch, NewExpense};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    categories::{CategorySet, FALLBACK_CATEGORY},
    store::{Fields, RawRecord, Value},
};

/// Collection holding a user's expenses.
pub const EXPENSES_COLLECTION: &str = "expenses";

pub const AMOUNT: &str = "amount";
pub const DATE: &str = "date";
pub const CATEGORY: &str = "category";
pub const DESCRIPTION: &str = "description";
pub const TAGS: &str = "tags";
pub const LOCATION: &str = "location";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

/// Turns a raw record into an [`Expense`] owned by `user_id`.
///
/// The owner always comes from the caller, never from the record. Fields
/// that are missing or of the wrong type fall back to their defaults:
///
/// | field | default |
/// |---|---|
/// | `amount` | `0` (also for non-finite numbers) |
/// | `date`, `createdAt`, `updatedAt` | `now` |
/// | `category` | [`FALLBACK_CATEGORY`] when not in `categories` |
/// | `description`, `location` | empty string |
/// | `tags` | empty; non-string elements are dropped |
///
/// Returns `None` when the coerced record has no id, no owner, or a negative
/// amount.
pub fn validate_expense(
    raw: &RawRecord,
    user_id: &str,
    categories: &CategorySet,
    now: DateTime<Utc>,
) -> Option<Expense> {
    let fields = &raw.fields;

    let expense = Expense {
        id: raw.id.clone(),
        user_id: user_id.to_string(),
        amount: coerce_amount(fields.get(AMOUNT)),
        date: coerce_instant(fields.get(DATE), now),
        category: coerce_category(fields.get(CATEGORY), categories),
        description: coerce_text(fields.get(DESCRIPTION)),
        tags: coerce_tags(fields.get(TAGS)),
        location: coerce_text(fields.get(LOCATION)),
        created_at: coerce_instant(fields.get(CREATED_AT), now),
        updated_at: coerce_instant(fields.get(UPDATED_AT), now),
    };

    if !is_well_formed(&expense) {
        debug!(id = %raw.id, "dropping malformed expense record");
        return None;
    }
    Some(expense)
}

/// Validator bound to one owner and category set, in the shape the query
/// binder expects.
pub fn expense_transform(
    user_id: &str,
    categories: CategorySet,
) -> impl Fn(RawRecord) -> Option<Expense> + Send + Sync + 'static {
    let user_id = user_id.to_string();
    move |raw| validate_expense(&raw, &user_id, &categories, Utc::now())
}

/// Like [`expense_transform`], but reads the category set from `categories`
/// on every record instead of fixing it at bind time.
pub fn expense_transform_following(
    user_id: &str,
    categories: watch::Receiver<CategorySet>,
) -> impl Fn(RawRecord) -> Option<Expense> + Send + Sync + 'static {
    let user_id = user_id.to_string();
    move |raw| validate_expense(&raw, &user_id, &categories.borrow(), Utc::now())
}

fn coerce_amount(value: Option<&Value>) -> f64 {
    value
        .and_then(Value::as_f64)
        .filter(|amount| amount.is_finite())
        .unwrap_or(0.0)
}

fn coerce_instant(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    value
        .and_then(Value::as_timestamp)
        .and_then(|ts| ts.to_datetime())
        .unwrap_or(now)
}

fn coerce_category(value: Option<&Value>, categories: &CategorySet) -> String {
    match value.and_then(Value::as_str) {
        Some(key) if categories.contains(key) => key.to_string(),
        _ => FALLBACK_CATEGORY.to_string(),
    }
}

fn coerce_text(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn coerce_tags(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_well_formed(expense: &Expense) -> bool {
    !expense.id.trim().is_empty()
        && !expense.user_id.trim().is_empty()
        && expense.amount.is_finite()
        && expense.amount >= 0.0
        && !expense.category.is_empty()
}

/// Document written by a user-initiated add.
pub fn new_expense_fields(payload: &NewExpense, now: DateTime<Utc>) -> Fields {
    let mut fields = Fields::new();
    fields.insert(AMOUNT.to_string(), Value::from(payload.amount));
    fields.insert(DATE.to_string(), Value::from(payload.date));
    fields.insert(CATEGORY.to_string(), Value::from(payload.category.as_str()));
    fields.insert(
        DESCRIPTION.to_string(),
        Value::from(payload.description.as_str()),
    );
    fields.insert(TAGS.to_string(), tags_value(&payload.tags));
    fields.insert(LOCATION.to_string(), Value::from(payload.location.as_str()));
    fields.insert(CREATED_AT.to_string(), Value::from(now));
    fields.insert(UPDATED_AT.to_string(), Value::from(now));
    fields
}

/// Partial document for an update; only the fields set in `patch` plus
/// `updatedAt`.
pub fn patch_fields(patch: &ExpensePatch, now: DateTime<Utc>) -> Fields {
    let mut fields = Fields::new();
    if let Some(amount) = patch.amount {
        fields.insert(AMOUNT.to_string(), Value::from(amount));
    }
    if let Some(date) = patch.date {
        fields.insert(DATE.to_string(), Value::from(date));
    }
    if let Some(category) = &patch.category {
        fields.insert(CATEGORY.to_string(), Value::from(category.as_str()));
    }
    if let Some(description) = &patch.description {
        fields.insert(DESCRIPTION.to_string(), Value::from(description.as_str()));
    }
    if let Some(tags) = &patch.tags {
        fields.insert(TAGS.to_string(), tags_value(tags));
    }
    if let Some(location) = &patch.location {
        fields.insert(LOCATION.to_string(), Value::from(location.as_str()));
    }
    fields.insert(UPDATED_AT.to_string(), Value::from(now));
    fields
}

fn tags_value(tags: &[String]) -> Value {
    Value::Array(tags.iter().map(|tag| Value::from(tag.as_str())).collect())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn raw(id: &str, fields: Vec<(&str, Value)>) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        }
    }

    #[test]
    fn well_formed_record_keeps_every_field() {
        let date = Utc.with_ymd_and_hms(2024, 5, 20, 19, 45, 0).unwrap();
        let record = raw(
            "e1",
            vec![
                (AMOUNT, Value::Double(42.1)),
                (DATE, Value::from(date)),
                (CATEGORY, Value::from("housing")),
                (DESCRIPTION, Value::from("rent")),
                (TAGS, Value::Array(vec![Value::from("monthly")])),
                (LOCATION, Value::from("Torino")),
                (CREATED_AT, Value::from(date)),
                (UPDATED_AT, Value::from(date)),
            ],
        );

        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();

        assert_eq!(expense.id, "e1");
        assert_eq!(expense.user_id, "alice");
        assert_eq!(expense.amount, 42.1);
        assert_eq!(expense.date, date);
        assert_eq!(expense.category, "housing");
        assert_eq!(expense.description, "rent");
        assert_eq!(expense.tags, vec!["monthly".to_string()]);
        assert_eq!(expense.location, "Torino");
        assert_eq!(expense.created_at, date);
    }

    #[test]
    fn malformed_fields_fall_back_to_defaults() {
        let record = raw(
            "e2",
            vec![
                (AMOUNT, Value::from("12")),
                (DATE, Value::from("yesterday")),
                (CATEGORY, Value::from("crypto")),
                (DESCRIPTION, Value::Integer(3)),
                (
                    TAGS,
                    Value::Array(vec![Value::from("a"), Value::Integer(1), Value::from("b")]),
                ),
                (LOCATION, Value::Null),
            ],
        );

        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();

        assert_eq!(expense.amount, 0.0);
        assert_eq!(expense.date, now());
        assert_eq!(expense.created_at, now());
        assert_eq!(expense.updated_at, now());
        assert_eq!(expense.category, FALLBACK_CATEGORY);
        assert_eq!(expense.description, "");
        assert_eq!(expense.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(expense.location, "");
    }

    #[test]
    fn non_sequence_tags_become_empty() {
        let record = raw("e3", vec![(TAGS, Value::from("a,b"))]);
        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();
        assert!(expense.tags.is_empty());
    }

    #[test]
    fn every_amount_shape_yields_a_record() {
        let categories = CategorySet::defaults();
        let records = [
            raw(
                "a",
                vec![(AMOUNT, Value::Double(12.5)), (CATEGORY, Value::from("food"))],
            ),
            raw(
                "b",
                vec![(AMOUNT, Value::from("bad")), (CATEGORY, Value::from("food"))],
            ),
            raw(
                "c",
                vec![(AMOUNT, Value::Null), (CATEGORY, Value::from("other"))],
            ),
        ];

        let amounts: Vec<f64> = records
            .iter()
            .filter_map(|record| validate_expense(record, "alice", &categories, now()))
            .map(|expense| expense.amount)
            .collect();

        assert_eq!(amounts, vec![12.5, 0.0, 0.0]);
    }

    #[test]
    fn integer_amount_is_numeric() {
        let record = raw("e4", vec![(AMOUNT, Value::Integer(7))]);
        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();
        assert_eq!(expense.amount, 7.0);
    }

    #[test]
    fn non_finite_amount_becomes_zero() {
        let record = raw("e5", vec![(AMOUNT, Value::Double(f64::NAN))]);
        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();
        assert_eq!(expense.amount, 0.0);
    }

    #[test]
    fn missing_id_or_owner_is_rejected() {
        let categories = CategorySet::defaults();
        let record = raw("", vec![(AMOUNT, Value::Double(1.0))]);
        assert!(validate_expense(&record, "alice", &categories, now()).is_none());

        let record = raw("e6", vec![(AMOUNT, Value::Double(1.0))]);
        assert!(validate_expense(&record, "", &categories, now()).is_none());
    }

    #[test]
    fn negative_amount_is_rejected() {
        let record = raw("e7", vec![(AMOUNT, Value::Double(-3.0))]);
        assert!(validate_expense(&record, "alice", &CategorySet::defaults(), now()).is_none());
    }

    #[test]
    fn owner_comes_from_caller_not_record() {
        let record = raw("e8", vec![("userId", Value::from("mallory"))]);
        let expense = validate_expense(&record, "alice", &CategorySet::defaults(), now()).unwrap();
        assert_eq!(expense.user_id, "alice");
    }

    #[test]
    fn custom_category_is_kept_when_in_current_set() {
        let categories = CategorySet::defaults().with_added("Pets").unwrap();
        let record = raw("e9", vec![(CATEGORY, Value::from("pets"))]);
        let expense = validate_expense(&record, "alice", &categories, now()).unwrap();
        assert_eq!(expense.category, "pets");
    }

    #[test]
    fn patch_fields_carry_only_changes_and_update_stamp() {
        let patch = ExpensePatch {
            amount: Some(9.0),
            ..Default::default()
        };
        let fields = patch_fields(&patch, now());
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get(AMOUNT), Some(&Value::Double(9.0)));
        assert_eq!(fields.get(UPDATED_AT), Some(&Value::from(now())));
    }
}
