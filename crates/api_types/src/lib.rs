use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod expense {
    use super::*;

    /// A validated expense owned by exactly one user.
    ///
    /// Values of this type only come out of record validation (or the
    /// in-place overlay of a confirmed update), never straight from the wire.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Expense {
        pub id: String,
        pub user_id: String,
        /// Currency-agnostic magnitude, finite and `>= 0`.
        pub amount: f64,
        pub date: DateTime<Utc>,
        /// Key of a category in the user's category set.
        pub category: String,
        pub description: String,
        pub tags: Vec<String>,
        /// Free text; empty when unknown.
        pub location: String,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl Expense {
        /// Overlays the fields present in `patch` and stamps `updated_at`.
        ///
        /// Fields absent from the patch keep their current local value.
        pub fn apply_patch(&mut self, patch: &ExpensePatch, updated_at: DateTime<Utc>) {
            if let Some(amount) = patch.amount {
                self.amount = amount;
            }
            if let Some(date) = patch.date {
                self.date = date;
            }
            if let Some(category) = &patch.category {
                self.category = category.clone();
            }
            if let Some(description) = &patch.description {
                self.description = description.clone();
            }
            if let Some(tags) = &patch.tags {
                self.tags = tags.clone();
            }
            if let Some(location) = &patch.location {
                self.location = location.clone();
            }
            self.updated_at = updated_at;
        }
    }

    /// Payload of a user-initiated add.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct NewExpense {
        pub amount: f64,
        pub date: DateTime<Utc>,
        pub category: String,
        #[serde(default)]
        pub description: String,
        #[serde(default)]
        pub tags: Vec<String>,
        #[serde(default)]
        pub location: String,
    }

    /// Partial update: `None` means "leave as is".
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ExpensePatch {
        pub amount: Option<f64>,
        pub date: Option<DateTime<Utc>>,
        pub category: Option<String>,
        pub description: Option<String>,
        pub tags: Option<Vec<String>>,
        pub location: Option<String>,
    }

    impl ExpensePatch {
        pub fn is_empty(&self) -> bool {
            self.amount.is_none()
                && self.date.is_none()
                && self.category.is_none()
                && self.description.is_none()
                && self.tags.is_none()
                && self.location.is_none()
        }
    }
}

pub mod category {
    use super::*;

    /// A category as stored in the user's category document.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Category {
        /// Machine key, unique within a category set.
        pub value: String,
        pub label: String,
    }

    impl Category {
        pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
            Self {
                value: value.into(),
                label: label.into(),
            }
        }
    }

    /// A category projected for display.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CategoryView {
        pub value: String,
        pub label: String,
        /// Hex RGB color, e.g. `#4CAF50`.
        pub color: String,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::expense::{Expense, ExpensePatch};
    use super::*;

    fn sample() -> Expense {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Expense {
            id: "e1".to_string(),
            user_id: "alice".to_string(),
            amount: 12.5,
            date: at,
            category: "food".to_string(),
            description: "lunch".to_string(),
            tags: vec!["work".to_string()],
            location: "Milano".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn patch_overlays_only_present_fields() {
        let mut expense = sample();
        let later = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
        let patch = ExpensePatch {
            amount: Some(20.0),
            ..Default::default()
        };

        expense.apply_patch(&patch, later);

        let mut expected = sample();
        expected.amount = 20.0;
        expected.updated_at = later;
        assert_eq!(expense, expected);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ExpensePatch::default().is_empty());
        let patch = ExpensePatch {
            tags: Some(vec![]),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn expense_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
