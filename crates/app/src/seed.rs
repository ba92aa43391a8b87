use api_types::expense::NewExpense;
use chrono::{DateTime, Duration, Utc};
use engine::{DocPath, MemoryStore, record};

/// User the in-memory store is seeded for when none is configured.
pub const SAMPLE_USER: &str = "demo";

const SAMPLES: &[(f64, &str, &str, &[&str], &str)] = &[
    (12.5, "food", "Lunch", &["work"], "Milano"),
    (48.0, "transportation", "Train tickets", &["trip"], "Milano Centrale"),
    (9.9, "entertainment", "Streaming", &["subscription"], ""),
    (72.3, "shopping", "Groceries", &[], "Esselunga"),
    (650.0, "housing", "Rent share", &["monthly"], ""),
    (31.0, "utilities", "Electricity", &["monthly", "bill"], ""),
    (18.0, "healthcare", "Pharmacy", &[], ""),
    (25.0, "personal", "Haircut", &[], "Via Torino"),
];

/// An in-memory store holding a handful of recent expenses for `user_id`.
pub fn sample_store(user_id: &str, now: DateTime<Utc>) -> MemoryStore {
    let store = MemoryStore::new();
    for (i, (amount, category, description, tags, location)) in SAMPLES.iter().enumerate() {
        let at = now - Duration::days(i as i64) - Duration::hours(2);
        let payload = NewExpense {
            amount: *amount,
            date: at,
            category: (*category).to_string(),
            description: (*description).to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            location: (*location).to_string(),
        };
        store.put_raw(
            &DocPath::new(user_id, record::EXPENSES_COLLECTION, format!("sample-{i:02}")),
            record::new_expense_fields(&payload, at),
        );
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_every_sample() {
        let store = sample_store(SAMPLE_USER, Utc::now());
        assert_eq!(
            store.len(SAMPLE_USER, record::EXPENSES_COLLECTION),
            SAMPLES.len()
        );
    }
}
