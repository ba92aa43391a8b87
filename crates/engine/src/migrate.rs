//! Bulk copy of one user's expenses into another user's collection.
//!
//! The copy keeps every field, including the original `date`, but stamps
//! fresh `createdAt`/`updatedAt` instants. It is not idempotent: running it
//! twice copies every record twice.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    EngineError, ResultEngine,
    record::{CREATED_AT, EXPENSES_COLLECTION, UPDATED_AT},
    store::{DOCUMENT_ID_FIELD, Direction, Query, RemoteStore, Value, WriteBatch},
};

const READ_PAGE_SIZE: usize = 200;

/// Upper bound of writes per committed batch.
pub const MAX_BATCH_WRITES: usize = 500;

/// Copies all expenses of `from_user` into `to_user` and returns how many
/// records were written.
///
/// Each batch of up to [`MAX_BATCH_WRITES`] records is atomic; a failure
/// after the first batch leaves the earlier batches in place.
pub async fn copy_expenses<S: RemoteStore>(
    store: &S,
    from_user: &str,
    to_user: &str,
    now: DateTime<Utc>,
) -> ResultEngine<usize> {
    if from_user.trim().is_empty() || to_user.trim().is_empty() {
        return Err(EngineError::InvalidArgument(
            "source and target user ids are required".to_string(),
        ));
    }

    let mut batches: Vec<WriteBatch> = vec![WriteBatch::default()];
    let mut cursor = None;
    loop {
        let query = Query::collection(EXPENSES_COLLECTION)
            .order_by(DOCUMENT_ID_FIELD, Direction::Ascending)
            .limit(READ_PAGE_SIZE)
            .start_after(cursor.take());
        let page = store.query(from_user, &query).await?;
        let received = page.records.len();

        for record in page.records {
            let mut fields = record.fields;
            fields.insert(CREATED_AT.to_string(), Value::from(now));
            fields.insert(UPDATED_AT.to_string(), Value::from(now));

            if batches.last().is_some_and(|b| b.len() >= MAX_BATCH_WRITES) {
                batches.push(WriteBatch::default());
            }
            if let Some(batch) = batches.last_mut() {
                batch.create(to_user, EXPENSES_COLLECTION, fields);
            }
        }

        if received < READ_PAGE_SIZE || page.cursor.is_none() {
            break;
        }
        cursor = page.cursor;
    }

    let mut copied = 0;
    for batch in batches.into_iter().filter(|b| !b.is_empty()) {
        let size = batch.len();
        store.commit(batch).await?;
        copied += size;
    }

    info!(from_user, to_user, copied, "expenses copied");
    Ok(copied)
}
