//! Expiry of receipts that were never anchored

use chrono::{DateTime, Utc};
use notary_core::ReceiptMode;
use notary_persist::{AttestationStore, StorageError};
use tracing::{debug, info};

/// Move pending/confirmed receipts past `expires_at` to `expired` and drop
/// their anchor jobs. Returns the ids that were expired.
pub async fn expire_overdue(
    store: &AttestationStore,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StorageError> {
    let candidates = store
        .receipts_in_modes(&[ReceiptMode::Pending, ReceiptMode::Confirmed])
        .await?;

    let mut expired = Vec::new();
    for candidate in candidates {
        if !candidate.is_expired_at(now) {
            continue;
        }
        // re-read: an anchor may have landed since the listing
        let Some(mut record) = store.get(&candidate.id).await? else {
            continue;
        };
        if !record.is_expired_at(now) || record.transition(ReceiptMode::Expired).is_err() {
            continue;
        }
        store.put_record(&record).await?;
        let dropped = store.delete_jobs_for_receipt(&record.id).await?;
        debug!(receipt_id = %record.id, jobs_dropped = dropped, "Receipt expired");
        expired.push(record.id);
    }

    if !expired.is_empty() {
        info!(count = expired.len(), "Expired overdue receipts");
    }
    Ok(expired)
}
