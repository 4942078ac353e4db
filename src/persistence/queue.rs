//! Durable mutation queue backed by `SQLite`.
//!
//! Every status change of a [`MutationRecord`] goes through a method on
//! [`MutationQueue`]; nothing else writes the `status` column. Each method
//! is a single transaction, so a crash never leaves an item half-moved.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::models::mutation::{MutationKind, MutationOp, MutationRecord, MutationStatus};
use crate::models::status::QueueSnapshot;
use crate::models::task::Identity;
use crate::sync::backoff::compute_backoff_delay;
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_ts};

/// Explicit resolution of a `Conflict` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Drop the local change; the server version stands.
    Discard,
    /// Send the change again as a fresh pending item.
    Retry,
}

/// Repository for queued mutations.
#[derive(Clone)]
pub struct MutationQueue {
    db: Arc<Database>,
    max_attempts: u32,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MutationRow {
    id: String,
    entity_type: String,
    entity_kind: String,
    entity_id: String,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    next_retry_at: Option<String>,
    resend: i64,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
}

impl MutationRow {
    fn into_record(self) -> Result<MutationRecord> {
        let op: MutationOp = serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Db(format!("invalid payload for {}: {e}", self.id)))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid metadata: {e}")))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|e| AppError::Db(format!("invalid attempts: {e}")))?;

        Ok(MutationRecord {
            entity_id: Identity::from_parts(&self.entity_kind, &self.entity_id)?,
            entity_type: self.entity_type,
            op,
            status: parse_status(&self.status)?,
            attempts,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at.as_deref().map(parse_ts).transpose()?,
            resend: self.resend != 0,
            metadata,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, entity_type, entity_kind, entity_id, payload, status, \
     attempts, last_error, next_retry_at, resend, metadata, created_at, updated_at \
     FROM mutation_queue";

fn parse_status(s: &str) -> Result<MutationStatus> {
    match s {
        "pending" => Ok(MutationStatus::Pending),
        "in_flight" => Ok(MutationStatus::InFlight),
        "synced" => Ok(MutationStatus::Synced),
        "failed" => Ok(MutationStatus::Failed),
        "conflict" => Ok(MutationStatus::Conflict),
        other => Err(AppError::Db(format!("invalid mutation status: {other}"))),
    }
}

/// Persisted spelling of a status.
#[must_use]
pub fn status_str(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "in_flight",
        MutationStatus::Synced => "synced",
        MutationStatus::Failed => "failed",
        MutationStatus::Conflict => "conflict",
    }
}

fn kind_str(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "create",
        MutationKind::Update => "update",
        MutationKind::Delete => "delete",
    }
}

impl MutationQueue {
    /// Create a queue over `db`; `max_attempts` bounds retries per item.
    #[must_use]
    pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Configured attempt cap.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Append a pending mutation, coalescing updates.
    ///
    /// A temporary `entity_id` that has already been resolved is rewritten
    /// to its permanent identity. An `Update` for an entity that already
    /// has a pending or in-flight `Update` merges into that item (new
    /// fields win); if that item is in flight it is flagged for resend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert or merge fails.
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &Identity,
        op: MutationOp,
        metadata: Option<serde_json::Value>,
    ) -> Result<MutationRecord> {
        let mut tx = self.db.begin().await?;
        let entity_id = resolve_alias_in(&mut tx, entity_type, entity_id).await?;

        if let MutationOp::Update(patch) = &op {
            let existing: Option<MutationRow> = sqlx::query_as(&format!(
                "{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_kind = ?2 AND entity_id = ?3 \
                 AND kind = 'update' AND status IN ('pending', 'in_flight') \
                 ORDER BY seq ASC LIMIT 1"
            ))
            .bind(entity_type)
            .bind(entity_id.kind_str())
            .bind(entity_id.value())
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let mut record = row.into_record()?;
                if let MutationOp::Update(current) = &mut record.op {
                    current.merge(patch.clone());
                }
                record.resend = record.resend || record.status == MutationStatus::InFlight;
                record.updated_at = Utc::now();

                sqlx::query(
                    "UPDATE mutation_queue SET payload = ?1, resend = ?2, updated_at = ?3 \
                     WHERE id = ?4",
                )
                .bind(serde_json::to_string(&record.op)?)
                .bind(i64::from(record.resend))
                .bind(format_ts(record.updated_at))
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                debug!(item_id = %record.id, entity_id = %record.entity_id, "update coalesced");
                return Ok(record);
            }
        }

        let record = MutationRecord::new(entity_type, entity_id, op, metadata);
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO mutation_queue (id, entity_type, entity_kind, entity_id, kind, payload,
             status, attempts, last_error, next_retry_at, resend, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, NULL, 0, ?8, ?9, ?10)",
        )
        .bind(&record.id)
        .bind(&record.entity_type)
        .bind(record.entity_id.kind_str())
        .bind(record.entity_id.value())
        .bind(kind_str(record.kind()))
        .bind(serde_json::to_string(&record.op)?)
        .bind(status_str(record.status))
        .bind(&metadata)
        .bind(format_ts(record.created_at))
        .bind(format_ts(record.updated_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(item_id = %record.id, entity_id = %record.entity_id, kind = ?record.kind(), "mutation enqueued");
        Ok(record)
    }

    /// Move up to `max` due items to `InFlight` and return them in FIFO order.
    ///
    /// At most one item per entity is returned: the entity's oldest
    /// non-terminal item, and only if it is pending and due. An entity whose
    /// head item is in flight or waiting on backoff blocks its later items.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or status update fails.
    pub async fn dequeue_next_batch(&self, max: usize) -> Result<Vec<MutationRecord>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let rows: Vec<MutationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'in_flight') ORDER BY seq ASC"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for row in rows {
            let record = row.into_record()?;
            if !seen.insert((record.entity_type.clone(), record.entity_id.clone())) {
                continue;
            }
            let due = record.next_retry_at.is_none_or(|at| at <= now);
            if record.status != MutationStatus::Pending || !due {
                continue;
            }

            let claimed = sqlx::query(
                "UPDATE mutation_queue SET status = 'in_flight', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
            )
            .bind(format_ts(now))
            .bind(&record.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed == 1 {
                batch.push(MutationRecord {
                    status: MutationStatus::InFlight,
                    updated_at: now,
                    ..record
                });
                if batch.len() == max {
                    break;
                }
            }
        }
        tx.commit().await?;

        Ok(batch)
    }

    /// Record a successful send.
    ///
    /// Returns `false` when the payload changed while in flight: the item
    /// goes back to `Pending` so the merged fields are sent too.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown item,
    /// `AppError::InvalidTransition` if the item is not in flight.
    pub async fn mark_synced(&self, item_id: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let synced = mark_synced_in(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(synced)
    }

    /// Record a successful `Create` and retire its temporary identity.
    ///
    /// In one transaction: marks the item synced, records the
    /// `temporary → permanent` alias, and rewrites every other item that
    /// still addresses the temporary identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the item is not an in-flight
    /// `Create` on a temporary identity.
    pub async fn complete_create(&self, item_id: &str, permanent: &Identity) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let record = fetch_in(&mut tx, item_id).await?;
        if record.kind() != MutationKind::Create || !record.entity_id.is_temporary() {
            return Err(AppError::InvalidTransition(format!(
                "{item_id} is not a create on a temporary identity"
            )));
        }
        if permanent.is_temporary() {
            return Err(AppError::InvalidTransition(format!(
                "{item_id} acknowledged with a temporary identity"
            )));
        }

        mark_synced_in(&mut tx, item_id).await?;

        let now = format_ts(Utc::now());
        sqlx::query(
            "INSERT OR REPLACE INTO identity_alias (entity_type, temporary_id, permanent_id, resolved_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.entity_type)
        .bind(record.entity_id.value())
        .bind(permanent.value())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let rewritten = sqlx::query(
            "UPDATE mutation_queue SET entity_kind = 'permanent', entity_id = ?1, updated_at = ?2 \
             WHERE entity_type = ?3 AND entity_kind = 'temporary' AND entity_id = ?4 AND id != ?5",
        )
        .bind(permanent.value())
        .bind(&now)
        .bind(&record.entity_type)
        .bind(record.entity_id.value())
        .bind(item_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        info!(
            item_id,
            temporary = %record.entity_id,
            permanent = %permanent,
            rewritten,
            "temporary identity resolved"
        );
        Ok(())
    }

    /// Record a failed send: requeue with backoff, or finalize as `Failed`.
    ///
    /// Returns the resulting status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown item,
    /// `AppError::InvalidTransition` if the item is not in flight.
    pub async fn mark_failed(&self, item_id: &str, error: &str) -> Result<MutationStatus> {
        let mut tx = self.db.begin().await?;
        let record = fetch_in(&mut tx, item_id).await?;
        ensure_in_flight(&record)?;

        let attempts = record.attempts.saturating_add(1);
        let now = Utc::now();
        let (status, next_retry_at) = if attempts >= self.max_attempts {
            (MutationStatus::Failed, None)
        } else {
            let delay = compute_backoff_delay(i64::from(attempts));
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
            (MutationStatus::Pending, Some(now + delay))
        };

        sqlx::query(
            "UPDATE mutation_queue SET status = ?1, attempts = ?2, last_error = ?3, \
             next_retry_at = ?4, resend = 0, updated_at = ?5 WHERE id = ?6",
        )
        .bind(status_str(status))
        .bind(i64::from(attempts))
        .bind(error)
        .bind(next_retry_at.map(format_ts))
        .bind(format_ts(now))
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if status == MutationStatus::Failed {
            warn!(item_id, attempts, error, "mutation failed permanently");
        } else {
            debug!(item_id, attempts, error, retry_at = ?next_retry_at, "mutation scheduled for retry");
        }
        Ok(status)
    }

    /// Record that the server rejected the item as conflicting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown item,
    /// `AppError::InvalidTransition` if the item is not in flight.
    pub async fn mark_conflict(&self, item_id: &str, reason: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let record = fetch_in(&mut tx, item_id).await?;
        ensure_in_flight(&record)?;

        sqlx::query(
            "UPDATE mutation_queue SET status = 'conflict', last_error = ?1, next_retry_at = NULL, \
             resend = 0, updated_at = ?2 WHERE id = ?3",
        )
        .bind(reason)
        .bind(format_ts(Utc::now()))
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(item_id, entity_id = %record.entity_id, reason, "mutation conflicted");
        Ok(())
    }

    /// Resolve a `Conflict` item by discarding or retrying it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the item is not in conflict.
    pub async fn resolve_conflict(&self, item_id: &str, resolution: ConflictResolution) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let record = fetch_in(&mut tx, item_id).await?;
        if record.status != MutationStatus::Conflict {
            return Err(AppError::InvalidTransition(format!(
                "{item_id} is {:?}, not in conflict",
                record.status
            )));
        }

        match resolution {
            ConflictResolution::Discard => {
                sqlx::query("DELETE FROM mutation_queue WHERE id = ?1")
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
            ConflictResolution::Retry => {
                sqlx::query(
                    "UPDATE mutation_queue SET status = 'pending', attempts = 0, last_error = NULL, \
                     next_retry_at = NULL, updated_at = ?1 WHERE id = ?2",
                )
                .bind(format_ts(Utc::now()))
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        info!(item_id, ?resolution, "conflict resolved");
        Ok(())
    }

    /// Reset every `Failed` item to `Pending` with a fresh attempt budget.
    ///
    /// Returns the number of items reset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn retry_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE mutation_queue SET status = 'pending', attempts = 0, last_error = NULL, \
             next_retry_at = NULL, updated_at = ?1 WHERE status = 'failed'",
        )
        .bind(format_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Return items left `InFlight` by a previous process to `Pending`.
    ///
    /// Attempt counts are not incremented: the send outcome is unknown and
    /// the transport is idempotent on the item id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE mutation_queue SET status = 'pending', updated_at = ?1 WHERE status = 'in_flight'",
        )
        .bind(format_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "interrupted in-flight mutations returned to pending");
        }
        Ok(recovered)
    }

    /// Aggregate counts by status plus the latest acknowledgement time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
                .fetch_all(self.db.as_ref())
                .await?;
        let last_synced: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT MAX(updated_at) FROM mutation_queue WHERE status = 'synced'",
        )
        .fetch_optional(self.db.as_ref())
        .await?;

        let mut snapshot = QueueSnapshot::default();
        for (status, count) in counts {
            let count = u64::try_from(count)
                .map_err(|e| AppError::Db(format!("invalid count: {e}")))?;
            snapshot.record(parse_status(&status)?, count);
        }
        snapshot.last_synced_at = last_synced
            .and_then(|(ts,)| ts)
            .as_deref()
            .map(parse_ts)
            .transpose()?;
        Ok(snapshot)
    }

    /// Retrieve a queue item by its ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, item_id: &str) -> Result<Option<MutationRecord>> {
        let row: Option<MutationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(item_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(MutationRow::into_record).transpose()
    }

    /// List items in FIFO order, optionally restricted to one status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, status: Option<MutationStatus>) -> Result<Vec<MutationRecord>> {
        let rows: Vec<MutationRow> = if let Some(status) = status {
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY seq ASC"))
                .bind(status_str(status))
                .fetch_all(self.db.as_ref())
                .await?
        } else {
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))
                .fetch_all(self.db.as_ref())
                .await?
        };
        rows.into_iter().map(MutationRow::into_record).collect()
    }

    /// All items addressing an entity, after alias resolution, in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn items_for_entity(
        &self,
        entity_type: &str,
        entity_id: &Identity,
    ) -> Result<Vec<MutationRecord>> {
        let entity_id = self.resolve_alias(entity_type, entity_id).await?;
        let rows: Vec<MutationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_kind = ?2 AND entity_id = ?3 \
             ORDER BY seq ASC"
        ))
        .bind(entity_type)
        .bind(entity_id.kind_str())
        .bind(entity_id.value())
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(MutationRow::into_record).collect()
    }

    /// Permanent identity for a retired temporary one; otherwise unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn resolve_alias(&self, entity_type: &str, entity_id: &Identity) -> Result<Identity> {
        let mut conn = self.db.acquire().await?;
        lookup_alias(&mut *conn, entity_type, entity_id).await
    }

    /// Permanent identities assigned to creates acknowledged at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn resolved_since(
        &self,
        entity_type: &str,
        since: DateTime<Utc>,
    ) -> Result<HashSet<Identity>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT permanent_id FROM identity_alias WHERE entity_type = ?1 AND resolved_at >= ?2",
        )
        .bind(entity_type)
        .bind(format_ts(since))
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(id,)| Identity::Permanent(id)).collect())
    }

    /// Delete all `Synced` items.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_synced(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE status = 'synced'")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete `Synced` items acknowledged before `before`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_synced_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM mutation_queue WHERE status = 'synced' AND updated_at < ?1")
                .bind(format_ts(before))
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }

    /// Delete every item, including unsynced work. User-invoked only.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mutation_queue")
            .execute(self.db.as_ref())
            .await?;
        let cleared = result.rows_affected();
        warn!(cleared, "mutation queue cleared");
        Ok(cleared)
    }
}

async fn fetch_in(tx: &mut Transaction<'_, Sqlite>, item_id: &str) -> Result<MutationRecord> {
    let row: Option<MutationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
        .bind(item_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(MutationRow::into_record)
        .transpose()?
        .ok_or_else(|| AppError::NotFound(format!("queue item {item_id}")))
}

fn ensure_in_flight(record: &MutationRecord) -> Result<()> {
    if record.status == MutationStatus::InFlight {
        Ok(())
    } else {
        Err(AppError::InvalidTransition(format!(
            "{} is {:?}, not in flight",
            record.id, record.status
        )))
    }
}

async fn mark_synced_in(tx: &mut Transaction<'_, Sqlite>, item_id: &str) -> Result<bool> {
    let record = fetch_in(tx, item_id).await?;
    ensure_in_flight(&record)?;

    let now = format_ts(Utc::now());
    if record.resend {
        sqlx::query(
            "UPDATE mutation_queue SET status = 'pending', resend = 0, attempts = 0, \
             last_error = NULL, next_retry_at = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(&now)
        .bind(item_id)
        .execute(&mut **tx)
        .await?;
        debug!(item_id, "payload changed in flight; requeued");
        return Ok(false);
    }

    sqlx::query(
        "UPDATE mutation_queue SET status = 'synced', last_error = NULL, next_retry_at = NULL, \
         updated_at = ?1 WHERE id = ?2",
    )
    .bind(&now)
    .bind(item_id)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

async fn resolve_alias_in(
    tx: &mut Transaction<'_, Sqlite>,
    entity_type: &str,
    entity_id: &Identity,
) -> Result<Identity> {
    lookup_alias(&mut **tx, entity_type, entity_id).await
}

async fn lookup_alias(
    conn: &mut sqlx::SqliteConnection,
    entity_type: &str,
    entity_id: &Identity,
) -> Result<Identity> {
    if !entity_id.is_temporary() {
        return Ok(entity_id.clone());
    }

    let permanent: Option<(String,)> = sqlx::query_as(
        "SELECT permanent_id FROM identity_alias WHERE entity_type = ?1 AND temporary_id = ?2",
    )
    .bind(entity_type)
    .bind(entity_id.value())
    .fetch_optional(conn)
    .await?;

    Ok(permanent.map_or_else(|| entity_id.clone(), |(id,)| Identity::Permanent(id)))
}
