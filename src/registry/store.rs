// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed registry store.
//!
//! One row per `(resource_type, resource_id)`. All writes go through
//! [`RegistryStore::update`], a compare-and-set loop on `lock_version`, so the
//! log cursor, the scheduler and job workers can race on the same row without
//! losing updates. Each committed write publishes a [`ResourceChange`].

use super::state::{ResourceKey, ResourceType, ResyncFlags, SubResource, SyncState};
use crate::db::{execute_with_retry, now_millis};
use crate::error::{ReplicationError, Result};
use crate::external::ResourceRoute;
use crate::node::SelectiveSync;
use crate::notify::{ChangeBus, ResourceChange};
use crate::resilience::RetryConfig;
use crate::selective_sync::in_scope;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Compare-and-set attempts before giving up with `Conflict`.
const CAS_MAX_ATTEMPTS: u32 = 8;

const SELECT_COLUMNS: &str = "resource_type, resource_id, shard, path, namespace_id, state, \
    resync_repository, resync_wiki, resync_attachments, resync_generation, checksum, \
    retry_count, retry_at, last_failure, last_event_id, last_synced_at, verified_at, \
    created_at, updated_at, lock_version";

/// Replication state of one resource, as seen by the status interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryRecord {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub shard: String,
    pub path: String,
    pub namespace_id: Option<i64>,
    pub state: SyncState,
    pub resync: ResyncFlags,
    /// Bumped every time a resync flag is raised. A sync only clears flags
    /// if no new request arrived while it ran.
    pub resync_generation: i64,
    pub checksum: Option<String>,
    pub retry_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    /// Highest event id applied to this row.
    pub last_event_id: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub lock_version: i64,
}

/// Outcome of [`RegistryStore::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This call's write moved the row.
    Won(RegistryRecord),
    /// Another writer got there first.
    Lost,
    /// The row no longer exists.
    Gone,
}

impl RegistryRecord {
    /// Whether `event_id` was already applied to this row.
    pub fn has_applied(&self, event_id: i64) -> bool {
        event_id <= self.last_event_id
    }

    /// Remember that `event_id` has been applied.
    pub fn note_event(&mut self, event_id: i64) {
        self.last_event_id = self.last_event_id.max(event_id);
    }

    /// Raise resync flags and queue the row for sync.
    ///
    /// A row already `started` keeps its state; the raised generation makes
    /// the running job leave the flags set so the next sweep picks it up.
    /// Resets the retry counter: an upstream change restarts a stuck row.
    pub fn request_resync(&mut self, flags: ResyncFlags) {
        self.resync = self.resync.union(flags);
        self.resync_generation += 1;
        self.retry_count = 0;
        self.retry_at = None;
        if self.state != SyncState::Started {
            self.state = SyncState::Pending;
        }
    }

    /// Move the row into `pending` without raising flags.
    pub fn mark_pending(&mut self) {
        if self.state != SyncState::Started {
            self.state = SyncState::Pending;
        }
    }

    /// A sync job was handed to the job processor.
    pub fn mark_started(&mut self) -> Result<()> {
        if !self.state.can_transition_to(SyncState::Started) {
            return Err(self.invalid(SyncState::Started));
        }
        self.state = SyncState::Started;
        Ok(())
    }

    /// A sync of `targets` completed.
    ///
    /// `generation` is the row's `resync_generation` when the job was
    /// dispatched. Flags raised after that stay set.
    pub fn mark_synced(&mut self, targets: ResyncFlags, generation: i64) {
        if generation >= self.resync_generation {
            self.resync.clear_synced(targets);
        }
        self.last_synced_at = Some(Utc::now());
        if self.state == SyncState::Started {
            self.state = SyncState::Synced;
            self.retry_count = 0;
            self.retry_at = None;
            self.last_failure = None;
        }
    }

    /// A sync attempt failed. Schedules the next attempt with backoff.
    pub fn mark_failed(&mut self, error: &str, retry: &RetryConfig) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_failure = Some(error.to_string());
        let delay = retry.delay_for_attempt(self.retry_count as usize);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.retry_at = Utc::now().checked_add_signed(delay);
        if self.state == SyncState::Started {
            self.state = SyncState::Failed;
        }
    }

    /// Forget the stored checksum and queue a verification.
    pub fn reset_checksum(&mut self) {
        self.checksum = None;
        self.verified_at = None;
        self.state = SyncState::VerificationPending;
    }

    /// Queue a verification, keeping the stored checksum.
    pub fn request_verification(&mut self) {
        self.state = SyncState::VerificationPending;
    }

    /// A verification could not run. Counted on the row like a failed sync;
    /// the row stays `verification_pending` for the next sweep.
    pub fn verification_attempt_failed(&mut self, error: &str) {
        if self.state != SyncState::VerificationPending {
            return;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_failure = Some(error.to_string());
    }

    /// Record a verification outcome.
    ///
    /// Ignored if the row left `verification_pending` while the job ran.
    /// A mismatch raises the repository resync flag.
    pub fn verification_result(&mut self, local_checksum: Option<String>, matches: bool) {
        if self.state != SyncState::VerificationPending {
            return;
        }
        self.verified_at = Some(Utc::now());
        if matches {
            self.state = SyncState::VerificationSucceeded;
            self.checksum = local_checksum;
            self.retry_count = 0;
            self.last_failure = None;
        } else {
            self.state = SyncState::VerificationFailed;
            self.checksum = None;
            self.last_failure = Some(format!(
                "checksum mismatch (local {})",
                local_checksum.as_deref().unwrap_or("none")
            ));
            self.resync.set(SubResource::Repository);
            self.resync_generation += 1;
        }
    }

    /// Copy placement metadata from a fresh route.
    pub fn apply_route(&mut self, route: &ResourceRoute) {
        self.shard = route.shard.clone();
        self.path = route.path.clone();
        self.namespace_id = route.namespace_id;
    }

    fn invalid(&self, to: SyncState) -> ReplicationError {
        ReplicationError::InvalidTransition {
            resource: self.key.to_string(),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

/// Row filter for [`RegistryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RegistryFilter {
    pub state: Option<SyncState>,
    pub shard: Option<String>,
    pub resource_type: Option<ResourceType>,
    /// Only rows ordered after this key.
    pub after: Option<ResourceKey>,
    pub limit: usize,
}

#[derive(sqlx::FromRow)]
struct RegistryRow {
    resource_type: String,
    resource_id: i64,
    shard: String,
    path: String,
    namespace_id: Option<i64>,
    state: String,
    resync_repository: bool,
    resync_wiki: bool,
    resync_attachments: bool,
    resync_generation: i64,
    checksum: Option<String>,
    retry_count: i64,
    retry_at: Option<i64>,
    last_failure: Option<String>,
    last_event_id: i64,
    last_synced_at: Option<i64>,
    verified_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    lock_version: i64,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl TryFrom<RegistryRow> for RegistryRecord {
    type Error = ReplicationError;

    fn try_from(row: RegistryRow) -> Result<Self> {
        Ok(Self {
            key: ResourceKey::new(ResourceType::from_str(&row.resource_type)?, row.resource_id),
            shard: row.shard,
            path: row.path,
            namespace_id: row.namespace_id,
            state: SyncState::from_str(&row.state)?,
            resync: ResyncFlags {
                repository: row.resync_repository,
                wiki: row.resync_wiki,
                attachments: row.resync_attachments,
            },
            resync_generation: row.resync_generation,
            checksum: row.checksum,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            retry_at: row.retry_at.map(from_millis),
            last_failure: row.last_failure,
            last_event_id: row.last_event_id,
            last_synced_at: row.last_synced_at.map(from_millis),
            verified_at: row.verified_at.map(from_millis),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            lock_version: row.lock_version,
        })
    }
}

fn into_records(rows: Vec<RegistryRow>) -> Result<Vec<RegistryRecord>> {
    rows.into_iter().map(RegistryRecord::try_from).collect()
}

/// Durable per-resource replication state.
#[derive(Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
    changes: ChangeBus,
}

impl RegistryStore {
    /// Open the store on `pool`, creating the table if needed.
    pub async fn new(pool: SqlitePool, changes: ChangeBus) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registry (
                resource_type TEXT NOT NULL,
                resource_id INTEGER NOT NULL,
                shard TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL DEFAULT '',
                namespace_id INTEGER,
                state TEXT NOT NULL,
                resync_repository INTEGER NOT NULL DEFAULT 0,
                resync_wiki INTEGER NOT NULL DEFAULT 0,
                resync_attachments INTEGER NOT NULL DEFAULT 0,
                resync_generation INTEGER NOT NULL DEFAULT 0,
                checksum TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER,
                last_failure TEXT,
                last_event_id INTEGER NOT NULL DEFAULT 0,
                last_synced_at INTEGER,
                verified_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                lock_version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (resource_type, resource_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_registry_shard_state ON registry (shard, state)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, changes })
    }

    /// Change bus the store publishes on.
    pub fn changes(&self) -> &ChangeBus {
        &self.changes
    }

    pub async fn get(&self, key: ResourceKey) -> Result<Option<RegistryRecord>> {
        let sql = format!(
            "SELECT {} FROM registry WHERE resource_type = ? AND resource_id = ?",
            SELECT_COLUMNS
        );
        let row: Option<RegistryRow> = sqlx::query_as(&sql)
            .bind(key.resource_type.as_str())
            .bind(key.resource_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RegistryRecord::try_from).transpose()
    }

    /// Create a `pending` row for a routed resource.
    ///
    /// Returns the row and whether it was created. An existing row is
    /// returned untouched.
    pub async fn register(
        &self,
        route: &ResourceRoute,
        resync: ResyncFlags,
    ) -> Result<(RegistryRecord, bool)> {
        let now = now_millis();
        let pool = &self.pool;
        let key = route.key;

        let result = execute_with_retry("registry_register", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO registry (
                    resource_type, resource_id, shard, path, namespace_id, state,
                    resync_repository, resync_wiki, resync_attachments,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.resource_type.as_str())
            .bind(key.resource_id)
            .bind(&route.shard)
            .bind(&route.path)
            .bind(route.namespace_id)
            .bind(SyncState::Pending.as_str())
            .bind(resync.repository)
            .bind(resync.wiki)
            .bind(resync.attachments)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let created = result.rows_affected() == 1;
        let record = self.get(key).await?.ok_or_else(|| {
            ReplicationError::Internal(format!("{} vanished right after registration", key))
        })?;

        if created {
            debug!(resource = %key, shard = %route.shard, "Registered resource");
            crate::metrics::record_registry_registered(key.resource_type.as_str());
            self.changes.publish(ResourceChange::Registered {
                key,
                state: record.state,
            });
        }
        Ok((record, created))
    }

    /// Apply `mutate` to a row with compare-and-set semantics.
    ///
    /// `mutate` runs on a fresh copy on every attempt, so it must not have
    /// side effects outside the record. Returns `None` if the row does not
    /// exist. A mutation that changes nothing is not written.
    pub async fn update<F>(&self, key: ResourceKey, mut mutate: F) -> Result<Option<RegistryRecord>>
    where
        F: FnMut(&mut RegistryRecord) -> Result<()>,
    {
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let Some(current) = self.get(key).await? else {
                return Ok(None);
            };

            let mut next = current.clone();
            mutate(&mut next)?;
            if next == current {
                return Ok(Some(current));
            }
            if !current.state.can_transition_to(next.state) {
                return Err(ReplicationError::InvalidTransition {
                    resource: key.to_string(),
                    from: current.state.to_string(),
                    to: next.state.to_string(),
                });
            }

            next.updated_at = Utc::now();
            if self.compare_and_set(&next, current.lock_version).await? {
                next.lock_version = current.lock_version + 1;
                self.publish_update(&current, &next);
                return Ok(Some(next));
            }

            debug!(resource = %key, attempt, "Registry compare-and-set lost, retrying");
            crate::metrics::record_registry_conflict();
        }

        warn!(resource = %key, attempts = CAS_MAX_ATTEMPTS, "Registry update gave up");
        Err(ReplicationError::Conflict {
            resource: key.to_string(),
            attempts: CAS_MAX_ATTEMPTS,
        })
    }

    /// Apply `mutate` only if the row is unchanged since `seen` was read.
    ///
    /// A single compare-and-set against `seen.lock_version` that always
    /// writes, even when `mutate` changes nothing but the timestamp. Of any
    /// number of concurrent claimants, on any number of processes, exactly
    /// one gets [`Claim::Won`]. Transition checks are left to `mutate`.
    pub async fn claim<F>(&self, seen: &RegistryRecord, mutate: F) -> Result<Claim>
    where
        F: FnOnce(&mut RegistryRecord) -> Result<()>,
    {
        let Some(current) = self.get(seen.key).await? else {
            return Ok(Claim::Gone);
        };
        if current.lock_version != seen.lock_version {
            debug!(resource = %seen.key, "Row changed since it was read, claim lost");
            return Ok(Claim::Lost);
        }

        let mut next = current.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();
        if !self.compare_and_set(&next, current.lock_version).await? {
            crate::metrics::record_registry_conflict();
            return Ok(Claim::Lost);
        }
        next.lock_version = current.lock_version + 1;
        self.publish_update(&current, &next);
        Ok(Claim::Won(next))
    }

    async fn compare_and_set(&self, next: &RegistryRecord, expected_version: i64) -> Result<bool> {
        let pool = &self.pool;
        let state = next.state.as_str();
        let retry_count = i64::from(next.retry_count);
        let retry_at = next.retry_at.map(|t| t.timestamp_millis());
        let last_synced_at = next.last_synced_at.map(|t| t.timestamp_millis());
        let verified_at = next.verified_at.map(|t| t.timestamp_millis());
        let updated_at = next.updated_at.timestamp_millis();

        let result = execute_with_retry("registry_update", || async {
            sqlx::query(
                r#"
                UPDATE registry SET
                    shard = ?, path = ?, namespace_id = ?, state = ?,
                    resync_repository = ?, resync_wiki = ?, resync_attachments = ?,
                    resync_generation = ?, checksum = ?, retry_count = ?, retry_at = ?,
                    last_failure = ?, last_event_id = ?, last_synced_at = ?,
                    verified_at = ?, updated_at = ?, lock_version = lock_version + 1
                WHERE resource_type = ? AND resource_id = ? AND lock_version = ?
                "#,
            )
            .bind(&next.shard)
            .bind(&next.path)
            .bind(next.namespace_id)
            .bind(state)
            .bind(next.resync.repository)
            .bind(next.resync.wiki)
            .bind(next.resync.attachments)
            .bind(next.resync_generation)
            .bind(&next.checksum)
            .bind(retry_count)
            .bind(retry_at)
            .bind(&next.last_failure)
            .bind(next.last_event_id)
            .bind(last_synced_at)
            .bind(verified_at)
            .bind(updated_at)
            .bind(next.key.resource_type.as_str())
            .bind(next.key.resource_id)
            .bind(expected_version)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    fn publish_update(&self, before: &RegistryRecord, after: &RegistryRecord) {
        let key = after.key;
        if before.state != after.state {
            crate::metrics::record_registry_transition(before.state.as_str(), after.state.as_str());
            self.changes.publish(ResourceChange::StateChanged {
                key,
                from: before.state,
                to: after.state,
            });
        } else {
            self.changes.publish(ResourceChange::Updated {
                key,
                state: after.state,
            });
        }
    }

    /// Delete a row. Returns whether it existed.
    pub async fn delete(&self, key: ResourceKey) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry("registry_delete", || async {
            sqlx::query("DELETE FROM registry WHERE resource_type = ? AND resource_id = ?")
                .bind(key.resource_type.as_str())
                .bind(key.resource_id)
                .execute(pool)
                .await
        })
        .await?;

        let removed = result.rows_affected() == 1;
        if removed {
            debug!(resource = %key, "Removed registry row");
            self.changes.publish(ResourceChange::Removed { key });
        }
        Ok(removed)
    }

    /// Rows on `shard` that need a sync now.
    ///
    /// Includes `pending` rows, `failed` rows whose backoff expired and that
    /// are below `max_retries`, and settled rows with resync flags raised.
    pub async fn due_for_sync(
        &self,
        shard: &str,
        now: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM registry
            WHERE shard = ? AND (
                state = 'pending'
                OR (state = 'failed' AND retry_count < ? AND (retry_at IS NULL OR retry_at <= ?))
                OR (state IN ('synced', 'verification_succeeded', 'verification_failed')
                    AND (resync_repository = 1 OR resync_wiki = 1 OR resync_attachments = 1))
            )
            ORDER BY updated_at, resource_type, resource_id
            LIMIT ?
            "#,
            SELECT_COLUMNS
        );
        let rows: Vec<RegistryRow> = sqlx::query_as(&sql)
            .bind(shard)
            .bind(i64::from(max_retries))
            .bind(now.timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Rows on `shard` waiting for verification.
    pub async fn due_for_verification(&self, shard: &str, limit: usize) -> Result<Vec<RegistryRecord>> {
        self.list(&RegistryFilter {
            state: Some(SyncState::VerificationPending),
            shard: Some(shard.to_string()),
            limit,
            ..Default::default()
        })
        .await
    }

    /// `started` rows on `shard` untouched since `stale_before`.
    ///
    /// A crash between the state write and the enqueue leaves such rows
    /// with no job behind them.
    pub async fn stale_started(
        &self,
        shard: &str,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>> {
        let sql = format!(
            "SELECT {} FROM registry WHERE shard = ? AND state = 'started' AND updated_at < ? \
             ORDER BY updated_at LIMIT ?",
            SELECT_COLUMNS
        );
        let rows: Vec<RegistryRow> = sqlx::query_as(&sql)
            .bind(shard)
            .bind(stale_before.timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Settled rows on `shard` last verified (or synced) before `cutoff`.
    pub async fn due_for_reverification(
        &self,
        shard: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RegistryRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM registry
            WHERE shard = ?
              AND state IN ('synced', 'verification_succeeded')
              AND COALESCE(verified_at, last_synced_at, created_at) < ?
            ORDER BY COALESCE(verified_at, last_synced_at, created_at)
            LIMIT ?
            "#,
            SELECT_COLUMNS
        );
        let rows: Vec<RegistryRow> = sqlx::query_as(&sql)
            .bind(shard)
            .bind(cutoff.timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Failed rows that exhausted their retries.
    pub async fn stuck(&self, max_retries: u32, limit: usize) -> Result<Vec<RegistryRecord>> {
        let sql = format!(
            "SELECT {} FROM registry WHERE state = 'failed' AND retry_count >= ? \
             ORDER BY updated_at LIMIT ?",
            SELECT_COLUMNS
        );
        let rows: Vec<RegistryRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_retries))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    /// Number of failed rows that exhausted their retries.
    pub async fn count_stuck(&self, max_retries: u32) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM registry WHERE state = 'failed' AND retry_count >= ?")
                .bind(i64::from(max_retries))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// List rows matching `filter`, ordered by key.
    pub async fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryRecord>> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {} FROM registry WHERE 1 = 1",
            SELECT_COLUMNS
        ));
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(shard) = &filter.shard {
            qb.push(" AND shard = ").push_bind(shard.clone());
        }
        if let Some(resource_type) = filter.resource_type {
            qb.push(" AND resource_type = ").push_bind(resource_type.as_str());
        }
        if let Some(after) = filter.after {
            qb.push(" AND (resource_type > ")
                .push_bind(after.resource_type.as_str())
                .push(" OR (resource_type = ")
                .push_bind(after.resource_type.as_str())
                .push(" AND resource_id > ")
                .push_bind(after.resource_id)
                .push("))");
        }
        qb.push(" ORDER BY resource_type, resource_id LIMIT ")
            .push_bind(filter.limit as i64);

        let rows: Vec<RegistryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        into_records(rows)
    }

    /// Row counts per state.
    pub async fn count_by_state(&self) -> Result<HashMap<SyncState, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM registry GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (state, count) in rows {
            counts.insert(SyncState::from_str(&state)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Delete every row outside `scope`. Returns the removed keys.
    pub async fn remove_outside_scope(&self, scope: &SelectiveSync) -> Result<Vec<ResourceKey>> {
        if !scope.is_restricted() {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, i64, String, Option<i64>)> = sqlx::query_as(
            "SELECT resource_type, resource_id, shard, namespace_id FROM registry",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut removed = Vec::new();
        for (resource_type, resource_id, shard, namespace_id) in rows {
            if in_scope(scope, &shard, namespace_id) {
                continue;
            }
            let key = ResourceKey::new(ResourceType::from_str(&resource_type)?, resource_id);
            if self.delete(key).await? {
                removed.push(key);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Removed registry rows outside selective sync scope");
        }
        Ok(removed)
    }

    /// Store a checksum computed on the primary.
    ///
    /// Creates the row on first sight. Returns the previously stored checksum.
    pub async fn record_primary_checksum(
        &self,
        route: &ResourceRoute,
        checksum: &str,
    ) -> Result<Option<String>> {
        let (record, _) = self.register(route, ResyncFlags::default()).await?;
        let previous = record.checksum.clone();

        if record.state != SyncState::VerificationSucceeded {
            self.update(route.key, |r| {
                r.request_verification();
                Ok(())
            })
            .await?;
        }
        self.update(route.key, |r| {
            r.apply_route(route);
            if r.state == SyncState::VerificationPending {
                r.verification_result(Some(checksum.to_string()), true);
            } else {
                r.checksum = Some(checksum.to_string());
                r.verified_at = Some(Utc::now());
            }
            Ok(())
        })
        .await?;

        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::open_pool;

    async fn store() -> RegistryStore {
        let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
        RegistryStore::new(pool, ChangeBus::new()).await.unwrap()
    }

    fn route(id: i64, shard: &str) -> ResourceRoute {
        ResourceRoute {
            key: ResourceKey::repository(id),
            shard: shard.to_string(),
            path: format!("group/project-{}", id),
            namespace_id: Some(id % 3),
            primary_checksum: None,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = store().await;
        let (record, created) = store.register(&route(42, "default"), ResyncFlags::all()).await.unwrap();
        assert!(created);
        assert_eq!(record.state, SyncState::Pending);
        assert!(record.resync.repository);

        let (again, created) = store.register(&route(42, "other"), ResyncFlags::default()).await.unwrap();
        assert!(!created);
        assert_eq!(again.shard, "default");
    }

    #[tokio::test]
    async fn test_update_bumps_lock_version_and_publishes() {
        let store = store().await;
        let mut rx = store.changes().subscribe();
        store.register(&route(1, "default"), ResyncFlags::default()).await.unwrap();

        let updated = store
            .update(ResourceKey::repository(1), |r| r.mark_started())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, SyncState::Started);
        assert_eq!(updated.lock_version, 1);

        assert!(matches!(rx.recv().await.unwrap(), ResourceChange::Registered { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceChange::StateChanged {
                key: ResourceKey::repository(1),
                from: SyncState::Pending,
                to: SyncState::Started,
            }
        );
    }

    #[tokio::test]
    async fn test_update_missing_row_returns_none() {
        let store = store().await;
        let result = store
            .update(ResourceKey::repository(404), |r| {
                r.reset_checksum();
                Ok(())
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_transition() {
        let store = store().await;
        store.register(&route(1, "default"), ResyncFlags::default()).await.unwrap();
        let err = store
            .update(ResourceKey::repository(1), |r| {
                r.state = SyncState::Synced;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_noop_update_is_not_written() {
        let store = store().await;
        store.register(&route(1, "default"), ResyncFlags::default()).await.unwrap();
        let same = store
            .update(ResourceKey::repository(1), |_| Ok(()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(same.lock_version, 0);
    }

    #[tokio::test]
    async fn test_sync_lifecycle_clears_flags() {
        let store = store().await;
        let key = ResourceKey::repository(7);
        store.register(&route(7, "default"), ResyncFlags::default()).await.unwrap();

        let record = store
            .update(key, |r| {
                r.request_resync(ResyncFlags::only(SubResource::Wiki));
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        let generation = record.resync_generation;

        store.update(key, |r| r.mark_started()).await.unwrap();
        let synced = store
            .update(key, |r| {
                r.mark_synced(ResyncFlags::all(), generation);
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(synced.state, SyncState::Synced);
        assert!(!synced.resync.any());
        assert!(synced.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_resync_requested_mid_sync_survives_completion() {
        let store = store().await;
        let key = ResourceKey::repository(8);
        store.register(&route(8, "default"), ResyncFlags::default()).await.unwrap();
        store.update(key, |r| r.mark_started()).await.unwrap();
        let dispatched_generation = 0;

        store
            .update(key, |r| {
                r.request_resync(ResyncFlags::only(SubResource::Repository));
                Ok(())
            })
            .await
            .unwrap();

        let record = store
            .update(key, |r| {
                r.mark_synced(ResyncFlags::all(), dispatched_generation);
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, SyncState::Synced);
        assert!(record.resync.repository);
    }

    #[tokio::test]
    async fn test_failed_rows_respect_backoff_and_max_retries() {
        let store = store().await;
        let key = ResourceKey::repository(3);
        store.register(&route(3, "default"), ResyncFlags::default()).await.unwrap();
        store.update(key, |r| r.mark_started()).await.unwrap();

        let retry = RetryConfig::testing();
        let failed = store
            .update(key, |r| {
                r.mark_failed("connection reset", &retry);
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.state, SyncState::Failed);
        assert_eq!(failed.retry_count, 1);
        let retry_at = failed.retry_at.unwrap();

        let before = store.due_for_sync("default", retry_at - chrono::Duration::milliseconds(1), 10, 10).await.unwrap();
        assert!(before.is_empty());

        let after = store.due_for_sync("default", retry_at, 10, 10).await.unwrap();
        assert_eq!(after.len(), 1);

        let exhausted = store.due_for_sync("default", retry_at, 1, 10).await.unwrap();
        assert!(exhausted.is_empty());
        assert_eq!(store.stuck(1, 10).await.unwrap().len(), 1);
        assert_eq!(store.count_stuck(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_for_sync_includes_flagged_settled_rows() {
        let store = store().await;
        let key = ResourceKey::repository(5);
        store.register(&route(5, "default"), ResyncFlags::default()).await.unwrap();
        store.update(key, |r| r.mark_started()).await.unwrap();
        store
            .update(key, |r| {
                r.mark_synced(ResyncFlags::all(), 0);
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.due_for_sync("default", Utc::now(), 10, 10).await.unwrap().is_empty());

        store
            .update(key, |r| {
                r.request_verification();
                Ok(())
            })
            .await
            .unwrap();
        store
            .update(key, |r| {
                r.verification_result(Some("abc".into()), false);
                Ok(())
            })
            .await
            .unwrap();
        let due = store.due_for_sync("default", Utc::now(), 10, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].state, SyncState::VerificationFailed);
        assert!(due[0].resync.repository);
    }

    #[tokio::test]
    async fn test_stale_started_rows() {
        let store = store().await;
        let key = ResourceKey::repository(9);
        store.register(&route(9, "default"), ResyncFlags::all()).await.unwrap();
        store.update(key, |r| r.mark_started()).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.stale_started("default", cutoff, 10).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.stale_started("default", later, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, key);
        assert!(store.stale_started("nfs-02", later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_against_a_stale_read_is_lost() {
        let store = store().await;
        let (seen, _) = store.register(&route(9, "default"), ResyncFlags::all()).await.unwrap();

        let won = store.claim(&seen, |r| r.mark_started()).await.unwrap();
        let Claim::Won(started) = won else {
            panic!("first claim should win, got {:?}", won);
        };
        assert_eq!(started.state, SyncState::Started);
        assert_eq!(started.lock_version, seen.lock_version + 1);

        assert_eq!(store.claim(&seen, |r| r.mark_started()).await.unwrap(), Claim::Lost);

        // A same-state claim still writes
        let Claim::Won(again) = store.claim(&started, |_| Ok(())).await.unwrap() else {
            panic!("claim on the current version should win");
        };
        assert_eq!(again.lock_version, started.lock_version + 1);

        store.delete(seen.key).await.unwrap();
        assert_eq!(store.claim(&again, |_| Ok(())).await.unwrap(), Claim::Gone);
    }

    #[tokio::test]
    async fn test_checksum_reset_from_any_state() {
        let store = store().await;
        let key = ResourceKey::repository(9);
        store.register(&route(9, "default"), ResyncFlags::default()).await.unwrap();
        store.update(key, |r| r.mark_started()).await.unwrap();

        let record = store
            .update(key, |r| {
                r.reset_checksum();
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, SyncState::VerificationPending);
        assert_eq!(store.due_for_verification("default", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_counts() {
        let store = store().await;
        for id in 1..=5 {
            store.register(&route(id, if id % 2 == 0 { "even" } else { "odd" }), ResyncFlags::default()).await.unwrap();
        }
        store.update(ResourceKey::repository(1), |r| r.mark_started()).await.unwrap();

        let odd = store
            .list(&RegistryFilter {
                shard: Some("odd".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(odd.len(), 3);

        let page = store
            .list(&RegistryFilter {
                after: Some(ResourceKey::repository(3)),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|r| r.key.resource_id).collect::<Vec<_>>(), vec![4, 5]);

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.get(&SyncState::Pending), Some(&4));
        assert_eq!(counts.get(&SyncState::Started), Some(&1));
    }

    #[tokio::test]
    async fn test_remove_outside_scope() {
        let store = store().await;
        store.register(&route(1, "default"), ResyncFlags::default()).await.unwrap();
        store.register(&route(2, "nfs-01"), ResyncFlags::default()).await.unwrap();

        let scope = SelectiveSync::Shards(["default".to_string()].into_iter().collect());
        let removed = store.remove_outside_scope(&scope).await.unwrap();
        assert_eq!(removed, vec![ResourceKey::repository(2)]);
        assert!(store.get(ResourceKey::repository(1)).await.unwrap().is_some());

        assert!(store.remove_outside_scope(&SelectiveSync::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_primary_checksum_returns_previous() {
        let store = store().await;
        let r = route(11, "default");
        assert_eq!(store.record_primary_checksum(&r, "aaa").await.unwrap(), None);
        assert_eq!(
            store.record_primary_checksum(&r, "bbb").await.unwrap(),
            Some("aaa".to_string())
        );
        let record = store.get(r.key).await.unwrap().unwrap();
        assert_eq!(record.checksum.as_deref(), Some("bbb"));
        assert_eq!(record.state, SyncState::VerificationSucceeded);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store().await;
        store.register(&route(1, "default"), ResyncFlags::default()).await.unwrap();
        assert!(store.delete(ResourceKey::repository(1)).await.unwrap());
        assert!(!store.delete(ResourceKey::repository(1)).await.unwrap());
    }

    #[test]
    fn test_idempotency_guard() {
        let mut record = RegistryRecord {
            key: ResourceKey::repository(1),
            shard: "default".into(),
            path: "a/b".into(),
            namespace_id: None,
            state: SyncState::Pending,
            resync: ResyncFlags::default(),
            resync_generation: 0,
            checksum: None,
            retry_count: 0,
            retry_at: None,
            last_failure: None,
            last_event_id: 0,
            last_synced_at: None,
            verified_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            lock_version: 0,
        };
        record.note_event(101);
        assert!(record.has_applied(100));
        assert!(record.has_applied(101));
        assert!(!record.has_applied(102));
        record.note_event(50);
        assert_eq!(record.last_event_id, 101);
    }
}
