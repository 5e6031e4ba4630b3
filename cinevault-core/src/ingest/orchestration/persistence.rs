//! Postgres-backed durable job queue.
//!
//! The store's transaction is the concurrency primitive: claiming uses
//! `FOR UPDATE SKIP LOCKED`, dedupe uniqueness is a partial unique index,
//! and every state transition is guarded by the state it expects to leave.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Acquire, FromRow, Postgres, Row, Transaction};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::types::LibraryId;

use super::{
    config::RetryConfig,
    job::{
        DependencyKey, EnqueueRequest, JobHandle, JobId, JobKind, JobPayload, JobPriority,
        JobRecord, JobState,
    },
    lease::{JobLease, LeaseId, LeaseRenewal, LeaseRequest},
    queue::{
        JobQueue, LeaseExpiryScanner, QueueInstrumentation, QueueSnapshot,
    },
    retry::RetryPolicy,
};

const PG_UNIQUE_VIOLATION: &str = "23505";

const JOB_COLUMNS: &str = "id, library_id, kind, payload, priority, state, attempts, \
     available_at, lease_owner, lease_id, lease_expires_at, dedupe_key, \
     dependency_key, last_error, created_at, updated_at";

/// Durable queue backed by Postgres.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl fmt::Debug for PostgresJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("retry", &self.retry)
            .finish()
    }
}

/// How a failed attempt's error is recorded.
#[derive(Clone, Copy, Debug)]
enum AttemptError<'a> {
    /// Worker-reported; replaces any earlier error.
    Reported(Option<&'a str>),
    /// Inferred by the reaper; kept only when no earlier error exists.
    Inferred(&'a str),
}

impl<'a> AttemptError<'a> {
    /// (overriding, fallback) pair for `COALESCE($new, last_error, $fallback)`.
    fn binds(self) -> (Option<&'a str>, Option<&'a str>) {
        match self {
            AttemptError::Reported(error) => (error, None),
            AttemptError::Inferred(error) => (None, Some(error)),
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    priority: i16,
    state: String,
    attempts: i32,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    dedupe_key: String,
    dependency_key: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        let payload: JobPayload = serde_json::from_value(self.payload).map_err(|e| {
            IngestError::Internal(format!(
                "failed to deserialize payload for job {}: {e}",
                self.id
            ))
        })?;

        Ok(JobRecord {
            id: JobId(self.id),
            payload,
            priority: JobPriority::from_i16(self.priority)?,
            state: self.state.parse()?,
            attempts: self.attempts.max(0) as u16,
            available_at: self.available_at,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            dedupe_key: self.dedupe_key,
            dependency_key: self.dependency_key.map(DependencyKey::from),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl PostgresJobQueue {
    /// Create a queue handle and verify DB health plus the dequeue index the
    /// claim path depends on.
    pub async fn new(pool: PgPool) -> Result<Self> {
        Self::new_with_retry(pool, RetryConfig::default()).await
    }

    pub async fn new_with_retry(pool: PgPool, retry_config: RetryConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                IngestError::Internal(format!("job queue failed Postgres health check: {e}"))
            })?;

        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_jobs_ready_dequeue")
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            IngestError::Internal(format!("job queue schema validation failed: {e}"))
        })?
        .is_some();

        if !idx_exists {
            return Err(IngestError::Internal(
                "required index idx_jobs_ready_dequeue is missing; run migrations".into(),
            ));
        }

        info!("job queue connected to Postgres");
        Ok(Self {
            pool,
            retry: RetryPolicy::new(retry_config),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue one request inside an open transaction, merging into an
    /// active job with the same dedupe key instead of violating the
    /// partial unique index.
    async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &EnqueueRequest,
    ) -> Result<JobHandle> {
        request.validate()?;

        let dedupe_key = request.dedupe_key();

        // Fast path: merge before attempting the insert so the common
        // duplicate case never produces a unique-violation error log.
        if let Some(handle) = self
            .try_merge(tx, &dedupe_key, request)
            .await?
        {
            return Ok(handle);
        }

        // The insert runs under a savepoint: a lost dedupe race aborts
        // only the savepoint, leaving the enclosing transaction usable
        // for the merge fallback.
        let insert_res = {
            let mut sp = tx.begin().await?;
            match self.insert_job(&mut sp, request, &dedupe_key).await {
                Ok(handle) => {
                    sp.commit().await?;
                    Ok(handle)
                }
                Err(err) => {
                    sp.rollback().await?;
                    Err(err)
                }
            }
        };

        match insert_res {
            Ok(handle) => Ok(handle),
            Err(IngestError::Database(sqlx::Error::Database(db_err)))
                if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) =>
            {
                // A concurrent producer won the insert race.
                match self.try_merge(tx, &dedupe_key, request).await? {
                    Some(handle) => Ok(handle),
                    None => Err(IngestError::Internal(
                        "enqueue conflict: active job vanished during merge".into(),
                    )),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Look up an active job holding `dedupe_key`. Returns a merged handle
    /// (elevating priority when the incoming request is more urgent), an
    /// error when merging is disallowed, or `None` when no active job holds
    /// the key.
    async fn try_merge(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dedupe_key: &str,
        request: &EnqueueRequest,
    ) -> Result<Option<JobHandle>> {
        let existing = sqlx::query(
            r#"
            SELECT id, priority
            FROM ingest_jobs
            WHERE dedupe_key = $1
              AND state IN ('ready', 'deferred', 'leased')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = existing else {
            return Ok(None);
        };

        if !request.allow_merge {
            return Err(IngestError::DuplicateActiveJob {
                dedupe_key: dedupe_key.to_string(),
            });
        }

        let existing_id: Uuid = row.get("id");
        let existing_priority: i16 = row.get("priority");

        if request.priority.code() < existing_priority {
            let updated = sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET priority = $1,
                    available_at = LEAST(available_at, NOW()),
                    updated_at = NOW()
                WHERE id = $2
                  AND state IN ('ready', 'deferred')
                "#,
            )
            .bind(request.priority.code())
            .bind(existing_id)
            .execute(&mut **tx)
            .await?;

            if updated.rows_affected() > 0 {
                info!(
                    job = %existing_id,
                    priority = request.priority.code(),
                    "enqueue merged and elevated priority"
                );
            } else {
                // Leased or moved terminal concurrently; merge is best-effort.
                debug!(job = %existing_id, "enqueue merge: elevation skipped");
            }
        } else {
            trace!(job = %existing_id, "enqueue merged without priority change");
        }

        Ok(Some(JobHandle::merged(JobId(existing_id), request)))
    }

    async fn insert_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &EnqueueRequest,
        dedupe_key: &str,
    ) -> Result<JobHandle> {
        let job_id = JobId::new();
        let payload_json = serde_json::to_value(&request.payload)?;
        let state = if request.dependency_key.is_some() {
            JobState::Deferred
        } else {
            JobState::Ready
        };
        let available_at = request.available_at.unwrap_or_else(Utc::now);

        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (
                id, library_id, kind, payload, priority, state,
                attempts, available_at, lease_owner, lease_id, lease_expires_at,
                dedupe_key, dependency_key, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, NULL, NULL, NULL, $8, $9, NULL, NOW(), NOW())
            "#,
        )
        .bind(job_id.0)
        .bind(request.payload.library_id().to_uuid())
        .bind(request.payload.kind().code())
        .bind(payload_json)
        .bind(request.priority.code())
        .bind(state.as_str())
        .bind(available_at)
        .bind(dedupe_key)
        .bind(request.dependency_key.as_ref().map(|key| key.as_str().to_string()))
        .execute(&mut **tx)
        .await?;

        trace!(job = %job_id, kind = %request.payload.kind(), "enqueue accepted new job");
        Ok(JobHandle::accepted(job_id, request))
    }

    /// Transition a job whose attempt failed (explicitly or by lease
    /// expiry). Below the retry budget the job returns to the queue with
    /// backoff; at the budget it dead-letters.
    async fn settle_failed_attempt(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        attempts_before: i32,
        has_dependency: bool,
        error: AttemptError<'_>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        let attempt_next = attempts_before.saturating_add(1).max(0) as u16;
        let (reported, inferred) = error.binds();

        if retryable && !self.retry.is_exhausted(attempt_next) {
            // A failed job with an unreleased dependency goes back to
            // deferred, not ready.
            let next_state = if has_dependency {
                JobState::Deferred
            } else {
                JobState::Ready
            };
            let delay_ms = self.retry.delay_ms(JobId(job_id), attempt_next);
            let available_at = now + Duration::milliseconds(delay_ms as i64);

            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET attempts = attempts + 1,
                    state = $2,
                    lease_owner = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    last_error = COALESCE($3, last_error, $4),
                    available_at = $5,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(next_state.as_str())
            .bind(reported)
            .bind(inferred)
            .bind(available_at)
            .execute(&mut **tx)
            .await?;

            warn!(
                job = %job_id,
                attempts = attempt_next,
                delay_ms,
                "job attempt failed; scheduled retry"
            );
            Ok(next_state)
        } else {
            let terminal = if retryable {
                JobState::DeadLetter
            } else {
                JobState::Failed
            };

            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET state = $2,
                    attempts = attempts + 1,
                    lease_owner = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    last_error = COALESCE($3, last_error, $4),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(terminal.as_str())
            .bind(reported)
            .bind(inferred)
            .execute(&mut **tx)
            .await?;

            warn!(job = %job_id, state = %terminal, attempts = attempt_next, "job moved to terminal state");
            Ok(terminal)
        }
    }

    fn lease_from_row(
        row: PgRow,
        worker_id: &str,
        lease_id: LeaseId,
        expires_at: DateTime<Utc>,
    ) -> Result<JobLease> {
        let job_row = JobRow::from_row(&row)?;
        let mut record = job_row.into_record()?;
        record.state = JobState::Leased;
        record.lease_owner = Some(worker_id.to_string());
        record.lease_expires_at = Some(expires_at);

        Ok(JobLease {
            lease_id,
            job: record,
            lease_owner: worker_id.to_string(),
            expires_at,
        })
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let mut tx = self.pool.begin().await?;
        let handle = self.enqueue_in_tx(&mut tx, &request).await?;
        tx.commit().await?;
        Ok(handle)
    }

    async fn enqueue_many(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<JobHandle>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(requests.len());
        for request in &requests {
            out.push(self.enqueue_in_tx(&mut tx, request).await?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn lease(&self, request: LeaseRequest) -> Result<Vec<JobLease>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Claim candidates under row locks; SKIP LOCKED keeps concurrent
        // workers from blocking on (or double-claiming) the same rows.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM ingest_jobs
            WHERE state = 'ready'
              AND available_at <= $1
              AND ($2::smallint IS NULL OR kind = $2)
              AND ($3::uuid IS NULL OR library_id = $3)
            ORDER BY priority ASC, available_at ASC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $4
            "#
        ))
        .bind(now)
        .bind(request.kind.map(JobKind::code))
        .bind(request.library_id.map(|library| library.to_uuid()))
        .bind(request.limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut leases = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id: Uuid = row.try_get("id")?;
            let lease_id = LeaseId::new();
            let expires_at = now + request.lease_ttl;

            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET state = 'leased',
                    lease_owner = $1,
                    lease_id = $2,
                    lease_expires_at = $3,
                    updated_at = NOW()
                WHERE id = $4
                  AND state = 'ready'
                "#,
            )
            .bind(&request.worker_id)
            .bind(lease_id.0)
            .bind(expires_at)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            leases.push(Self::lease_from_row(
                row,
                &request.worker_id,
                lease_id,
                expires_at,
            )?);
        }

        tx.commit().await?;

        if !leases.is_empty() {
            debug!(
                worker = %request.worker_id,
                count = leases.len(),
                "leased jobs"
            );
        }
        Ok(leases)
    }

    async fn heartbeat(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        // Single-statement renewal keeps row locks scoped to the SQL
        // execution time instead of holding them across deserialization.
        let extend_ms: i64 = renewal.extend_by.num_milliseconds();
        let row = sqlx::query(&format!(
            r#"
            UPDATE ingest_jobs
            SET lease_expires_at = lease_expires_at + ($1::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE lease_id = $2
              AND state = 'leased'
              AND lease_expires_at > NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(extend_ms)
        .bind(renewal.lease_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!(lease = %renewal.lease_id, "heartbeat failed: lease not found or expired");
            return Err(IngestError::LeaseNotFound(renewal.lease_id.to_string()));
        };

        let record = JobRow::from_row(&row)?.into_record()?;
        let expires_at = record.lease_expires_at.ok_or_else(|| {
            IngestError::Internal("renewed lease returned NULL lease_expires_at".into())
        })?;
        let lease_owner = record.lease_owner.clone().unwrap_or_default();

        debug!(lease = %renewal.lease_id, until = %expires_at, "renewed lease");
        Ok(JobLease {
            lease_id: renewal.lease_id,
            job: record,
            lease_owner,
            expires_at,
        })
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = 'completed',
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1
              AND state = 'leased'
            "#,
        )
        .bind(lease_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            debug!(lease = %lease_id, "completed job");
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, attempts, dependency_key
            FROM ingest_jobs
            WHERE lease_id = $1
              AND state = 'leased'
            FOR UPDATE
            "#,
        )
        .bind(lease_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        // Lease already released; nothing to settle.
        let Some(row) = row else {
            return Ok(());
        };

        let job_id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let dependency_key: Option<String> = row.get("dependency_key");

        self.settle_failed_attempt(
            &mut tx,
            job_id,
            attempts,
            dependency_key.is_some(),
            AttemptError::Reported(error.as_deref()),
            retryable,
            Utc::now(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        // Leased jobs are not cancellable; their lease either completes or
        // expires.
        sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE id = $1
              AND state IN ('ready', 'deferred')
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_depth(&self, kind: JobKind) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint
            FROM ingest_jobs
            WHERE kind = $1
              AND state = 'ready'
            "#,
        )
        .bind(kind.code())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn release_dependency(
        &self,
        library_id: LibraryId,
        dependency_key: &DependencyKey,
    ) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = 'ready',
                dependency_key = NULL,
                available_at = NOW(),
                updated_at = NOW()
            WHERE library_id = $1
              AND state = 'deferred'
              AND dependency_key = $2
            "#,
        )
        .bind(library_id.to_uuid())
        .bind(dependency_key.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresJobQueue {
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            SELECT id, attempts, dependency_key
            FROM ingest_jobs
            WHERE state = 'leased'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut resurrected = 0u64;
        for row in expired {
            let job_id: Uuid = row.get("id");
            let attempts: i32 = row.get("attempts");
            let dependency_key: Option<String> = row.get("dependency_key");

            // An expired lease counts as a failed attempt without an
            // explicit error from the worker.
            let state = self
                .settle_failed_attempt(
                    &mut tx,
                    job_id,
                    attempts,
                    dependency_key.is_some(),
                    AttemptError::Inferred("lease expired"),
                    true,
                    now,
                )
                .await?;
            if state.is_active() {
                resurrected += 1;
            }
        }

        tx.commit().await?;

        if resurrected > 0 {
            info!(count = resurrected, "reaped expired leases");
        }
        Ok(resurrected)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE state IN ('completed', 'failed', 'dead_letter')
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            info!(count = purged, "purged terminal jobs");
        }
        Ok(purged)
    }
}

#[async_trait]
impl QueueInstrumentation for PostgresJobQueue {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT kind, state, COUNT(*)::bigint AS cnt
            FROM ingest_jobs
            GROUP BY kind, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now());
        for kind in JobKind::all_kinds() {
            snapshot.entry_mut(*kind);
        }

        for row in rows {
            let kind = JobKind::from_i16(row.get("kind"))?;
            let state: String = row.get("state");
            let cnt: i64 = row.get("cnt");
            let cnt = cnt.max(0) as usize;

            let entry = snapshot.entry_mut(kind);
            match state.as_str() {
                "ready" => entry.ready = cnt,
                "deferred" => entry.deferred = cnt,
                "leased" => entry.leased = cnt,
                "completed" => entry.completed = cnt,
                "failed" => entry.failed = cnt,
                "dead_letter" => entry.dead_letter = cnt,
                _ => {}
            }
        }

        Ok(snapshot)
    }
}
