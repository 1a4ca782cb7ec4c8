//! Postgres-backed queue store.
//!
//! Expects four tables: `payslip_runs`, `queue_items`, `dead_letters` and
//! `metric_buckets` (primary key `(tenant_id, hour_bucket)`), with statuses
//! stored as text and `error_summary`/`error_history` as `jsonb`.
//!
//! ## Concurrency
//!
//! The claim uses `FOR UPDATE SKIP LOCKED` inside the candidate subselect, so
//! concurrent workers never block each other and never receive the same row.
//! Finalization locks the parent run row (`FOR UPDATE`), applies the domain
//! counter update in Rust, and writes item and run in one transaction.
//!
//! Post-claim item writes carry an ownership fence in their WHERE clause
//! (`worker_id = .. AND status IN ('claimed', 'processing')`): a worker whose
//! lease was swept, or whose item already finished under another claim, hits
//! zero rows and gets `OwnershipLost` instead of silently overwriting.
//!
//! ## Error Mapping
//!
//! | SQLx error | Code | `QueueStoreError` |
//! |------------|------|-------------------|
//! | Database (unique violation) | `23505` | `ActiveRunExists` on run insert, else `Storage` |
//! | RowNotFound | N/A | `NotFound` |
//! | Other | any | `Storage` |

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use payrun_core::{
    BatchId, DeadLetterId, DomainError, EmployeeId, QueueItemId, RunId, TenantId, UserId, WorkerId,
};
use payrun_payroll::{
    AttemptRecord, DeadLetterItem, ErrorType, IdempotencyKey, MetricBucket, QueueItem,
    QueueItemStatus, Resolution, Run, RunStatus,
};

use super::query::{DeadLetterFilter, ItemFilter, MetricRange, Pagination, RunFilter};
use super::r#trait::{QueueStats, QueueStore, QueueStoreError, claim_owner};

/// Postgres-backed queue store.
///
/// Thread-safe via the SQLx connection pool; every query carries `tenant_id`
/// in its WHERE clause.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, run, items), fields(tenant_id = %run.tenant_id, run_id = %run.id, item_count = items.len()), err)]
    pub async fn create_run_async(
        &self,
        run: Run,
        items: Vec<QueueItem>,
    ) -> Result<RunId, QueueStoreError> {
        for item in &items {
            if item.run_id != run.id || item.tenant_id != run.tenant_id {
                return Err(QueueStoreError::Domain(DomainError::invariant(
                    "queue item does not belong to the run being created",
                )));
            }
        }

        let mut tx = self.begin().await?;

        let active = sqlx::query(
            r#"
            SELECT id FROM payslip_runs
            WHERE tenant_id = $1 AND batch_id = $2
              AND status IN ('pending', 'in_progress')
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(run.tenant_id.as_uuid())
        .bind(run.batch_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_active_run", e))?;
        if active.is_some() {
            return Err(QueueStoreError::ActiveRunExists(run.batch_id));
        }

        insert_run(&mut tx, &run).await?;
        for item in &items {
            insert_item(&mut tx, item).await?;
        }

        self.commit(tx).await?;
        Ok(run.id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, run_id = %run_id), err)]
    pub async fn get_run_async(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Option<Run>, QueueStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM payslip_runs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(run_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_run", e))?;

        row.map(|r| decode_run(&r)).transpose()
    }

    pub async fn list_runs_async(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, QueueStoreError> {
        let batch_param: Option<uuid::Uuid> = filter.batch_id.map(|b| *b.as_uuid());
        let status_param: Option<&str> = filter.status.map(run_status_str);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM payslip_runs
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR batch_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR created_at > $4)
            ORDER BY created_at
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(batch_param)
        .bind(status_param)
        .bind(filter.created_after)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_runs", e))?;

        rows.iter().map(decode_run).collect()
    }

    pub async fn max_file_version_async(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<u32, QueueStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(file_version), 0) AS max_version
            FROM payslip_runs
            WHERE tenant_id = $1 AND batch_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(batch_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("max_file_version", e))?;

        let max: i32 = row
            .try_get("max_version")
            .map_err(|e| QueueStoreError::Storage(format!("failed to read max_version: {e}")))?;
        Ok(max as u32)
    }

    pub async fn active_run_exists_async(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<bool, QueueStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM payslip_runs
                WHERE tenant_id = $1 AND batch_id = $2
                  AND status IN ('pending', 'in_progress')
            ) AS active
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(batch_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_run_exists", e))?;

        row.try_get("active")
            .map_err(|e| QueueStoreError::Storage(format!("failed to read active flag: {e}")))
    }

    /// Claim up to `limit` pending items.
    ///
    /// `SKIP LOCKED` makes concurrent claimants compose: each sees only rows
    /// no one else holds, so the union of concurrent claims is duplicate-free.
    #[instrument(skip(self), fields(worker_id = %worker_id, limit), err)]
    pub async fn claim_batch_async(
        &self,
        tenant_id: Option<TenantId>,
        worker_id: WorkerId,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let tenant_param: Option<uuid::Uuid> = tenant_id.map(|t| *t.as_uuid());
        let mut tx = self.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE queue_items SET
                status = 'claimed',
                worker_id = $1,
                claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM queue_items
                WHERE status = 'pending'
                  AND (eligible_at IS NULL OR eligible_at <= NOW())
                  AND ($2::uuid IS NULL OR tenant_id = $2)
                ORDER BY created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(worker_id.as_uuid())
        .bind(tenant_param)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let claimed: Vec<QueueItem> = rows
            .iter()
            .map(decode_item)
            .collect::<Result<_, _>>()?;

        // Flip each affected run to in_progress on its first claim.
        let run_ids: Vec<uuid::Uuid> = claimed.iter().map(|i| *i.run_id.as_uuid()).collect();
        if !run_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE payslip_runs SET status = 'in_progress', started_at = NOW()
                WHERE id = ANY($1) AND status = 'pending'
                "#,
            )
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("flip_runs_in_progress", e))?;
        }

        self.commit(tx).await?;
        Ok(claimed)
    }

    pub async fn get_item_async(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_item", e))?;

        row.map(|r| decode_item(&r)).transpose()
    }

    pub async fn list_items_async(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let status_param: Option<&str> = filter.status.map(item_status_str);
        let employee_param: Option<uuid::Uuid> = filter.employee_id.map(|e| *e.as_uuid());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM queue_items
            WHERE tenant_id = $1 AND run_id = $2
              AND ($3::text IS NULL OR status = $3)
              AND ($4::uuid IS NULL OR employee_id = $4)
            ORDER BY created_at, id
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(run_id.as_uuid())
        .bind(status_param)
        .bind(employee_param)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_items", e))?;

        rows.iter().map(decode_item).collect()
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, status = ?item.status), err)]
    pub async fn update_item_async(&self, item: &QueueItem) -> Result<(), QueueStoreError> {
        if item.status.is_terminal() {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "terminal item updates must go through finalization",
            )));
        }
        let owner = claim_owner(item)?;
        if write_item_fenced(&*self.pool, item, owner).await? == 0 {
            return Err(fenced_write_miss(&*self.pool, item.tenant_id, item.id).await?);
        }
        Ok(())
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, owner = %owner), err)]
    pub async fn requeue_item_async(
        &self,
        item: &QueueItem,
        owner: WorkerId,
    ) -> Result<(), QueueStoreError> {
        if item.status != QueueItemStatus::Pending {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "requeue_item requires a Pending item",
            )));
        }
        if write_item_fenced(&*self.pool, item, owner).await? == 0 {
            return Err(fenced_write_miss(&*self.pool, item.tenant_id, item.id).await?);
        }
        Ok(())
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, run_id = %item.run_id), err)]
    pub async fn finalize_success_async(&self, item: &QueueItem) -> Result<Run, QueueStoreError> {
        if item.status != QueueItemStatus::Completed {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "finalize_success requires a Completed item",
            )));
        }
        let owner = claim_owner(item)?;
        let mut tx = self.begin().await?;

        if write_item_fenced(&mut *tx, item, owner).await? == 0 {
            return Err(fenced_write_miss(&mut *tx, item.tenant_id, item.id).await?);
        }

        let mut run = lock_run(&mut tx, item.tenant_id, item.run_id).await?;
        let now = Utc::now();
        if run.settled_count() == run.total_employees {
            run.record_reprocessed_success(now)?;
        } else {
            run.record_success(item.processing_time_ms.unwrap_or(0), now)?;
            let workers = active_worker_count(&mut tx, item.run_id).await?;
            run.update_estimate(now, workers);
        }
        write_run(&mut tx, &run).await?;

        self.commit(tx).await?;
        Ok(run)
    }

    #[instrument(skip(self, item, dead_letter), fields(item_id = %item.id, run_id = %item.run_id), err)]
    pub async fn finalize_failure_async(
        &self,
        item: &QueueItem,
        dead_letter: DeadLetterItem,
    ) -> Result<Run, QueueStoreError> {
        if item.status != QueueItemStatus::Failed {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "finalize_failure requires a Failed item",
            )));
        }
        if dead_letter.queue_item_id != item.id {
            return Err(QueueStoreError::Domain(DomainError::invariant(
                "dead letter does not reference the finalized item",
            )));
        }
        let owner = claim_owner(item)?;
        let mut tx = self.begin().await?;

        if write_item_fenced(&mut *tx, item, owner).await? == 0 {
            return Err(fenced_write_miss(&mut *tx, item.tenant_id, item.id).await?);
        }

        // ON CONFLICT keeps the original record when a re-exhausted manual
        // retry finalizes the same item again.
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, tenant_id, queue_item_id, run_id, employee_id,
                final_error_message, error_history, total_attempts,
                resolution, resolved_at, resolved_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (queue_item_id) DO NOTHING
            "#,
        )
        .bind(dead_letter.id.as_uuid())
        .bind(dead_letter.tenant_id.as_uuid())
        .bind(dead_letter.queue_item_id.as_uuid())
        .bind(dead_letter.run_id.as_uuid())
        .bind(dead_letter.employee_id.as_uuid())
        .bind(&dead_letter.final_error_message)
        .bind(encode_json(&dead_letter.error_history)?)
        .bind(dead_letter.total_attempts as i32)
        .bind(resolution_str(dead_letter.resolution))
        .bind(dead_letter.resolved_at)
        .bind(dead_letter.resolved_by.map(|u| *u.as_uuid()))
        .bind(dead_letter.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        let mut run = lock_run(&mut tx, item.tenant_id, item.run_id).await?;
        if run.settled_count() < run.total_employees {
            let error_type = item.error_type.unwrap_or(ErrorType::Other);
            run.record_failure(error_type, Utc::now())?;
        }
        write_run(&mut tx, &run).await?;

        self.commit(tx).await?;
        Ok(run)
    }

    pub async fn expired_leases_async(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM queue_items
            WHERE (status = 'claimed' AND claimed_at < $1 - $2::interval)
               OR (status = 'processing'
                   AND COALESCE(started_at, claimed_at) < $1 - $2::interval)
            ORDER BY claimed_at
            "#
        ))
        .bind(now)
        .bind(format!("{} seconds", lease_timeout.num_seconds()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_leases", e))?;

        rows.iter().map(decode_item).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, item_id = %item_id), err)]
    pub async fn retry_item_async(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, QueueStoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_item", e))?
        .ok_or(QueueStoreError::NotFound)?;

        let mut item = decode_item(&row)?;
        item.reset_for_manual_retry()?;
        write_item(&mut *tx, &item).await?;

        self.commit(tx).await?;
        Ok(item)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, run_id = %run_id), err)]
    pub async fn cancel_run_async(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Run, QueueStoreError> {
        let mut tx = self.begin().await?;

        let mut run = lock_run(&mut tx, tenant_id, run_id).await?;
        if run.status.is_terminal() {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                format!("run {run_id} is already terminal"),
            )));
        }

        let cancelled = sqlx::query(
            r#"
            UPDATE queue_items SET status = 'cancelled', completed_at = NOW()
            WHERE tenant_id = $1 AND run_id = $2 AND status = 'pending'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(run_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_items", e))?
        .rows_affected();

        run.record_cancelled(cancelled, Utc::now())?;
        write_run(&mut tx, &run).await?;

        self.commit(tx).await?;
        Ok(run)
    }

    pub async fn get_dead_letter_async(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Option<DeadLetterItem>, QueueStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(dead_letter_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.map(|r| decode_dead_letter(&r)).transpose()
    }

    pub async fn list_dead_letters_async(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, QueueStoreError> {
        let resolution_param: Option<&str> = filter.resolution.map(resolution_str);
        let run_param: Option<uuid::Uuid> = filter.run_id.map(|r| *r.as_uuid());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR resolution = $2)
              AND ($3::uuid IS NULL OR run_id = $3)
            ORDER BY created_at
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(resolution_param)
        .bind(run_param)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(decode_dead_letter).collect()
    }

    pub async fn update_dead_letter_async(
        &self,
        dead_letter: &DeadLetterItem,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters SET
                resolution = $3,
                resolved_at = $4,
                resolved_by = $5
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(dead_letter.tenant_id.as_uuid())
        .bind(dead_letter.id.as_uuid())
        .bind(resolution_str(dead_letter.resolution))
        .bind(dead_letter.resolved_at)
        .bind(dead_letter.resolved_by.map(|u| *u.as_uuid()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::NotFound);
        }
        Ok(())
    }

    pub async fn terminal_items_in_hour_async(
        &self,
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM queue_items
            WHERE tenant_id = $1
              AND status IN ('completed', 'failed')
              AND completed_at >= $2 AND completed_at < $2 + interval '1 hour'
            ORDER BY completed_at
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(hour_bucket)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("terminal_items_in_hour", e))?;

        rows.iter().map(decode_item).collect()
    }

    pub async fn tenants_with_activity_async(
        &self,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, QueueStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT tenant_id FROM queue_items
            WHERE status IN ('completed', 'failed')
              AND completed_at >= $1 AND completed_at < $1 + interval '1 hour'
            ORDER BY tenant_id
            "#,
        )
        .bind(hour_bucket)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tenants_with_activity", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("tenant_id")
                    .map(TenantId::from_uuid)
                    .map_err(|e| QueueStoreError::Storage(format!("failed to read tenant_id: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self, bucket), fields(tenant_id = %bucket.tenant_id, hour = %bucket.hour_bucket), err)]
    pub async fn upsert_metric_bucket_async(
        &self,
        bucket: MetricBucket,
    ) -> Result<(), QueueStoreError> {
        sqlx::query(
            r#"
            INSERT INTO metric_buckets (
                tenant_id, hour_bucket, total_processed, total_succeeded,
                total_failed, avg_processing_time_ms, p50_processing_time_ms,
                p95_processing_time_ms, p99_processing_time_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, hour_bucket)
            DO UPDATE SET
                total_processed = EXCLUDED.total_processed,
                total_succeeded = EXCLUDED.total_succeeded,
                total_failed = EXCLUDED.total_failed,
                avg_processing_time_ms = EXCLUDED.avg_processing_time_ms,
                p50_processing_time_ms = EXCLUDED.p50_processing_time_ms,
                p95_processing_time_ms = EXCLUDED.p95_processing_time_ms,
                p99_processing_time_ms = EXCLUDED.p99_processing_time_ms
            "#,
        )
        .bind(bucket.tenant_id.as_uuid())
        .bind(bucket.hour_bucket)
        .bind(bucket.total_processed as i64)
        .bind(bucket.total_succeeded as i64)
        .bind(bucket.total_failed as i64)
        .bind(bucket.avg_processing_time_ms)
        .bind(bucket.p50_processing_time_ms as i64)
        .bind(bucket.p95_processing_time_ms as i64)
        .bind(bucket.p99_processing_time_ms as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_metric_bucket", e))?;
        Ok(())
    }

    pub async fn list_metrics_async(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, QueueStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, hour_bucket, total_processed, total_succeeded,
                   total_failed, avg_processing_time_ms, p50_processing_time_ms,
                   p95_processing_time_ms, p99_processing_time_ms
            FROM metric_buckets
            WHERE tenant_id = $1 AND hour_bucket >= $2 AND hour_bucket < $3
            ORDER BY hour_bucket
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_metrics", e))?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let bucket = MetricBucketRow::from_row(&row)
                .map_err(|e| QueueStoreError::Storage(format!("failed to decode bucket: {e}")))?;
            buckets.push(bucket.into());
        }
        Ok(buckets)
    }

    pub async fn stats_async(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM queue_items WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats_items", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| QueueStoreError::Storage(format!("failed to read status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| QueueStoreError::Storage(format!("failed to read count: {e}")))?;
            match parse_item_status(&status)? {
                QueueItemStatus::Pending => stats.pending = n as usize,
                QueueItemStatus::Claimed => stats.claimed = n as usize,
                QueueItemStatus::Processing => stats.processing = n as usize,
                QueueItemStatus::Completed => stats.completed = n as usize,
                QueueItemStatus::Failed => stats.failed = n as usize,
                QueueItemStatus::Cancelled => stats.cancelled = n as usize,
            }
        }

        let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_letters WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_dead_letters", e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| QueueStoreError::Storage(format!("failed to read count: {e}")))?;
        stats.dead_letters = n as usize;
        Ok(stats)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Transaction<'static, Postgres>) -> Result<(), QueueStoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

// The trait is synchronous; bridge through the ambient tokio runtime the way
// callers embedded in an async host already have one.

impl QueueStore for PostgresQueueStore {
    fn create_run(&self, run: Run, items: Vec<QueueItem>) -> Result<RunId, QueueStoreError> {
        block_on(self.create_run_async(run, items))
    }

    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>, QueueStoreError> {
        block_on(self.get_run_async(tenant_id, run_id))
    }

    fn list_runs(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, QueueStoreError> {
        block_on(self.list_runs_async(tenant_id, filter, page))
    }

    fn max_file_version(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<u32, QueueStoreError> {
        block_on(self.max_file_version_async(tenant_id, batch_id))
    }

    fn active_run_exists(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<bool, QueueStoreError> {
        block_on(self.active_run_exists_async(tenant_id, batch_id))
    }

    fn claim_batch(
        &self,
        tenant_id: Option<TenantId>,
        worker_id: WorkerId,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        block_on(self.claim_batch_async(tenant_id, worker_id, limit))
    }

    fn get_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        block_on(self.get_item_async(tenant_id, item_id))
    }

    fn list_items(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        block_on(self.list_items_async(tenant_id, run_id, filter, page))
    }

    fn update_item(&self, item: &QueueItem) -> Result<(), QueueStoreError> {
        block_on(self.update_item_async(item))
    }

    fn requeue_item(
        &self,
        item: &QueueItem,
        owner: WorkerId,
    ) -> Result<(), QueueStoreError> {
        block_on(self.requeue_item_async(item, owner))
    }

    fn finalize_success(&self, item: &QueueItem) -> Result<Run, QueueStoreError> {
        block_on(self.finalize_success_async(item))
    }

    fn finalize_failure(
        &self,
        item: &QueueItem,
        dead_letter: DeadLetterItem,
    ) -> Result<Run, QueueStoreError> {
        block_on(self.finalize_failure_async(item, dead_letter))
    }

    fn expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        block_on(self.expired_leases_async(now, lease_timeout))
    }

    fn retry_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, QueueStoreError> {
        block_on(self.retry_item_async(tenant_id, item_id))
    }

    fn cancel_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, QueueStoreError> {
        block_on(self.cancel_run_async(tenant_id, run_id))
    }

    fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Option<DeadLetterItem>, QueueStoreError> {
        block_on(self.get_dead_letter_async(tenant_id, dead_letter_id))
    }

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, QueueStoreError> {
        block_on(self.list_dead_letters_async(tenant_id, filter, page))
    }

    fn update_dead_letter(&self, dead_letter: &DeadLetterItem) -> Result<(), QueueStoreError> {
        block_on(self.update_dead_letter_async(dead_letter))
    }

    fn terminal_items_in_hour(
        &self,
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        block_on(self.terminal_items_in_hour_async(tenant_id, hour_bucket))
    }

    fn tenants_with_activity(
        &self,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, QueueStoreError> {
        block_on(self.tenants_with_activity_async(hour_bucket))
    }

    fn upsert_metric_bucket(&self, bucket: MetricBucket) -> Result<(), QueueStoreError> {
        block_on(self.upsert_metric_bucket_async(bucket))
    }

    fn list_metrics(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, QueueStoreError> {
        block_on(self.list_metrics_async(tenant_id, range))
    }

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        block_on(self.stats_async(tenant_id))
    }
}

fn block_on<F, T>(fut: F) -> Result<T, QueueStoreError>
where
    F: std::future::Future<Output = Result<T, QueueStoreError>>,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        QueueStoreError::Storage(
            "PostgresQueueStore requires an ambient tokio runtime".to_string(),
        )
    })?;
    handle.block_on(fut)
}

// Column lists and row encode/decode

const RUN_COLUMNS: &str = "id, tenant_id, batch_id, status, total_employees, processed_count, \
    succeeded_count, failed_count, cancelled_count, file_version, error_summary, \
    avg_processing_time_ms, started_at, completed_at, estimated_completion_at, created_at";

const ITEM_COLUMNS: &str = "id, tenant_id, run_id, employee_id, status, idempotency_key, \
    storage_path, file_version, file_hash, file_size_bytes, worker_id, claimed_at, started_at, \
    completed_at, eligible_at, retry_count, max_retries, error_message, error_details, \
    error_type, error_history, processing_time_ms, created_at";

const DEAD_LETTER_COLUMNS: &str = "id, tenant_id, queue_item_id, run_id, employee_id, \
    final_error_message, error_history, total_attempts, resolution, resolved_at, resolved_by, \
    created_at";

async fn insert_run(
    tx: &mut Transaction<'_, Postgres>,
    run: &Run,
) -> Result<(), QueueStoreError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO payslip_runs ({RUN_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#
    ))
    .bind(run.id.as_uuid())
    .bind(run.tenant_id.as_uuid())
    .bind(run.batch_id.as_uuid())
    .bind(run_status_str(run.status))
    .bind(run.total_employees as i64)
    .bind(run.processed_count as i64)
    .bind(run.succeeded_count as i64)
    .bind(run.failed_count as i64)
    .bind(run.cancelled_count as i64)
    .bind(run.file_version as i32)
    .bind(encode_json(&run.error_summary)?)
    .bind(run.avg_processing_time_ms)
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(run.estimated_completion_at)
    .bind(run.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        // A partial unique index on (tenant_id, batch_id) over non-terminal
        // statuses backstops the pre-check against racing creates.
        if is_unique_violation(&e) {
            QueueStoreError::ActiveRunExists(run.batch_id)
        } else {
            map_sqlx_error("insert_run", e)
        }
    })?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

async fn write_run(
    tx: &mut Transaction<'_, Postgres>,
    run: &Run,
) -> Result<(), QueueStoreError> {
    sqlx::query(
        r#"
        UPDATE payslip_runs SET
            status = $3,
            processed_count = $4,
            succeeded_count = $5,
            failed_count = $6,
            cancelled_count = $7,
            error_summary = $8,
            avg_processing_time_ms = $9,
            started_at = $10,
            completed_at = $11,
            estimated_completion_at = $12
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(run.tenant_id.as_uuid())
    .bind(run.id.as_uuid())
    .bind(run_status_str(run.status))
    .bind(run.processed_count as i64)
    .bind(run.succeeded_count as i64)
    .bind(run.failed_count as i64)
    .bind(run.cancelled_count as i64)
    .bind(encode_json(&run.error_summary)?)
    .bind(run.avg_processing_time_ms)
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(run.estimated_completion_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_run", e))?;
    Ok(())
}

async fn insert_item(
    tx: &mut Transaction<'_, Postgres>,
    item: &QueueItem,
) -> Result<(), QueueStoreError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO queue_items ({ITEM_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23)
        "#
    ))
    .bind(item.id.as_uuid())
    .bind(item.tenant_id.as_uuid())
    .bind(item.run_id.as_uuid())
    .bind(item.employee_id.as_uuid())
    .bind(item_status_str(item.status))
    .bind(item.idempotency_key.as_str())
    .bind(&item.storage_path)
    .bind(item.file_version as i32)
    .bind(item.file_hash.as_deref())
    .bind(item.file_size_bytes.map(|v| v as i64))
    .bind(item.worker_id.map(|w| *w.as_uuid()))
    .bind(item.claimed_at)
    .bind(item.started_at)
    .bind(item.completed_at)
    .bind(item.eligible_at)
    .bind(item.retry_count as i32)
    .bind(item.max_retries as i32)
    .bind(item.error_message.as_deref())
    .bind(item.error_details.as_deref())
    .bind(item.error_type.map(|t| t.as_str()))
    .bind(encode_json(&item.error_history)?)
    .bind(item.processing_time_ms.map(|v| v as i64))
    .bind(item.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_item", e))?;
    Ok(())
}

async fn write_item<'e, E>(executor: E, item: &QueueItem) -> Result<u64, QueueStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE queue_items SET
            status = $3,
            file_hash = $4,
            file_size_bytes = $5,
            worker_id = $6,
            claimed_at = $7,
            started_at = $8,
            completed_at = $9,
            eligible_at = $10,
            retry_count = $11,
            error_message = $12,
            error_details = $13,
            error_type = $14,
            error_history = $15,
            processing_time_ms = $16
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(item.tenant_id.as_uuid())
    .bind(item.id.as_uuid())
    .bind(item_status_str(item.status))
    .bind(item.file_hash.as_deref())
    .bind(item.file_size_bytes.map(|v| v as i64))
    .bind(item.worker_id.map(|w| *w.as_uuid()))
    .bind(item.claimed_at)
    .bind(item.started_at)
    .bind(item.completed_at)
    .bind(item.eligible_at)
    .bind(item.retry_count as i32)
    .bind(item.error_message.as_deref())
    .bind(item.error_details.as_deref())
    .bind(item.error_type.map(|t| t.as_str()))
    .bind(encode_json(&item.error_history)?)
    .bind(item.processing_time_ms.map(|v| v as i64))
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("write_item", e))?;
    Ok(result.rows_affected())
}

/// Same write as `write_item`, fenced on the stored row still being in
/// flight under `owner`'s claim. Zero rows means the writer lost ownership
/// (or the row is gone); see `fenced_write_miss`.
async fn write_item_fenced<'e, E>(
    executor: E,
    item: &QueueItem,
    owner: WorkerId,
) -> Result<u64, QueueStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE queue_items SET
            status = $3,
            file_hash = $4,
            file_size_bytes = $5,
            worker_id = $6,
            claimed_at = $7,
            started_at = $8,
            completed_at = $9,
            eligible_at = $10,
            retry_count = $11,
            error_message = $12,
            error_details = $13,
            error_type = $14,
            error_history = $15,
            processing_time_ms = $16
        WHERE tenant_id = $1 AND id = $2
          AND worker_id = $17
          AND status IN ('claimed', 'processing')
        "#,
    )
    .bind(item.tenant_id.as_uuid())
    .bind(item.id.as_uuid())
    .bind(item_status_str(item.status))
    .bind(item.file_hash.as_deref())
    .bind(item.file_size_bytes.map(|v| v as i64))
    .bind(item.worker_id.map(|w| *w.as_uuid()))
    .bind(item.claimed_at)
    .bind(item.started_at)
    .bind(item.completed_at)
    .bind(item.eligible_at)
    .bind(item.retry_count as i32)
    .bind(item.error_message.as_deref())
    .bind(item.error_details.as_deref())
    .bind(item.error_type.map(|t| t.as_str()))
    .bind(encode_json(&item.error_history)?)
    .bind(item.processing_time_ms.map(|v| v as i64))
    .bind(owner.as_uuid())
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("write_item_fenced", e))?;
    Ok(result.rows_affected())
}

/// Classify a zero-row fenced write: either the row vanished or it is no
/// longer held by the writing worker.
async fn fenced_write_miss<'e, E>(
    executor: E,
    tenant_id: TenantId,
    item_id: QueueItemId,
) -> Result<QueueStoreError, QueueStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let exists = sqlx::query("SELECT 1 FROM queue_items WHERE tenant_id = $1 AND id = $2")
        .bind(tenant_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("fenced_write_miss", e))?;
    Ok(if exists.is_some() {
        QueueStoreError::OwnershipLost(item_id)
    } else {
        QueueStoreError::NotFound
    })
}

async fn lock_run(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    run_id: RunId,
) -> Result<Run, QueueStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM payslip_runs WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(tenant_id.as_uuid())
    .bind(run_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_run", e))?
    .ok_or(QueueStoreError::NotFound)?;

    decode_run(&row)
}

async fn active_worker_count(
    tx: &mut Transaction<'_, Postgres>,
    run_id: RunId,
) -> Result<u64, QueueStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(DISTINCT worker_id) AS n FROM queue_items
        WHERE run_id = $1 AND status IN ('claimed', 'processing')
        "#,
    )
    .bind(run_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("active_worker_count", e))?;

    let n: i64 = row
        .try_get("n")
        .map_err(|e| QueueStoreError::Storage(format!("failed to read worker count: {e}")))?;
    Ok(n as u64)
}

fn decode_run(row: &sqlx::postgres::PgRow) -> Result<Run, QueueStoreError> {
    let row = RunRow::from_row(row)
        .map_err(|e| QueueStoreError::Storage(format!("failed to decode run row: {e}")))?;
    row.try_into()
}

fn decode_item(row: &sqlx::postgres::PgRow) -> Result<QueueItem, QueueStoreError> {
    let row = QueueItemRow::from_row(row)
        .map_err(|e| QueueStoreError::Storage(format!("failed to decode item row: {e}")))?;
    row.try_into()
}

fn decode_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetterItem, QueueStoreError> {
    let row = DeadLetterRow::from_row(row)
        .map_err(|e| QueueStoreError::Storage(format!("failed to decode dead letter row: {e}")))?;
    row.try_into()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, QueueStoreError> {
    serde_json::to_value(value)
        .map_err(|e| QueueStoreError::Storage(format!("failed to encode json column: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, QueueStoreError> {
    serde_json::from_value(value)
        .map_err(|e| QueueStoreError::Storage(format!("failed to decode json column: {e}")))
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::InProgress => "in_progress",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Partial => "partial",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus, QueueStoreError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "in_progress" => Ok(RunStatus::InProgress),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "partial" => Ok(RunStatus::Partial),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(QueueStoreError::Storage(format!(
            "unknown run status '{other}'"
        ))),
    }
}

fn item_status_str(status: QueueItemStatus) -> &'static str {
    match status {
        QueueItemStatus::Pending => "pending",
        QueueItemStatus::Claimed => "claimed",
        QueueItemStatus::Processing => "processing",
        QueueItemStatus::Completed => "completed",
        QueueItemStatus::Failed => "failed",
        QueueItemStatus::Cancelled => "cancelled",
    }
}

fn parse_item_status(s: &str) -> Result<QueueItemStatus, QueueStoreError> {
    match s {
        "pending" => Ok(QueueItemStatus::Pending),
        "claimed" => Ok(QueueItemStatus::Claimed),
        "processing" => Ok(QueueItemStatus::Processing),
        "completed" => Ok(QueueItemStatus::Completed),
        "failed" => Ok(QueueItemStatus::Failed),
        "cancelled" => Ok(QueueItemStatus::Cancelled),
        other => Err(QueueStoreError::Storage(format!(
            "unknown item status '{other}'"
        ))),
    }
}

fn parse_error_type(s: &str) -> Result<ErrorType, QueueStoreError> {
    match s {
        "render" => Ok(ErrorType::Render),
        "storage" => Ok(ErrorType::Storage),
        "dependency_unavailable" => Ok(ErrorType::DependencyUnavailable),
        "lease_expired" => Ok(ErrorType::LeaseExpired),
        "other" => Ok(ErrorType::Other),
        other => Err(QueueStoreError::Storage(format!(
            "unknown error type '{other}'"
        ))),
    }
}

fn resolution_str(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Unresolved => "unresolved",
        Resolution::Resolved => "resolved",
        Resolution::Ignored => "ignored",
    }
}

fn parse_resolution(s: &str) -> Result<Resolution, QueueStoreError> {
    match s {
        "unresolved" => Ok(Resolution::Unresolved),
        "resolved" => Ok(Resolution::Resolved),
        "ignored" => Ok(Resolution::Ignored),
        other => Err(QueueStoreError::Storage(format!(
            "unknown resolution '{other}'"
        ))),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::RowNotFound => QueueStoreError::NotFound,
        sqlx::Error::Database(db_err) => QueueStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => QueueStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct RunRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    batch_id: uuid::Uuid,
    status: String,
    total_employees: i64,
    processed_count: i64,
    succeeded_count: i64,
    failed_count: i64,
    cancelled_count: i64,
    file_version: i32,
    error_summary: serde_json::Value,
    avg_processing_time_ms: Option<f64>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    estimated_completion_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for RunRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            batch_id: row.try_get("batch_id")?,
            status: row.try_get("status")?,
            total_employees: row.try_get("total_employees")?,
            processed_count: row.try_get("processed_count")?,
            succeeded_count: row.try_get("succeeded_count")?,
            failed_count: row.try_get("failed_count")?,
            cancelled_count: row.try_get("cancelled_count")?,
            file_version: row.try_get("file_version")?,
            error_summary: row.try_get("error_summary")?,
            avg_processing_time_ms: row.try_get("avg_processing_time_ms")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            estimated_completion_at: row.try_get("estimated_completion_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = QueueStoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: RunId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            batch_id: BatchId::from_uuid(row.batch_id),
            status: parse_run_status(&row.status)?,
            total_employees: row.total_employees as u64,
            processed_count: row.processed_count as u64,
            succeeded_count: row.succeeded_count as u64,
            failed_count: row.failed_count as u64,
            cancelled_count: row.cancelled_count as u64,
            file_version: row.file_version as u32,
            error_summary: decode_json(row.error_summary)?,
            avg_processing_time_ms: row.avg_processing_time_ms,
            started_at: row.started_at,
            completed_at: row.completed_at,
            estimated_completion_at: row.estimated_completion_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct QueueItemRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    run_id: uuid::Uuid,
    employee_id: uuid::Uuid,
    status: String,
    idempotency_key: String,
    storage_path: String,
    file_version: i32,
    file_hash: Option<String>,
    file_size_bytes: Option<i64>,
    worker_id: Option<uuid::Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    eligible_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    error_details: Option<String>,
    error_type: Option<String>,
    error_history: serde_json::Value,
    processing_time_ms: Option<i64>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for QueueItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueItemRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            run_id: row.try_get("run_id")?,
            employee_id: row.try_get("employee_id")?,
            status: row.try_get("status")?,
            idempotency_key: row.try_get("idempotency_key")?,
            storage_path: row.try_get("storage_path")?,
            file_version: row.try_get("file_version")?,
            file_hash: row.try_get("file_hash")?,
            file_size_bytes: row.try_get("file_size_bytes")?,
            worker_id: row.try_get("worker_id")?,
            claimed_at: row.try_get("claimed_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            eligible_at: row.try_get("eligible_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            error_type: row.try_get("error_type")?,
            error_history: row.try_get("error_history")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = QueueStoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let error_type = row.error_type.as_deref().map(parse_error_type).transpose()?;
        let error_history: Vec<AttemptRecord> = decode_json(row.error_history)?;
        Ok(QueueItem {
            id: QueueItemId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            run_id: RunId::from_uuid(row.run_id),
            employee_id: EmployeeId::from_uuid(row.employee_id),
            status: parse_item_status(&row.status)?,
            idempotency_key: IdempotencyKey::from(row.idempotency_key),
            storage_path: row.storage_path,
            file_version: row.file_version as u32,
            file_hash: row.file_hash,
            file_size_bytes: row.file_size_bytes.map(|v| v as u64),
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            claimed_at: row.claimed_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            eligible_at: row.eligible_at,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            error_message: row.error_message,
            error_details: row.error_details,
            error_type,
            error_history,
            processing_time_ms: row.processing_time_ms.map(|v| v as u64),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    queue_item_id: uuid::Uuid,
    run_id: uuid::Uuid,
    employee_id: uuid::Uuid,
    final_error_message: String,
    error_history: serde_json::Value,
    total_attempts: i32,
    resolution: String,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for DeadLetterRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            queue_item_id: row.try_get("queue_item_id")?,
            run_id: row.try_get("run_id")?,
            employee_id: row.try_get("employee_id")?,
            final_error_message: row.try_get("final_error_message")?,
            error_history: row.try_get("error_history")?,
            total_attempts: row.try_get("total_attempts")?,
            resolution: row.try_get("resolution")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterItem {
    type Error = QueueStoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterItem {
            id: DeadLetterId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            queue_item_id: QueueItemId::from_uuid(row.queue_item_id),
            run_id: RunId::from_uuid(row.run_id),
            employee_id: EmployeeId::from_uuid(row.employee_id),
            final_error_message: row.final_error_message,
            error_history: decode_json(row.error_history)?,
            total_attempts: row.total_attempts as u32,
            resolution: parse_resolution(&row.resolution)?,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by.map(UserId::from_uuid),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct MetricBucketRow {
    tenant_id: uuid::Uuid,
    hour_bucket: DateTime<Utc>,
    total_processed: i64,
    total_succeeded: i64,
    total_failed: i64,
    avg_processing_time_ms: f64,
    p50_processing_time_ms: i64,
    p95_processing_time_ms: i64,
    p99_processing_time_ms: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for MetricBucketRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MetricBucketRow {
            tenant_id: row.try_get("tenant_id")?,
            hour_bucket: row.try_get("hour_bucket")?,
            total_processed: row.try_get("total_processed")?,
            total_succeeded: row.try_get("total_succeeded")?,
            total_failed: row.try_get("total_failed")?,
            avg_processing_time_ms: row.try_get("avg_processing_time_ms")?,
            p50_processing_time_ms: row.try_get("p50_processing_time_ms")?,
            p95_processing_time_ms: row.try_get("p95_processing_time_ms")?,
            p99_processing_time_ms: row.try_get("p99_processing_time_ms")?,
        })
    }
}

impl From<MetricBucketRow> for MetricBucket {
    fn from(row: MetricBucketRow) -> Self {
        MetricBucket {
            tenant_id: TenantId::from_uuid(row.tenant_id),
            hour_bucket: row.hour_bucket,
            total_processed: row.total_processed as u64,
            total_succeeded: row.total_succeeded as u64,
            total_failed: row.total_failed as u64,
            avg_processing_time_ms: row.avg_processing_time_ms,
            p50_processing_time_ms: row.p50_processing_time_ms as u64,
            p95_processing_time_ms: row.p95_processing_time_ms as u64,
            p99_processing_time_ms: row.p99_processing_time_ms as u64,
        }
    }
}
