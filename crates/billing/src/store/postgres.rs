//! Postgres-backed stores

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tollbooth_shared::{BillingPeriod, TenantId, UsageMetric};
use uuid::Uuid;

use super::{BillingEventStore, GracePeriodStore, UsageRollup, UsageStore, WebhookEventStore};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::models::{
    DeadLetterEvent, GracePeriod, InboundEvent, UsageAggregate, UsageEvent, UsageQuota,
};

const INBOUND_COLUMNS: &str = r#"
    id, provider_event_id, event_type, payload, processed, error_message,
    retry_count, next_retry_at, claimed_until, dead_lettered, received_at, processed_at
"#;

const AGGREGATE_COLUMNS: &str = r#"
    id, tenant_id, subscription_item_id, metric, total_amount, event_count,
    period_start, period_end, sequence, submitted_to_provider, submission_started_at,
    submitted_at, provider_reference, idempotency_key, created_at
"#;

/// All store traits over one connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn insert_if_absent(&self, event: &InboundEvent) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbound_events (
                id, provider_event_id, event_type, payload, processed, error_message,
                retry_count, next_retry_at, claimed_until, dead_lettered, received_at
            ) VALUES ($1, $2, $3, $4, FALSE, NULL, 0, NULL, $5, FALSE, $6)
            ON CONFLICT (provider_event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.claimed_until)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_event(&self, id: Uuid) -> BillingResult<Option<InboundEvent>> {
        let event = sqlx::query_as::<_, InboundEvent>(&format!(
            "SELECT {} FROM inbound_events WHERE id = $1",
            INBOUND_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn get_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<InboundEvent>> {
        let event = sqlx::query_as::<_, InboundEvent>(&format!(
            "SELECT {} FROM inbound_events WHERE provider_event_id = $1",
            INBOUND_COLUMNS
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn select_due(
        &self,
        now: OffsetDateTime,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        // Selection takes no locks; ownership comes from the conditional claim.
        let events = sqlx::query_as::<_, InboundEvent>(&format!(
            r#"
            SELECT {} FROM inbound_events
            WHERE processed = FALSE
              AND dead_lettered = FALSE
              AND retry_count < $2
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND (claimed_until IS NULL OR claimed_until <= $1)
            ORDER BY received_at ASC
            LIMIT $3
            "#,
            INBOUND_COLUMNS
        ))
        .bind(now)
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET claimed_until = $4
            WHERE id = $1
              AND processed = FALSE
              AND dead_lettered = FALSE
              AND retry_count = $2
              AND (claimed_until IS NULL OR claimed_until <= $3)
            "#,
        )
        .bind(id)
        .bind(expected_retry_count)
        .bind(now)
        .bind(lease_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, id: Uuid, processed_at: OffsetDateTime) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET processed = TRUE, processed_at = $2, error_message = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("inbound event {}", id)));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        next_retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<InboundEvent>> {
        let event = sqlx::query_as::<_, InboundEvent>(&format!(
            r#"
            UPDATE inbound_events
            SET retry_count = retry_count + 1,
                error_message = $3,
                next_retry_at = $4,
                claimed_until = NULL
            WHERE id = $1
              AND processed = FALSE
              AND dead_lettered = FALSE
              AND retry_count = $2
            RETURNING {}
            "#,
            INBOUND_COLUMNS
        ))
        .bind(id)
        .bind(expected_retry_count)
        .bind(error_message)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn record_exhaustion(
        &self,
        id: Uuid,
        expected_retry_count: i32,
        error_message: &str,
        moved_at: OffsetDateTime,
    ) -> BillingResult<Option<DeadLetterEvent>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, InboundEvent>(&format!(
            r#"
            UPDATE inbound_events
            SET retry_count = retry_count + 1,
                error_message = $3,
                next_retry_at = NULL,
                claimed_until = NULL,
                dead_lettered = TRUE
            WHERE id = $1
              AND processed = FALSE
              AND dead_lettered = FALSE
              AND retry_count = $2
            RETURNING {}
            "#,
            INBOUND_COLUMNS
        ))
        .bind(id)
        .bind(expected_retry_count)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        let snapshot = DeadLetterEvent::snapshot(&updated, moved_at);
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events (
                id, inbound_event_id, provider_event_id, event_type, payload,
                error_message, retry_count, received_at, moved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.inbound_event_id)
        .bind(&snapshot.provider_event_id)
        .bind(&snapshot.event_type)
        .bind(&snapshot.payload)
        .bind(&snapshot.error_message)
        .bind(snapshot.retry_count)
        .bind(snapshot.received_at)
        .bind(snapshot.moved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(snapshot))
    }

    async fn select_exhausted(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        let events = sqlx::query_as::<_, InboundEvent>(&format!(
            r#"
            SELECT {} FROM inbound_events
            WHERE processed = FALSE
              AND dead_lettered = FALSE
              AND retry_count >= $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
            INBOUND_COLUMNS
        ))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn promote_to_dead_letter(&self, snapshot: &DeadLetterEvent) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO dead_letter_events (
                id, inbound_event_id, provider_event_id, event_type, payload,
                error_message, retry_count, received_at, moved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (inbound_event_id) DO NOTHING
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.inbound_event_id)
        .bind(&snapshot.provider_event_id)
        .bind(&snapshot.event_type)
        .bind(&snapshot.payload)
        .bind(&snapshot.error_message)
        .bind(snapshot.retry_count)
        .bind(snapshot.received_at)
        .bind(snapshot.moved_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE inbound_events SET dead_lettered = TRUE, claimed_until = NULL WHERE id = $1",
        )
        .bind(snapshot.inbound_event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_dead_letter(&self, id: Uuid) -> BillingResult<Option<DeadLetterEvent>> {
        let row = sqlx::query_as::<_, DeadLetterEvent>(
            r#"
            SELECT id, inbound_event_id, provider_event_id, event_type, payload,
                   error_message, retry_count, received_at, moved_at
            FROM dead_letter_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<DeadLetterEvent>> {
        let rows = sqlx::query_as::<_, DeadLetterEvent>(
            r#"
            SELECT id, inbound_event_id, provider_event_id, event_type, payload,
                   error_message, retry_count, received_at, moved_at
            FROM dead_letter_events
            ORDER BY moved_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_dead_letter(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM dead_letter_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn append_usage_event(&self, event: &UsageEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_events (
                id, tenant_id, metric, amount, request_id, metadata, processed, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id.0)
        .bind(event.metric)
        .bind(event.amount)
        .bind(&event.request_id)
        .bind(&event.metadata)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_unprocessed_usage(&self, limit: i64) -> BillingResult<Vec<UsageEvent>> {
        let rows = sqlx::query_as::<_, UsageEvent>(
            r#"
            SELECT id, tenant_id, metric, amount, request_id, metadata, processed, timestamp
            FROM usage_events
            WHERE processed = FALSE
            ORDER BY timestamp ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply_rollup(
        &self,
        rollup: &UsageRollup,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>> {
        let mut tx = self.pool.begin().await?;

        // Only events this transaction flips from unprocessed count toward the total
        let (total, count): (Option<i64>, i64) = sqlx::query_as(
            r#"
            WITH claimed AS (
                UPDATE usage_events
                SET processed = TRUE
                WHERE id = ANY($1) AND processed = FALSE
                RETURNING amount
            )
            SELECT SUM(amount)::BIGINT, COUNT(*)::BIGINT FROM claimed
            "#,
        )
        .bind(&rollup.event_ids)
        .fetch_one(&mut *tx)
        .await?;

        if count == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let total = total.unwrap_or(0);

        let open = sqlx::query_as::<_, UsageAggregate>(&format!(
            r#"
            UPDATE usage_aggregates
            SET total_amount = total_amount + $4, event_count = event_count + $5
            WHERE id = (
                SELECT id FROM usage_aggregates
                WHERE tenant_id = $1 AND metric = $2 AND period_start = $3
                  AND submitted_to_provider = FALSE AND submission_started_at IS NULL
                ORDER BY sequence DESC
                LIMIT 1
                FOR UPDATE
            )
            RETURNING {}
            "#,
            AGGREGATE_COLUMNS
        ))
        .bind(rollup.tenant_id.0)
        .bind(rollup.metric)
        .bind(rollup.period.start)
        .bind(total)
        .bind(count)
        .fetch_optional(&mut *tx)
        .await?;

        let aggregate = match open {
            Some(aggregate) => aggregate,
            None => {
                let (next_sequence,): (i32,) = sqlx::query_as(
                    r#"
                    SELECT COALESCE(MAX(sequence) + 1, 0)::INTEGER
                    FROM usage_aggregates
                    WHERE tenant_id = $1 AND metric = $2 AND period_start = $3
                    "#,
                )
                .bind(rollup.tenant_id.0)
                .bind(rollup.metric)
                .bind(rollup.period.start)
                .fetch_one(&mut *tx)
                .await?;

                // The subscription item is resolved when the aggregate is sealed
                let mut aggregate = UsageAggregate::open(
                    rollup.tenant_id,
                    rollup.metric,
                    rollup.period,
                    next_sequence,
                    None,
                    now,
                );
                aggregate.total_amount = total;
                aggregate.event_count = count;

                // A concurrent aggregator that opened the same sequence wins; our
                // transaction fails on the unique key and its events stay unprocessed.
                sqlx::query(
                    r#"
                    INSERT INTO usage_aggregates (
                        id, tenant_id, subscription_item_id, metric, total_amount, event_count,
                        period_start, period_end, sequence, submitted_to_provider,
                        idempotency_key, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11)
                    "#,
                )
                .bind(aggregate.id)
                .bind(aggregate.tenant_id.0)
                .bind(&aggregate.subscription_item_id)
                .bind(aggregate.metric)
                .bind(aggregate.total_amount)
                .bind(aggregate.event_count)
                .bind(aggregate.period_start)
                .bind(aggregate.period_end)
                .bind(aggregate.sequence)
                .bind(&aggregate.idempotency_key)
                .bind(aggregate.created_at)
                .execute(&mut *tx)
                .await?;

                aggregate
            }
        };

        tx.commit().await?;
        Ok(Some(aggregate))
    }

    async fn list_unsubmitted(&self, limit: i64) -> BillingResult<Vec<UsageAggregate>> {
        let rows = sqlx::query_as::<_, UsageAggregate>(
            r#"
            SELECT
                a.id, a.tenant_id,
                COALESCE(a.subscription_item_id, m.subscription_item_id) AS subscription_item_id,
                a.metric, a.total_amount, a.event_count, a.period_start, a.period_end,
                a.sequence, a.submitted_to_provider, a.submission_started_at,
                a.submitted_at, a.provider_reference, a.idempotency_key, a.created_at
            FROM usage_aggregates a
            LEFT JOIN metered_subscription_items m
                ON m.tenant_id = a.tenant_id AND m.metric = a.metric
            WHERE a.submitted_to_provider = FALSE
              AND COALESCE(a.subscription_item_id, m.subscription_item_id) IS NOT NULL
            ORDER BY a.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn seal_aggregate(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageAggregate>> {
        let row = sqlx::query_as::<_, UsageAggregate>(&format!(
            r#"
            UPDATE usage_aggregates a
            SET submission_started_at = COALESCE(a.submission_started_at, $2),
                subscription_item_id = COALESCE(
                    a.subscription_item_id,
                    (
                        SELECT m.subscription_item_id FROM metered_subscription_items m
                        WHERE m.tenant_id = a.tenant_id AND m.metric = a.metric
                    )
                )
            WHERE a.id = $1 AND a.submitted_to_provider = FALSE
            RETURNING {}
            "#,
            AGGREGATE_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_submitted(
        &self,
        id: Uuid,
        provider_reference: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE usage_aggregates
            SET submitted_to_provider = TRUE, submitted_at = $3, provider_reference = $2
            WHERE id = $1 AND submitted_to_provider = FALSE
            "#,
        )
        .bind(id)
        .bind(provider_reference)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_aggregate(&self, id: Uuid) -> BillingResult<Option<UsageAggregate>> {
        let row = sqlx::query_as::<_, UsageAggregate>(&format!(
            "SELECT {} FROM usage_aggregates WHERE id = $1",
            AGGREGATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn period_usage(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        period: BillingPeriod,
    ) -> BillingResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(total_amount), 0)::BIGINT
            FROM usage_aggregates
            WHERE tenant_id = $1 AND metric = $2
              AND period_start >= $3 AND period_start < $4
            "#,
        )
        .bind(tenant_id.0)
        .bind(metric)
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn current_quota(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        at: OffsetDateTime,
    ) -> BillingResult<Option<UsageQuota>> {
        let quota = sqlx::query_as::<_, UsageQuota>(
            r#"
            SELECT id, tenant_id, metric, quota_amount, hard_cap, period_start, period_end
            FROM usage_quotas
            WHERE tenant_id = $1 AND metric = $2
              AND period_start <= $3 AND $3 < period_end
            ORDER BY period_start DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.0)
        .bind(metric)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota)
    }

    async fn upsert_quota(&self, quota: &UsageQuota) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_quotas (
                id, tenant_id, metric, quota_amount, hard_cap, period_start, period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, metric, period_start) DO UPDATE SET
                quota_amount = EXCLUDED.quota_amount,
                hard_cap = EXCLUDED.hard_cap,
                period_end = EXCLUDED.period_end
            "#,
        )
        .bind(quota.id)
        .bind(quota.tenant_id.0)
        .bind(quota.metric)
        .bind(quota.quota_amount)
        .bind(quota.hard_cap)
        .bind(quota.period_start)
        .bind(quota.period_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscription_item_for(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT subscription_item_id FROM metered_subscription_items
            WHERE tenant_id = $1 AND metric = $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn set_subscription_item(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
        subscription_item_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metered_subscription_items (tenant_id, metric, subscription_item_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, metric) DO UPDATE SET
                subscription_item_id = EXCLUDED.subscription_item_id
            "#,
        )
        .bind(tenant_id.0)
        .bind(metric)
        .bind(subscription_item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GracePeriodStore for PgStore {
    async fn insert_grace_period(&self, grace: &GracePeriod) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO grace_periods (
                id, tenant_id, metric, started_at, expires_at,
                quota_at_start, usage_at_start, notified, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(grace.id)
        .bind(grace.tenant_id.0)
        .bind(grace.metric)
        .bind(grace.started_at)
        .bind(grace.expires_at)
        .bind(grace.quota_at_start)
        .bind(grace.usage_at_start)
        .bind(grace.notified)
        .bind(grace.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_grace_period(
        &self,
        tenant_id: TenantId,
        metric: UsageMetric,
    ) -> BillingResult<Option<GracePeriod>> {
        let row = sqlx::query_as::<_, GracePeriod>(
            r#"
            SELECT id, tenant_id, metric, started_at, expires_at,
                   quota_at_start, usage_at_start, notified, ended_at
            FROM grace_periods
            WHERE tenant_id = $1 AND metric = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.0)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn end_grace_period(&self, id: Uuid, ended_at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE grace_periods SET ended_at = COALESCE(ended_at, $2) WHERE id = $1")
            .bind(id)
            .bind(ended_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_grace_notified(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE grace_periods SET notified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingEventStore for PgStore {
    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, tenant_id, event_type, event_data, provider_event_id,
                provider_object_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(&event.provider_event_id)
        .bind(&event.provider_object_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn billing_events_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let rows = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT id, tenant_id, event_type, event_data, provider_event_id,
                   provider_object_id, created_at
            FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
