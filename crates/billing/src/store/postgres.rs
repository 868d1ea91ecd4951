//! Postgres billing store

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tierline_shared::{RecommendationStatus, RevenueChangeType, SubscriptionStatus, Tier};

use super::{
    accepts_update, merge_update, ActivityEntry, BillingStore, Client, Recommendation,
    RevenueRecord, SubscriptionRecord, SubscriptionUpsert, SubscriptionUpsertOutcome,
    WebhookEventOutcome,
};
use crate::error::{BillingError, BillingResult};

/// Billing store backed by the application database
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    email: String,
    stripe_customer_id: Option<String>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            name: row.name,
            email: row.email,
            stripe_customer_id: row.stripe_customer_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecommendationRow {
    id: Uuid,
    client_id: Uuid,
    status: String,
    purchased_tier: Option<String>,
    purchased_at: Option<OffsetDateTime>,
}

impl TryFrom<RecommendationRow> for Recommendation {
    type Error = BillingError;

    fn try_from(row: RecommendationRow) -> Result<Self, Self::Error> {
        let status: RecommendationStatus = row
            .status
            .parse()
            .map_err(|e| BillingError::Database(format!("{}", e)))?;
        let purchased_tier = row
            .purchased_tier
            .map(|t| t.parse::<Tier>())
            .transpose()
            .map_err(|e| BillingError::Database(format!("{}", e)))?;

        Ok(Recommendation {
            id: row.id,
            client_id: row.client_id,
            status,
            purchased_tier,
            purchased_at: row.purchased_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    stripe_subscription_id: String,
    client_id: Uuid,
    recommendation_id: Option<Uuid>,
    stripe_customer_id: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    last_event_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status: SubscriptionStatus = row
            .status
            .parse()
            .map_err(|e| BillingError::Database(format!("{}", e)))?;

        Ok(SubscriptionRecord {
            id: row.id,
            stripe_subscription_id: row.stripe_subscription_id,
            client_id: row.client_id,
            recommendation_id: row.recommendation_id,
            stripe_customer_id: row.stripe_customer_id,
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            canceled_at: row.canceled_at,
            last_event_at: row.last_event_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RevenueRow {
    client_id: Uuid,
    month: Date,
    mrr_cents: i64,
    change_type: String,
    change_amount_cents: i64,
    stripe_invoice_id: Option<String>,
}

impl TryFrom<RevenueRow> for RevenueRecord {
    type Error = BillingError;

    fn try_from(row: RevenueRow) -> Result<Self, Self::Error> {
        let change_type = match row.change_type.as_str() {
            "new" => RevenueChangeType::New,
            "recurring" => RevenueChangeType::Recurring,
            other => {
                return Err(BillingError::Database(format!(
                    "unknown revenue change type: {}",
                    other
                )))
            }
        };

        Ok(RevenueRecord {
            client_id: row.client_id,
            month: row.month,
            mrr_cents: row.mrr_cents,
            change_type,
            change_amount_cents: row.change_amount_cents,
            stripe_invoice_id: row.stripe_invoice_id,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, stripe_subscription_id, client_id, recommendation_id, \
     stripe_customer_id, status, current_period_start, current_period_end, canceled_at, last_event_at";

async fn lock_subscription(
    tx: &mut Transaction<'_, Postgres>,
    stripe_subscription_id: &str,
) -> BillingResult<Option<SubscriptionRecord>> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(stripe_subscription_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(SubscriptionRecord::try_from).transpose()
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>> {
        let row: Option<ClientRow> = sqlx::query_as(
            "SELECT id, name, email, stripe_customer_id FROM clients WHERE id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Client::from))
    }

    async fn set_client_billing_reference(
        &self,
        client_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<String> {
        // COALESCE keeps an existing reference when two checkouts race
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE clients
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2),
                updated_at = NOW()
            WHERE id = $1
            RETURNING stripe_customer_id
            "#,
        )
        .bind(client_id)
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        match stored {
            Some((Some(reference),)) => Ok(reference),
            Some((None,)) => Err(BillingError::Database(format!(
                "billing reference for client {} was not persisted",
                client_id
            ))),
            None => Err(BillingError::NotFound(format!("Client {} not found", client_id))),
        }
    }

    async fn find_client_by_billing_reference(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<Client>> {
        let row: Option<ClientRow> = sqlx::query_as(
            "SELECT id, name, email, stripe_customer_id FROM clients WHERE stripe_customer_id = $1",
        )
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Client::from))
    }

    async fn get_recommendation(
        &self,
        recommendation_id: Uuid,
    ) -> BillingResult<Option<Recommendation>> {
        let row: Option<RecommendationRow> = sqlx::query_as(
            r#"
            SELECT id, client_id, status, purchased_tier, purchased_at
            FROM recommendations
            WHERE id = $1
            "#,
        )
        .bind(recommendation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Recommendation::try_from).transpose()
    }

    async fn finalize_recommendation(
        &self,
        recommendation_id: Uuid,
        tier: Tier,
        purchased_at: OffsetDateTime,
        history_detail: &str,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE recommendations
            SET status = 'accepted',
                purchased_tier = $2,
                purchased_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'accepted'
            RETURNING id
            "#,
        )
        .bind(recommendation_id)
        .bind(tier.as_str())
        .bind(purchased_at)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO recommendation_history (id, recommendation_id, action, details)
            VALUES ($1, $2, 'purchased', $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recommendation_id)
        .bind(history_detail)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_subscription_by_external_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<SubscriptionUpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        // Insert first so concurrent first deliveries serialize on the unique key
        let inserted: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, client_id, recommendation_id, stripe_customer_id,
                status, current_period_start, current_period_end, canceled_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&upsert.stripe_subscription_id)
        .bind(upsert.client_id)
        .bind(upsert.recommendation_id)
        .bind(&upsert.stripe_customer_id)
        .bind(upsert.status.as_str())
        .bind(upsert.current_period_start)
        .bind(upsert.current_period_end)
        .bind(upsert.canceled_at)
        .bind(upsert.observed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            tx.commit().await?;
            return Ok(SubscriptionUpsertOutcome {
                record: SubscriptionRecord::try_from(row)?,
                previous_status: None,
                inserted: true,
                applied: true,
            });
        }

        let current = lock_subscription(&mut tx, &upsert.stripe_subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Database(format!(
                    "subscription {} vanished during upsert",
                    upsert.stripe_subscription_id
                ))
            })?;

        if !accepts_update(&current, &upsert) {
            tx.rollback().await?;
            return Ok(SubscriptionUpsertOutcome {
                previous_status: Some(current.status),
                record: current,
                inserted: false,
                applied: false,
            });
        }

        let next = merge_update(&current, &upsert);
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET recommendation_id = $2,
                stripe_customer_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                canceled_at = $7,
                last_event_at = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(next.id)
        .bind(next.recommendation_id)
        .bind(&next.stripe_customer_id)
        .bind(next.status.as_str())
        .bind(next.current_period_start)
        .bind(next.current_period_end)
        .bind(next.canceled_at)
        .bind(next.last_event_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SubscriptionUpsertOutcome {
            previous_status: Some(current.status),
            record: next,
            inserted: false,
            applied: true,
        })
    }

    async fn append_subscription_history(
        &self,
        subscription_id: Uuid,
        action: &str,
        details: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history (id, subscription_id, action, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(action)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_revenue(&self, client_id: Uuid, month: Date) -> BillingResult<Option<RevenueRecord>> {
        let row: Option<RevenueRow> = sqlx::query_as(
            r#"
            SELECT client_id, month, mrr_cents, change_type, change_amount_cents, stripe_invoice_id
            FROM revenue_records
            WHERE client_id = $1 AND month = $2
            "#,
        )
        .bind(client_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RevenueRecord::try_from).transpose()
    }

    async fn upsert_revenue(&self, record: &RevenueRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO revenue_records
                (id, client_id, month, mrr_cents, change_type, change_amount_cents, stripe_invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (client_id, month) DO UPDATE SET
                mrr_cents = EXCLUDED.mrr_cents,
                change_type = EXCLUDED.change_type,
                change_amount_cents = EXCLUDED.change_amount_cents,
                stripe_invoice_id = EXCLUDED.stripe_invoice_id,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.client_id)
        .bind(record.month)
        .bind(record.mrr_cents)
        .bind(record.change_type.as_str())
        .bind(record.change_amount_cents)
        .bind(&record.stripe_invoice_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, client_id, activity_type, description, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.client_id)
        .bind(&entry.activity_type)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn webhook_event_status(
        &self,
        event_id: &str,
    ) -> BillingResult<Option<WebhookEventOutcome>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(result,)| WebhookEventOutcome::parse(&result)))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        outcome: WebhookEventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, stripe_event_id, event_type, processing_result, error_message)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = EXCLUDED.processing_result,
                error_message = EXCLUDED.error_message,
                attempts = webhook_events.attempts + 1,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(outcome.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
