//! In-memory billing store for tests and local development

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tierline_shared::{RecommendationStatus, Tier};

use super::{
    accepts_update, merge_update, ActivityEntry, BillingStore, Client, Recommendation,
    RevenueRecord, SubscriptionRecord, SubscriptionUpsert, SubscriptionUpsertOutcome,
    WebhookEventOutcome,
};
use crate::error::{BillingError, BillingResult};

/// A history line as stored (action, details)
pub type HistoryLine = (String, Option<String>);

#[derive(Debug, Clone)]
struct WebhookEventRow {
    event_type: String,
    outcome: WebhookEventOutcome,
    error_message: Option<String>,
    attempts: u32,
}

#[derive(Default)]
struct State {
    clients: HashMap<Uuid, Client>,
    recommendations: HashMap<Uuid, Recommendation>,
    recommendation_history: HashMap<Uuid, Vec<HistoryLine>>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    subscription_history: HashMap<Uuid, Vec<HistoryLine>>,
    revenue: HashMap<(Uuid, Date), RevenueRecord>,
    activity: Vec<ActivityEntry>,
    webhook_events: HashMap<String, WebhookEventRow>,
    failing: HashSet<&'static str>,
}

/// Mutex-guarded maps implementing [`BillingStore`].
///
/// A single lock covers every table, so each trait call is atomic.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("billing store lock poisoned".to_string()))
    }

    fn check_failure(state: &State, operation: &'static str) -> BillingResult<()> {
        if state.failing.contains(operation) {
            return Err(BillingError::Database(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    /// Make every later call of the named trait method fail with a database error
    pub fn fail_operation(&self, operation: &'static str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(operation);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.clear();
        }
    }

    // Seeding

    pub fn insert_client(&self, client: Client) {
        if let Ok(mut state) = self.state.lock() {
            state.clients.insert(client.id, client);
        }
    }

    pub fn insert_recommendation(&self, recommendation: Recommendation) {
        if let Ok(mut state) = self.state.lock() {
            state
                .recommendations
                .insert(recommendation.id, recommendation);
        }
    }

    // Inspection

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.state
            .lock()
            .map(|state| state.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_history(&self, subscription_id: Uuid) -> Vec<HistoryLine> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.subscription_history.get(&subscription_id).cloned())
            .unwrap_or_default()
    }

    pub fn recommendation_history(&self, recommendation_id: Uuid) -> Vec<HistoryLine> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.recommendation_history.get(&recommendation_id).cloned())
            .unwrap_or_default()
    }

    pub fn revenue_records(&self) -> Vec<RevenueRecord> {
        self.state
            .lock()
            .map(|state| state.revenue.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Activity entries for a client, oldest first
    pub fn activities(&self, client_id: Uuid) -> Vec<ActivityEntry> {
        self.state
            .lock()
            .map(|state| {
                state
                    .activity
                    .iter()
                    .filter(|entry| entry.client_id == client_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivery attempts recorded for a webhook event
    pub fn webhook_attempts(&self, event_id: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.webhook_events.get(event_id).map(|row| row.attempts))
            .unwrap_or(0)
    }

    pub fn webhook_error(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .webhook_events
                    .get(event_id)
                    .and_then(|row| row.error_message.clone())
            })
    }

    pub fn webhook_event_type(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.webhook_events.get(event_id).map(|row| row.event_type.clone()))
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_client(&self, client_id: Uuid) -> BillingResult<Option<Client>> {
        let state = self.lock()?;
        Self::check_failure(&state, "get_client")?;
        Ok(state.clients.get(&client_id).cloned())
    }

    async fn set_client_billing_reference(
        &self,
        client_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<String> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "set_client_billing_reference")?;

        let taken = state.clients.values().any(|c| {
            c.id != client_id && c.stripe_customer_id.as_deref() == Some(stripe_customer_id)
        });

        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| BillingError::NotFound(format!("Client {} not found", client_id)))?;

        if let Some(existing) = &client.stripe_customer_id {
            return Ok(existing.clone());
        }
        if taken {
            return Err(BillingError::Database(format!(
                "billing reference {} already belongs to another client",
                stripe_customer_id
            )));
        }

        client.stripe_customer_id = Some(stripe_customer_id.to_string());
        Ok(stripe_customer_id.to_string())
    }

    async fn find_client_by_billing_reference(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<Client>> {
        let state = self.lock()?;
        Ok(state
            .clients
            .values()
            .find(|c| c.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .cloned())
    }

    async fn get_recommendation(
        &self,
        recommendation_id: Uuid,
    ) -> BillingResult<Option<Recommendation>> {
        let state = self.lock()?;
        Ok(state.recommendations.get(&recommendation_id).cloned())
    }

    async fn finalize_recommendation(
        &self,
        recommendation_id: Uuid,
        tier: Tier,
        purchased_at: OffsetDateTime,
        history_detail: &str,
    ) -> BillingResult<bool> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "finalize_recommendation")?;

        let Some(recommendation) = state.recommendations.get_mut(&recommendation_id) else {
            return Ok(false);
        };
        if recommendation.status == RecommendationStatus::Accepted {
            return Ok(false);
        }

        recommendation.status = RecommendationStatus::Accepted;
        recommendation.purchased_tier = Some(tier);
        recommendation.purchased_at = Some(purchased_at);

        state
            .recommendation_history
            .entry(recommendation_id)
            .or_default()
            .push(("purchased".to_string(), Some(history_detail.to_string())));

        Ok(true)
    }

    async fn get_subscription_by_external_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.lock()?;
        Ok(state.subscriptions.get(stripe_subscription_id).cloned())
    }

    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<SubscriptionUpsertOutcome> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "upsert_subscription")?;

        match state.subscriptions.get(&upsert.stripe_subscription_id).cloned() {
            None => {
                let record = SubscriptionRecord {
                    id: Uuid::new_v4(),
                    stripe_subscription_id: upsert.stripe_subscription_id.clone(),
                    client_id: upsert.client_id,
                    recommendation_id: upsert.recommendation_id,
                    stripe_customer_id: upsert.stripe_customer_id.clone(),
                    status: upsert.status,
                    current_period_start: upsert.current_period_start,
                    current_period_end: upsert.current_period_end,
                    canceled_at: upsert.canceled_at,
                    last_event_at: upsert.observed_at,
                };
                state
                    .subscriptions
                    .insert(record.stripe_subscription_id.clone(), record.clone());
                Ok(SubscriptionUpsertOutcome {
                    record,
                    previous_status: None,
                    inserted: true,
                    applied: true,
                })
            }
            Some(current) => {
                if !accepts_update(&current, &upsert) {
                    return Ok(SubscriptionUpsertOutcome {
                        previous_status: Some(current.status),
                        record: current,
                        inserted: false,
                        applied: false,
                    });
                }
                let record = merge_update(&current, &upsert);
                state
                    .subscriptions
                    .insert(record.stripe_subscription_id.clone(), record.clone());
                Ok(SubscriptionUpsertOutcome {
                    record,
                    previous_status: Some(current.status),
                    inserted: false,
                    applied: true,
                })
            }
        }
    }

    async fn append_subscription_history(
        &self,
        subscription_id: Uuid,
        action: &str,
        details: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "append_subscription_history")?;
        state
            .subscription_history
            .entry(subscription_id)
            .or_default()
            .push((action.to_string(), details.map(str::to_string)));
        Ok(())
    }

    async fn get_revenue(&self, client_id: Uuid, month: Date) -> BillingResult<Option<RevenueRecord>> {
        let state = self.lock()?;
        Ok(state.revenue.get(&(client_id, month)).cloned())
    }

    async fn upsert_revenue(&self, record: &RevenueRecord) -> BillingResult<()> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "upsert_revenue")?;
        state
            .revenue
            .insert((record.client_id, record.month), record.clone());
        Ok(())
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> BillingResult<()> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "append_activity")?;
        state.activity.push(entry.clone());
        Ok(())
    }

    async fn webhook_event_status(
        &self,
        event_id: &str,
    ) -> BillingResult<Option<WebhookEventOutcome>> {
        let state = self.lock()?;
        Ok(state.webhook_events.get(event_id).map(|row| row.outcome))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        outcome: WebhookEventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.lock()?;
        Self::check_failure(&state, "record_webhook_event")?;

        let row = state
            .webhook_events
            .entry(event_id.to_string())
            .or_insert_with(|| WebhookEventRow {
                event_type: event_type.to_string(),
                outcome,
                error_message: None,
                attempts: 0,
            });
        row.outcome = outcome;
        row.error_message = error_message.map(str::to_string);
        row.attempts += 1;
        Ok(())
    }
}
