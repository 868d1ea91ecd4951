//! Monthly recurring revenue ledger
//!
//! One record per client and calendar month. Each paid invoice replaces the
//! month's value, so redelivery of the same event cannot inflate revenue.

use std::sync::Arc;

use tierline_shared::{from_unix, month_start, previous_month, RevenueChangeType};

use crate::error::BillingResult;
use crate::payloads::{InvoiceObject, ProcessorEvent};
use crate::store::{BillingStore, RevenueRecord};

pub struct RevenueLedger {
    store: Arc<dyn BillingStore>,
}

impl RevenueLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Record a paid subscription invoice.
    ///
    /// Invoices for subscriptions without a local row are skipped.
    pub async fn record_invoice_payment(
        &self,
        event: &ProcessorEvent,
        invoice: &InvoiceObject,
    ) -> BillingResult<Option<RevenueRecord>> {
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice is not for a subscription, skipping");
            return Ok(None);
        };

        let Some(subscription) = self
            .store
            .get_subscription_by_external_ref(subscription_id)
            .await?
        else {
            tracing::debug!(
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Invoice for untracked subscription, skipping"
            );
            return Ok(None);
        };

        let paid_at = from_unix(invoice.paid_at().unwrap_or(event.created))?;
        let month = month_start(paid_at);
        let change_type = RevenueChangeType::from_billing_reason(invoice.billing_reason.as_deref());

        let change_amount_cents = match change_type {
            RevenueChangeType::New => invoice.amount_paid,
            RevenueChangeType::Recurring => {
                let previous = self
                    .store
                    .get_revenue(subscription.client_id, previous_month(month))
                    .await?;
                invoice.amount_paid - previous.map(|r| r.mrr_cents).unwrap_or(0)
            }
        };

        let record = RevenueRecord {
            client_id: subscription.client_id,
            month,
            mrr_cents: invoice.amount_paid,
            change_type,
            change_amount_cents,
            stripe_invoice_id: Some(invoice.id.clone()),
        };
        self.store.upsert_revenue(&record).await?;

        tracing::info!(
            client_id = %record.client_id,
            invoice_id = %invoice.id,
            month = %record.month,
            mrr_cents = record.mrr_cents,
            change_type = %record.change_type,
            "Recorded monthly revenue"
        );

        Ok(Some(record))
    }
}
