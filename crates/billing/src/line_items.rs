//! Cart to processor line items
//!
//! Monthly items become recurring subscription items with their free units
//! removed; one-time items are attached to the subscription's first invoice.

use serde::{Deserialize, Serialize};

use tierline_shared::BillingCadence;

use crate::error::{BillingError, BillingResult};
use crate::processor::{InvoiceItemRequest, SubscriptionItemRequest};

fn default_quantity() -> u64 {
    1
}

/// A selected item as sent by the checkout UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub name: String,
    #[serde(rename = "type")]
    pub cadence: BillingCadence,
    #[serde(default = "default_quantity")]
    pub quantity: u64,
    /// Unit price in cents
    #[serde(default)]
    pub unit_price: i64,
    /// Units granted at no charge
    #[serde(default)]
    pub free_quantity: Option<u64>,
    /// Included at no charge; never billed
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub stripe_monthly_price_id: Option<String>,
    #[serde(default)]
    pub stripe_onetime_price_id: Option<String>,
}

impl CartItem {
    /// Billed quantity after free units; never negative
    pub fn paid_quantity(&self) -> u64 {
        let free = self.free_quantity.unwrap_or(0).min(self.quantity);
        self.quantity - free
    }
}

/// Line items ready for a subscription create call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineItems {
    pub subscription_items: Vec<SubscriptionItemRequest>,
    pub invoice_items: Vec<InvoiceItemRequest>,
    /// Expected recurring amount in cents
    pub monthly_total: i64,
    /// Expected one-time amount in cents
    pub onetime_total: i64,
}

/// Build recurring and one-time line items from a cart.
///
/// Fails with a validation error when no payable monthly item remains; such
/// carts belong to the one-time checkout.
pub fn build_line_items(cart: &[CartItem]) -> BillingResult<LineItems> {
    let mut items = LineItems::default();
    let mut excluded_monthly = 0usize;

    for item in cart.iter().filter(|item| !item.is_free) {
        match item.cadence {
            BillingCadence::Monthly => {
                let paid = item.paid_quantity();
                if paid == 0 {
                    continue;
                }
                let Some(price_id) = non_empty(&item.stripe_monthly_price_id) else {
                    excluded_monthly += 1;
                    tracing::warn!(item = %item.name, "Monthly item has no processor price, excluding");
                    continue;
                };
                items.subscription_items.push(SubscriptionItemRequest {
                    price_id: price_id.to_string(),
                    quantity: paid,
                });
                items.monthly_total = add_cents(items.monthly_total, line_amount(item, paid)?)?;
            }
            BillingCadence::OneTime => {
                if item.quantity == 0 {
                    continue;
                }
                let amount = line_amount(item, item.quantity)?;
                let Some(price_id) = non_empty(&item.stripe_onetime_price_id) else {
                    tracing::warn!(item = %item.name, "One-time item has no processor price, excluding");
                    continue;
                };
                items.invoice_items.push(InvoiceItemRequest {
                    price_id: price_id.to_string(),
                    quantity: item.quantity,
                });
                items.onetime_total = add_cents(items.onetime_total, amount)?;
            }
        }
    }

    if items.subscription_items.is_empty() {
        let reason = if excluded_monthly > 0 {
            "Monthly items are missing processor prices"
        } else {
            "No monthly items to subscribe to"
        };
        return Err(BillingError::Validation(format!(
            "{}; use the one-time checkout for one-time purchases",
            reason
        )));
    }

    Ok(items)
}

/// Total of a one-time-only cart in cents.
///
/// Rejects carts that still contain payable monthly items, and carts with
/// nothing to pay.
pub fn one_time_total(cart: &[CartItem]) -> BillingResult<i64> {
    let payable = cart.iter().filter(|item| !item.is_free);

    let mut total = 0i64;
    for item in payable {
        match item.cadence {
            BillingCadence::Monthly if item.paid_quantity() > 0 => {
                return Err(BillingError::Validation(
                    "Cart contains monthly items; use the subscription checkout".to_string(),
                ));
            }
            BillingCadence::Monthly => {}
            BillingCadence::OneTime => {
                total = add_cents(total, line_amount(item, item.quantity)?)?;
            }
        }
    }

    if total <= 0 {
        return Err(BillingError::Validation(
            "No payable one-time items in cart".to_string(),
        ));
    }
    Ok(total)
}

/// `unit_price × quantity` for one cart line, rejecting negative prices and
/// amounts that do not fit in cents
fn line_amount(item: &CartItem, quantity: u64) -> BillingResult<i64> {
    if item.unit_price < 0 {
        return Err(BillingError::Validation(format!(
            "Item '{}' has a negative unit price",
            item.name
        )));
    }
    i64::try_from(quantity)
        .ok()
        .and_then(|quantity| item.unit_price.checked_mul(quantity))
        .ok_or_else(|| {
            BillingError::Validation(format!("Item '{}' amount is out of range", item.name))
        })
}

fn add_cents(total: i64, amount: i64) -> BillingResult<i64> {
    total
        .checked_add(amount)
        .ok_or_else(|| BillingError::Validation("Cart total is out of range".to_string()))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
