//! Billing identity resolution

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{CreateCustomerRequest, PaymentProcessor};
use crate::store::{BillingStore, Client};

/// Resolves the processor customer for a client, creating it on first use
#[derive(Clone)]
pub struct CustomerResolver {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl CustomerResolver {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    /// Load a client or fail with `NotFound`
    pub async fn get_client(&self, client_id: Uuid) -> BillingResult<Client> {
        self.store
            .get_client(client_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Client {} not found", client_id)))
    }

    /// Get or create the customer reference for an already loaded client.
    ///
    /// If the processor creates the customer but the reference cannot be
    /// stored, the new reference is still returned.
    pub async fn resolve(&self, client: &Client) -> BillingResult<String> {
        if let Some(existing) = client.stripe_customer_id.as_deref().filter(|c| !c.is_empty()) {
            return Ok(existing.to_string());
        }

        let created = self
            .processor
            .create_customer(CreateCustomerRequest {
                client_id: client.id,
                name: client.name.clone(),
                email: client.email.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    client_id = %client.id,
                    step = "create_customer",
                    error = %e,
                    "Failed to create processor customer"
                );
                e
            })?;

        match self
            .store
            .set_client_billing_reference(client.id, &created)
            .await
        {
            Ok(stored) => {
                if stored != created {
                    // Another checkout stored its customer first
                    tracing::warn!(
                        client_id = %client.id,
                        customer_id = %stored,
                        orphaned_customer_id = %created,
                        "Client already had a customer, using the stored one"
                    );
                } else {
                    tracing::info!(
                        client_id = %client.id,
                        customer_id = %created,
                        "Created processor customer for client"
                    );
                }
                Ok(stored)
            }
            Err(e) => {
                tracing::error!(
                    client_id = %client.id,
                    customer_id = %created,
                    step = "persist_customer",
                    error = %e,
                    "Processor customer created but not stored; continuing checkout"
                );
                Ok(created)
            }
        }
    }
}
