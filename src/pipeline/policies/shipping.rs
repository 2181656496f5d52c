//! ShippingPolicy: assigns a shipment and finishes the product.

use crate::pipeline::error::{PolicyError, PolicyResult};
use crate::pipeline::policy::{PolicyContext, PolicyOutcome};
use crate::types::{Product, ProductState, ProductType, Shipment};
use chrono::{TimeDelta, Utc};
use rand::Rng;
use uuid::Uuid;

pub const DESTINATIONS: &[&str] = &[
    "New York",
    "Los Angeles",
    "Chicago",
    "Houston",
    "Phoenix",
    "Philadelphia",
    "San Antonio",
    "San Diego",
    "Dallas",
    "San Jose",
];

pub const METHODS: &[&str] = &["Standard Ground", "Express", "Next Day Air", "Freight"];

const FREIGHT: &str = "Freight";

pub struct ShippingPolicy;

impl ShippingPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "Shipping"
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        if product.state() != ProductState::AtShipping {
            return Err(PolicyError::InvalidState {
                expected: "AtShipping",
                found: product.state(),
            });
        }

        if ctx.should_reject() {
            product.reject();
            tracing::debug!("Shipping preparation failed for product {} - package damaged", product.id());
            return Ok(PolicyOutcome::Rejected("package damaged".into()));
        }

        let shipment = self.plan_shipment(product.product_type(), ctx);
        tracing::trace!("Processing shipment for product {} to {}", product.id(), shipment.destination);

        ctx.simulate_work(4);
        tracing::trace!("Generated shipping label for product {}", product.id());
        ctx.simulate_work(4);
        tracing::trace!("Product {} loaded for {} shipping", product.id(), shipment.method);
        ctx.simulate_work(4);
        tracing::trace!(
            "Tracking number {} assigned to product {}",
            shipment.tracking_number,
            product.id()
        );
        ctx.simulate_work(4);

        product.add_trace_entry(format!(
            "Shipping - {} to {}",
            shipment.method, shipment.destination
        ));
        tracing::debug!(
            "Product {} shipped to {} via {} (Tracking: {})",
            product.id(),
            shipment.destination,
            shipment.method,
            shipment.tracking_number
        );
        product.set_shipment(shipment);
        product.advance();

        Ok(PolicyOutcome::Accepted)
    }

    fn plan_shipment(&self, product_type: ProductType, ctx: &mut PolicyContext<'_>) -> Shipment {
        let destination = ctx.pick(DESTINATIONS).to_string();
        // Refrigerators are too heavy for parcel services
        let method = if product_type == ProductType::Refrigerator {
            FREIGHT
        } else {
            ctx.pick(METHODS)
        };
        let days = delivery_days(method, ctx);

        Shipment {
            destination,
            method: method.to_string(),
            tracking_number: tracking_number(ctx),
            estimated_delivery: Utc::now() + TimeDelta::days(days),
        }
    }
}

impl Default for ShippingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// `1Z`, six digits, then eight upper-case hex characters.
fn tracking_number(ctx: &mut PolicyContext<'_>) -> String {
    let digits: u32 = ctx.rng.random_range(100_000..1_000_000);
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("1Z{digits}{suffix}")
}

fn delivery_days(method: &str, ctx: &mut PolicyContext<'_>) -> i64 {
    match method {
        "Next Day Air" => 1,
        "Express" => ctx.rng.random_range(2..=3),
        "Standard Ground" => ctx.rng.random_range(5..=7),
        FREIGHT => ctx.rng.random_range(7..=13),
        _ => 0,
    }
}
