//! PackagingPolicy: boxes the inspected product according to its type.

use crate::pipeline::error::{PolicyError, PolicyResult};
use crate::pipeline::policy::{PolicyContext, PolicyOutcome};
use crate::types::{Product, ProductState, ProductType};

const PACKAGING_STEPS: &[&str] = &[
    "Prepare packaging materials",
    "Place product in protective materials",
    "Add accessories and documentation",
    "Seal and label package",
    "Quality check package integrity",
];

/// Packaging specification for one product type.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSpec {
    pub box_type: &'static str,
    pub materials: &'static [&'static str],
    pub accessories: &'static [&'static str],
    pub estimated_weight_kg: u32,
}

impl PackageSpec {
    pub fn for_type(product_type: ProductType) -> Self {
        match product_type {
            ProductType::Washer => PackageSpec {
                box_type: "Heavy-duty cardboard box with foam inserts",
                materials: &["Foam padding", "Plastic wrap", "Cardboard reinforcement"],
                accessories: &["User manual", "Warranty card", "Installation kit", "Hoses"],
                estimated_weight_kg: 75,
            },
            ProductType::Dryer => PackageSpec {
                box_type: "Standard appliance box with corner protection",
                materials: &["Corner protectors", "Plastic wrap", "Foam inserts"],
                accessories: &["User manual", "Warranty card", "Vent kit", "Power cord"],
                estimated_weight_kg: 68,
            },
            ProductType::Refrigerator => PackageSpec {
                box_type: "Extra-large appliance box with strapping",
                materials: &["Heavy foam padding", "Plastic wrap", "Strapping bands"],
                accessories: &["User manual", "Warranty card", "Ice maker kit", "Shelves"],
                estimated_weight_kg: 125,
            },
            ProductType::Dishwasher => PackageSpec {
                box_type: "Medium appliance box with protective wrap",
                materials: &["Bubble wrap", "Foam corners", "Plastic covering"],
                accessories: &["User manual", "Warranty card", "Installation kit", "Dish racks"],
                estimated_weight_kg: 58,
            },
            ProductType::Oven => PackageSpec {
                box_type: "Reinforced appliance box with thermal protection",
                materials: &["Thermal padding", "Protective wrap", "Corner guards"],
                accessories: &["User manual", "Warranty card", "Oven racks", "Baking tray"],
                estimated_weight_kg: 82,
            },
        }
    }
}

pub struct PackagingPolicy;

impl PackagingPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "Packaging"
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        if product.state() != ProductState::AtPackaging {
            return Err(PolicyError::InvalidState {
                expected: "AtPackaging",
                found: product.state(),
            });
        }

        if ctx.should_reject() {
            product.reject();
            tracing::debug!("Packaging failed for product {} - damaged during packaging", product.id());
            return Ok(PolicyOutcome::Rejected("damaged during packaging".into()));
        }

        let spec = PackageSpec::for_type(product.product_type());
        tracing::trace!("Starting packaging for product {} with {}", product.id(), spec.box_type);

        for step in PACKAGING_STEPS {
            tracing::trace!("Packaging step: {} for product {}", step, product.id());
            ctx.simulate_work(PACKAGING_STEPS.len() as u32);
        }

        product.add_trace_entry("Packaging");
        product.advance();

        tracing::trace!(
            "Packaged product {} (estimated weight: {} kg)",
            product.id(),
            spec.estimated_weight_kg
        );
        Ok(PolicyOutcome::Accepted)
    }
}

impl Default for PackagingPolicy {
    fn default() -> Self {
        Self::new()
    }
}
