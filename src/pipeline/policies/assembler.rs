//! AssemblerPolicy: builds the appliance in a fixed sequence of steps.
//!
//! Products returning from inspection arrive in `InRework` on the same input
//! channel and are assembled again exactly like a fresh arrival.

use crate::pipeline::error::{PolicyError, PolicyResult};
use crate::pipeline::policy::{PolicyContext, PolicyOutcome};
use crate::types::{Product, ProductState, ProductType};

/// Assembly steps per product type, in order.
pub fn assembly_steps(product_type: ProductType) -> &'static [&'static str] {
    match product_type {
        ProductType::Washer => &[
            "Install drum",
            "Connect motor",
            "Install control panel",
            "Add door seal",
        ],
        ProductType::Dryer => &[
            "Install heating element",
            "Connect ventilation",
            "Install control panel",
            "Add lint filter",
        ],
        ProductType::Refrigerator => &[
            "Install compressor",
            "Add insulation",
            "Install shelves",
            "Connect cooling system",
        ],
        ProductType::Dishwasher => &[
            "Install spray arms",
            "Connect pump",
            "Install control panel",
            "Add door seals",
        ],
        ProductType::Oven => &[
            "Install heating elements",
            "Add insulation",
            "Install control panel",
            "Connect gas/electric",
        ],
    }
}

pub struct AssemblerPolicy;

impl AssemblerPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "Assembler"
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        let reworking = match product.state() {
            ProductState::AtAssembler => false,
            ProductState::InRework => true,
            found => {
                return Err(PolicyError::InvalidState {
                    expected: "AtAssembler or InRework",
                    found,
                })
            }
        };

        if ctx.should_reject() {
            product.reject();
            tracing::debug!("Assembly failed for product {}", product.id());
            return Ok(PolicyOutcome::Rejected("assembly failed".into()));
        }

        if reworking {
            // InRework -> AtAssembler, clears the rework flag
            product.advance();
        }

        let steps = assembly_steps(product.product_type());
        for step in steps {
            tracing::trace!("Performing {} for product {}", step, product.id());
            ctx.simulate_work(steps.len() as u32);
        }

        product.set_state(ProductState::AtAssembler);
        product.add_trace_entry(if reworking { "Assembler - Rework" } else { "Assembler" });
        product.advance();

        tracing::trace!(
            "Assembled product {} with {} steps{}",
            product.id(),
            steps.len(),
            if reworking { " (rework)" } else { "" }
        );
        Ok(PolicyOutcome::Accepted)
    }
}

impl Default for AssemblerPolicy {
    fn default() -> Self {
        Self::new()
    }
}
