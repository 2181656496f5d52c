//! IntakePolicy: admits freshly generated products onto the line.

use crate::pipeline::error::{PolicyError, PolicyResult};
use crate::pipeline::policy::{PolicyContext, PolicyOutcome};
use crate::types::{Product, ProductState};

/// Source-stage policy. Stamps the product as taken in and hands it on to
/// assembly. Intake failures are rare; the default failure rate is zero.
pub struct IntakePolicy;

impl IntakePolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "Intake"
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        if product.state() != ProductState::Created {
            return Err(PolicyError::InvalidState {
                expected: "Created",
                found: product.state(),
            });
        }

        ctx.simulate_work(1);

        if ctx.should_reject() {
            product.reject();
            tracing::debug!("Intake refused product {} ({})", product.id(), product.product_type());
            return Ok(PolicyOutcome::Rejected("refused at intake".into()));
        }

        product.set_state(ProductState::AtIntake);
        product.add_trace_entry("Intake");
        product.advance();

        tracing::trace!("Processed product {} ({})", product.id(), product.product_type());
        Ok(PolicyOutcome::Accepted)
    }
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self::new()
    }
}
