//! InspectionPolicy: runs a per-type test battery and decides pass, rework
//! or rejection.
//!
//! Rework is chosen when more than one test fails, or when exactly one fails
//! and a roll against the rework rate hits. A product already reworked
//! `max_passes` times is rejected instead of being sent back again.

use crate::pipeline::error::{PolicyError, PolicyResult};
use crate::pipeline::policy::{PolicyContext, PolicyOutcome};
use crate::types::{Product, ProductState, ProductType};

/// Outcome of a single quality test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub name: &'static str,
    pub passed: bool,
}

/// Quality tests per product type.
pub fn test_battery(product_type: ProductType) -> &'static [&'static str] {
    match product_type {
        ProductType::Washer => &[
            "Water seal test",
            "Motor function test",
            "Control panel test",
            "Drum alignment test",
        ],
        ProductType::Dryer => &[
            "Heating test",
            "Ventilation test",
            "Control panel test",
            "Safety interlock test",
        ],
        ProductType::Refrigerator => &[
            "Cooling test",
            "Insulation test",
            "Door seal test",
            "Temperature control test",
        ],
        ProductType::Dishwasher => &[
            "Water pressure test",
            "Spray pattern test",
            "Control panel test",
            "Drainage test",
        ],
        ProductType::Oven => &[
            "Heating uniformity test",
            "Insulation test",
            "Control panel test",
            "Safety test",
        ],
    }
}

pub struct InspectionPolicy;

impl InspectionPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "Quality Inspection"
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        if product.state() != ProductState::AtQualityInspection {
            return Err(PolicyError::InvalidState {
                expected: "AtQualityInspection",
                found: product.state(),
            });
        }

        let results = self.run_tests(product, ctx);

        if ctx.should_reject() {
            product.reject();
            tracing::debug!("Product {} failed quality inspection - REJECTED", product.id());
            return Ok(PolicyOutcome::Rejected("failed quality inspection".into()));
        }

        if self.needs_rework(&results, ctx) {
            if product.rework_count() >= ctx.rework.max_passes {
                product.reject();
                tracing::debug!(
                    "Product {} needs rework after {} passes - REJECTED",
                    product.id(),
                    product.rework_count()
                );
                return Ok(PolicyOutcome::Rejected("rework limit exceeded".into()));
            }

            product.add_trace_entry("Quality Inspection - Rework Required");
            product.send_to_rework();
            tracing::debug!("Product {} requires rework", product.id());
            return Ok(PolicyOutcome::Rework);
        }

        product.add_trace_entry("Quality Inspection - Passed");
        product.advance();

        let passed = results.iter().filter(|r| r.passed).count();
        tracing::trace!(
            "Product {} passed quality inspection ({}/{} tests passed)",
            product.id(),
            passed,
            results.len()
        );
        Ok(PolicyOutcome::Accepted)
    }

    fn run_tests(&self, product: &Product, ctx: &mut PolicyContext<'_>) -> Vec<TestResult> {
        ctx.simulate_work(1);

        let pass_probability = ctx.rework.test_pass_probability;
        test_battery(product.product_type())
            .iter()
            .map(|&name| TestResult {
                name,
                passed: ctx.chance(pass_probability),
            })
            .collect()
    }

    fn needs_rework(&self, results: &[TestResult], ctx: &mut PolicyContext<'_>) -> bool {
        match results.iter().filter(|r| !r.passed).count() {
            0 => false,
            1 => {
                let rate = ctx.rework.rework_rate;
                ctx.chance(rate)
            }
            _ => true,
        }
    }
}

impl Default for InspectionPolicy {
    fn default() -> Self {
        Self::new()
    }
}
