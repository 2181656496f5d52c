//! Processing policy abstraction.
//!
//! Two-layer design:
//! - **`StagePolicy` trait** for user-supplied policies (tests, experiments).
//! - **`BuiltinPolicy` enum** for the five built-in stage policies, dispatched
//!   with a plain `match` on the hot path.
//!
//! `AnyPolicy` wraps either variant so a station can hold both uniformly.
//!
//! A policy only sees the product and its [`PolicyContext`]. It never touches
//! channels or other stations; routing (forward, rework, drop) is decided by
//! the station from the returned [`PolicyOutcome`].

use crate::config::{ReworkConfig, StationConfig};
use crate::pipeline::error::PolicyResult;
use crate::pipeline::id::StageKind;
use crate::pipeline::policies::{
    AssemblerPolicy, InspectionPolicy, IntakePolicy, PackagingPolicy, ShippingPolicy,
};
use crate::types::Product;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::time::Duration;

/// Result of running a policy on one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Forward to the downstream channel (or finish, at the terminal stage).
    Accepted,
    /// Drop the product. The reason ends up in the rejection event.
    Rejected(String),
    /// Route the product back to assembly.
    Rework,
}

/// Everything a policy may consult while processing one product.
pub struct PolicyContext<'a> {
    pub stage: StageKind,
    pub settings: &'a StationConfig,
    pub rework: &'a ReworkConfig,
    pub rng: &'a mut StdRng,
}

impl<'a> PolicyContext<'a> {
    /// Roll against the stage failure rate.
    pub fn should_reject(&mut self) -> bool {
        self.chance(self.settings.failure_rate)
    }

    /// True with probability `p`. Values outside `[0, 1]` saturate.
    pub fn chance(&mut self, p: f64) -> bool {
        if !(p > 0.0) {
            false
        } else if p >= 1.0 {
            true
        } else {
            self.rng.random_bool(p)
        }
    }

    /// A processing time drawn uniformly from the configured range.
    pub fn processing_time(&mut self) -> Duration {
        let min = self.settings.min_processing_ms;
        let max = self.settings.max_processing_ms;
        let ms = if max > min {
            self.rng.random_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    /// Sleep for a share of one processing time, e.g. one of `steps` steps.
    pub fn simulate_work(&mut self, steps: u32) {
        let share = self.processing_time() / steps.max(1);
        if !share.is_zero() {
            std::thread::sleep(share);
        }
    }

    /// Pick one entry of a non-empty list.
    pub fn pick<'s>(&mut self, options: &'s [&'s str]) -> &'s str {
        options.choose(&mut *self.rng).copied().unwrap_or_default()
    }
}

/// Trait for user-defined policies.
pub trait StagePolicy: Send {
    /// Human-readable name of this policy.
    fn name(&self) -> &str;

    /// Decide what happens to `product`, mutating its state and trace.
    ///
    /// Returning `Err` (or panicking) is a fault: the station reports it and
    /// drops the product.
    fn process(&mut self, product: &mut Product, ctx: &mut PolicyContext<'_>)
        -> PolicyResult<PolicyOutcome>;
}

/// Enum dispatch for the built-in stage policies.
pub enum BuiltinPolicy {
    Intake(IntakePolicy),
    Assembler(AssemblerPolicy),
    Inspection(InspectionPolicy),
    Packaging(PackagingPolicy),
    Shipping(ShippingPolicy),
}

impl BuiltinPolicy {
    /// The default policy for a stage of the fixed topology.
    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Intake => BuiltinPolicy::Intake(IntakePolicy::new()),
            StageKind::Assembler => BuiltinPolicy::Assembler(AssemblerPolicy::new()),
            StageKind::QualityInspection => BuiltinPolicy::Inspection(InspectionPolicy::new()),
            StageKind::Packaging => BuiltinPolicy::Packaging(PackagingPolicy::new()),
            StageKind::Shipping => BuiltinPolicy::Shipping(ShippingPolicy::new()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BuiltinPolicy::Intake(p) => p.name(),
            BuiltinPolicy::Assembler(p) => p.name(),
            BuiltinPolicy::Inspection(p) => p.name(),
            BuiltinPolicy::Packaging(p) => p.name(),
            BuiltinPolicy::Shipping(p) => p.name(),
        }
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        match self {
            BuiltinPolicy::Intake(p) => p.process(product, ctx),
            BuiltinPolicy::Assembler(p) => p.process(product, ctx),
            BuiltinPolicy::Inspection(p) => p.process(product, ctx),
            BuiltinPolicy::Packaging(p) => p.process(product, ctx),
            BuiltinPolicy::Shipping(p) => p.process(product, ctx),
        }
    }
}

/// Wrapper that holds either a built-in policy or a custom one.
pub enum AnyPolicy {
    Builtin(BuiltinPolicy),
    Custom(Box<dyn StagePolicy>),
}

impl AnyPolicy {
    pub fn builtin(stage: StageKind) -> Self {
        AnyPolicy::Builtin(BuiltinPolicy::for_stage(stage))
    }

    pub fn custom(policy: impl StagePolicy + 'static) -> Self {
        AnyPolicy::Custom(Box::new(policy))
    }

    pub fn name(&self) -> &str {
        match self {
            AnyPolicy::Builtin(p) => p.name(),
            AnyPolicy::Custom(p) => p.name(),
        }
    }

    pub fn process(
        &mut self,
        product: &mut Product,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyResult<PolicyOutcome> {
        match self {
            AnyPolicy::Builtin(p) => p.process(product, ctx),
            AnyPolicy::Custom(p) => p.process(product, ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand::SeedableRng;

    /// Owns everything a `PolicyContext` borrows.
    pub struct ContextFixture {
        pub stage: StageKind,
        pub settings: StationConfig,
        pub rework: ReworkConfig,
        pub rng: StdRng,
    }

    impl ContextFixture {
        /// Zero processing time, zero failure rate, fixed seed.
        pub fn new(stage: StageKind) -> Self {
            Self {
                stage,
                settings: StationConfig {
                    min_processing_ms: 0,
                    max_processing_ms: 0,
                    failure_rate: 0.0,
                },
                rework: ReworkConfig::default(),
                rng: StdRng::seed_from_u64(7),
            }
        }

        pub fn failure_rate(mut self, rate: f64) -> Self {
            self.settings.failure_rate = rate;
            self
        }

        pub fn ctx(&mut self) -> PolicyContext<'_> {
            PolicyContext {
                stage: self.stage,
                settings: &self.settings,
                rework: &self.rework,
                rng: &mut self.rng,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ContextFixture;
    use super::*;
    use crate::pipeline::error::PolicyError;
    use crate::types::{ProductState, ProductType};

    struct AlwaysReject;

    impl StagePolicy for AlwaysReject {
        fn name(&self) -> &str {
            "AlwaysReject"
        }

        fn process(
            &mut self,
            product: &mut Product,
            _ctx: &mut PolicyContext<'_>,
        ) -> PolicyResult<PolicyOutcome> {
            product.reject();
            Ok(PolicyOutcome::Rejected("nope".into()))
        }
    }

    #[test]
    fn test_chance_saturates() {
        let mut fixture = ContextFixture::new(StageKind::Assembler);
        let mut ctx = fixture.ctx();
        assert!(!ctx.chance(0.0));
        assert!(!ctx.chance(-1.0));
        assert!(!ctx.chance(f64::NAN));
        assert!(ctx.chance(1.0));
        assert!(ctx.chance(2.0));
    }

    #[test]
    fn test_processing_time_within_range() {
        let mut fixture = ContextFixture::new(StageKind::Packaging);
        fixture.settings.min_processing_ms = 10;
        fixture.settings.max_processing_ms = 20;
        let mut ctx = fixture.ctx();
        for _ in 0..100 {
            let t = ctx.processing_time();
            assert!(t >= Duration::from_millis(10) && t <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_degenerate_range_uses_min() {
        let mut fixture = ContextFixture::new(StageKind::Packaging);
        fixture.settings.min_processing_ms = 30;
        fixture.settings.max_processing_ms = 5;
        assert_eq!(fixture.ctx().processing_time(), Duration::from_millis(30));
    }

    #[test]
    fn test_custom_policy_dispatch() {
        let mut policy = AnyPolicy::custom(AlwaysReject);
        assert_eq!(policy.name(), "AlwaysReject");

        let mut fixture = ContextFixture::new(StageKind::Packaging);
        let mut product = Product::new(ProductType::Oven);
        let outcome = policy.process(&mut product, &mut fixture.ctx()).unwrap();
        assert_eq!(outcome, PolicyOutcome::Rejected("nope".into()));
        assert_eq!(product.state(), ProductState::Rejected);
    }

    #[test]
    fn test_builtin_names_match_stages() {
        for stage in StageKind::ALL {
            assert_eq!(AnyPolicy::builtin(stage).name(), stage.name());
        }
    }

    #[test]
    fn test_builtin_rejects_wrong_state() {
        let mut policy = AnyPolicy::builtin(StageKind::Packaging);
        let mut fixture = ContextFixture::new(StageKind::Packaging);
        let mut product = Product::new(ProductType::Dryer);

        let err = policy.process(&mut product, &mut fixture.ctx()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidState { .. }));
    }
}
