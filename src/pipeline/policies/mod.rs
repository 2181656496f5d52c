//! Built-in stage policies.

pub mod assembler;
pub mod inspection;
pub mod intake;
pub mod packaging;
pub mod shipping;

pub use assembler::AssemblerPolicy;
pub use inspection::{InspectionPolicy, TestResult};
pub use intake::IntakePolicy;
pub use packaging::{PackageSpec, PackagingPolicy};
pub use shipping::ShippingPolicy;
