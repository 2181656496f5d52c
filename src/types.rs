//! Core data types for the production line
//!
//! This module contains the product model that flows through the pipeline.
//!
//! # Main Types
//!
//! - [`ProductId`] - Opaque identity, stable for a product's lifetime
//! - [`ProductType`] - The fixed set of appliance kinds the line builds
//! - [`ProductState`] - Lifecycle state machine (see [`Product::advance`])
//! - [`TraceEntry`] - One `(stage, timestamp)` record in a product's trace log
//! - [`Product`] - The unit of work handed between stations
//!
//! # Ownership
//!
//! A `Product` is moved, never shared: the station holding it is the only code
//! that can mutate it, and handing it to a channel gives that ownership away.
//! Products therefore carry no lock of their own.
//!
//! # State Machine
//!
//! ```text
//! Created → AtIntake → AtAssembler → AtQualityInspection → AtPackaging → AtShipping → Finished
//!                          ▲                 │
//!                          └──── InRework ◄──┘
//! ```
//!
//! `Rejected` is reachable from any processing stage and is absorbing, as is
//! `Finished`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque product identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(Uuid);

impl ProductId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProductId({})", self.0)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for log lines; the full uuid is in Debug
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// Kinds of appliance produced by the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    Washer,
    Dryer,
    Refrigerator,
    Dishwasher,
    Oven,
}

impl ProductType {
    /// All product kinds, in declaration order
    pub fn all() -> &'static [ProductType] {
        &[
            ProductType::Washer,
            ProductType::Dryer,
            ProductType::Refrigerator,
            ProductType::Dishwasher,
            ProductType::Oven,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProductType::Washer => "Washer",
            ProductType::Dryer => "Dryer",
            ProductType::Refrigerator => "Refrigerator",
            ProductType::Dishwasher => "Dishwasher",
            ProductType::Oven => "Oven",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Lifecycle state of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProductState {
    #[default]
    Created,
    AtIntake,
    AtAssembler,
    AtQualityInspection,
    AtPackaging,
    AtShipping,
    Finished,
    Rejected,
    /// Routed back from inspection; the assembler treats it as a fresh arrival
    InRework,
}

impl ProductState {
    /// Returns true for the absorbing states
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProductState::Finished | ProductState::Rejected)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProductState::Created => "Created",
            ProductState::AtIntake => "At Intake",
            ProductState::AtAssembler => "At Assembler",
            ProductState::AtQualityInspection => "At Quality Inspection",
            ProductState::AtPackaging => "At Packaging",
            ProductState::AtShipping => "At Shipping",
            ProductState::Finished => "Finished",
            ProductState::Rejected => "Rejected",
            ProductState::InRework => "In Rework",
        }
    }
}

impl fmt::Display for ProductState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One entry in a product's trace log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Stage label, possibly with a short outcome ("Quality Inspection - Passed")
    pub stage: String,
    pub at: DateTime<Utc>,
}

/// Shipping details assigned by the final stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub destination: String,
    pub method: String,
    pub tracking_number: String,
    pub estimated_delivery: DateTime<Utc>,
}

/// A unit of work moving through the line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    product_type: ProductType,
    state: ProductState,
    created_at: DateTime<Utc>,
    trace: Vec<TraceEntry>,
    in_rework: bool,
    #[serde(default)]
    rework_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shipment: Option<Shipment>,
}

impl Product {
    pub fn new(product_type: ProductType) -> Self {
        Self {
            id: ProductId::new(),
            product_type,
            state: ProductState::Created,
            created_at: Utc::now(),
            trace: Vec::new(),
            in_rework: false,
            rework_count: 0,
            shipment: None,
        }
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn state(&self) -> ProductState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn is_in_rework(&self) -> bool {
        self.in_rework
    }

    /// Number of times inspection has sent this product back to assembly
    pub fn rework_count(&self) -> u32 {
        self.rework_count
    }

    pub fn shipment(&self) -> Option<&Shipment> {
        self.shipment.as_ref()
    }

    pub fn set_state(&mut self, state: ProductState) {
        self.state = state;
    }

    pub fn set_shipment(&mut self, shipment: Shipment) {
        self.shipment = Some(shipment);
    }

    /// Append a trace entry stamped with the current time.
    pub fn add_trace_entry(&mut self, stage: impl Into<String>) {
        self.trace.push(TraceEntry {
            stage: stage.into(),
            at: Utc::now(),
        });
    }

    /// Mark the product for rework and move it into `InRework`.
    pub fn send_to_rework(&mut self) {
        self.in_rework = true;
        self.rework_count += 1;
        self.state = ProductState::InRework;
    }

    /// Mark the product rejected. Absorbing.
    pub fn reject(&mut self) {
        self.state = ProductState::Rejected;
    }

    /// Advance along the forward edge of the state machine.
    ///
    /// `AtQualityInspection` follows the rework edge back to `AtAssembler` when
    /// the rework flag is set (clearing it). Terminal states do not move.
    pub fn advance(&mut self) {
        self.state = match self.state {
            ProductState::Created => ProductState::AtIntake,
            ProductState::AtIntake => ProductState::AtAssembler,
            ProductState::AtAssembler => ProductState::AtQualityInspection,
            ProductState::AtQualityInspection => {
                if self.in_rework {
                    self.in_rework = false;
                    ProductState::AtAssembler
                } else {
                    ProductState::AtPackaging
                }
            }
            ProductState::AtPackaging => ProductState::AtShipping,
            ProductState::AtShipping => ProductState::Finished,
            ProductState::InRework => {
                self.in_rework = false;
                ProductState::AtAssembler
            }
            terminal @ (ProductState::Finished | ProductState::Rejected) => terminal,
        };
    }

    /// One-line human readable summary
    pub fn info(&self) -> String {
        format!(
            "Product ID: {}, Type: {}, State: {}, Created: {}",
            self.id,
            self.product_type,
            self.state,
            self.created_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_reaches_finished() {
        let mut product = Product::new(ProductType::Washer);
        let expected = [
            ProductState::AtIntake,
            ProductState::AtAssembler,
            ProductState::AtQualityInspection,
            ProductState::AtPackaging,
            ProductState::AtShipping,
            ProductState::Finished,
        ];
        for state in expected {
            product.advance();
            assert_eq!(product.state(), state);
        }

        // Finished is absorbing
        product.advance();
        assert_eq!(product.state(), ProductState::Finished);
    }

    #[test]
    fn test_rework_edge_returns_to_assembler() {
        let mut product = Product::new(ProductType::Oven);
        product.set_state(ProductState::AtQualityInspection);
        product.send_to_rework();
        assert_eq!(product.state(), ProductState::InRework);
        assert!(product.is_in_rework());
        assert_eq!(product.rework_count(), 1);

        product.advance();
        assert_eq!(product.state(), ProductState::AtAssembler);
        assert!(!product.is_in_rework());
    }

    #[test]
    fn test_inspection_with_rework_flag_goes_back() {
        let mut product = Product::new(ProductType::Dryer);
        product.set_state(ProductState::AtQualityInspection);
        product.in_rework = true;
        product.advance();
        assert_eq!(product.state(), ProductState::AtAssembler);
    }

    #[test]
    fn test_rejected_is_absorbing() {
        let mut product = Product::new(ProductType::Dishwasher);
        product.advance();
        product.reject();
        assert!(product.state().is_terminal());
        product.advance();
        assert_eq!(product.state(), ProductState::Rejected);
    }

    #[test]
    fn test_trace_preserves_visit_order() {
        let mut product = Product::new(ProductType::Refrigerator);
        product.add_trace_entry("Intake");
        product.add_trace_entry("Assembler");
        product.add_trace_entry("Quality Inspection - Passed");

        let stages: Vec<_> = product.trace().iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(stages, ["Intake", "Assembler", "Quality Inspection - Passed"]);
        assert!(product.trace()[0].at <= product.trace()[2].at);
    }

    #[test]
    fn test_product_ids_are_unique() {
        let a = Product::new(ProductType::Washer);
        let b = Product::new(ProductType::Washer);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().len(), 8);
    }

    #[test]
    fn test_product_json_snapshot() {
        let mut product = Product::new(ProductType::Washer);
        product.advance();
        product.add_trace_entry("Intake");

        let json = serde_json::to_string(&product).unwrap();
        let parsed: Product = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, product);
        assert!(!json.contains("shipment"));
    }

    #[test]
    fn test_info_mentions_type_and_state() {
        let product = Product::new(ProductType::Oven);
        let info = product.info();
        assert!(info.contains("Oven"));
        assert!(info.contains("Created"));
    }
}
