//! # prodline: production line simulator
//!
//! A five-stage production line (intake, assembly, quality inspection,
//! packaging, shipping) where every stage runs on its own worker thread and
//! hands products to the next stage through a bounded channel. Inspection can
//! route a product back to assembly for rework.
//!
//! ## Architecture
//!
//! - **Channels**: fixed-capacity FIFO hand-offs with timed, non-blocking and
//!   cancellable push/pop
//! - **Policies**: per-stage processing rules (accept, reject, rework)
//! - **Stations**: pause/resume/stop-able workers that pull, process and push
//! - **Registry**: named worker lifecycle plus a heartbeat health monitor
//! - **Controller**: wires the topology and publishes events and statistics
//!
//! ## Example
//!
//! ```ignore
//! use prodline::{LineConfig, ProductionController, ProductionEvent};
//! use std::time::Duration;
//!
//! let controller = ProductionController::new(LineConfig::default())?;
//! let events = controller.subscribe();
//!
//! controller.start();
//! while let Some(event) = events.recv_timeout(Duration::from_secs(1)) {
//!     if let ProductionEvent::ProductFinished { total, .. } = event {
//!         if total >= 10 {
//!             break;
//!         }
//!     }
//! }
//! controller.stop();
//! println!("{:?}", controller.counts());
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::{LineConfig, StationConfig};
pub use error::{LineError, Result};
pub use pipeline::{
    BoundedChannel, ProductChannel, ProductionController, ProductionEvent, StageKind, Station,
    StationState,
};
pub use types::{Product, ProductId, ProductState, ProductType};
