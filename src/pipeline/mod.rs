//! Five-stage production pipeline.
//!
//! Products flow through independently running stations joined by bounded
//! channels. Inspection can send a product back to assembly through the
//! assembler's own input channel.
//!
//! # Architecture
//!
//! ```text
//!            ch0            ch1                  ch2            ch3
//! [Intake] ──────► [Assembler] ──────► [Quality Inspection] ──────► [Packaging] ──────► [Shipping]
//!                      ▲                        │
//!                      └──── rework (via ch0) ──┘
//! ```
//!
//! # Design
//!
//! - **One thread per station**: stations share nothing but channels and
//!   report through a non-blocking event channel.
//! - **Enum dispatch on the hot path**: `BuiltinPolicy` covers the five
//!   built-in stage policies; `AnyPolicy::Custom` admits user policies.
//! - **Ownership hand-off**: a product is owned by exactly one thread or one
//!   channel at a time, so products carry no lock.
//! - **Bounded waits everywhere**: every blocking wait of a station is
//!   bounded and cancellable, so stop and pause are always prompt.

pub mod bridge;
pub mod channel;
pub mod controller;
pub mod error;
pub mod id;
pub mod metrics;
pub mod policies;
pub mod policy;
pub mod registry;
pub mod station;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bridge::{EventBus, EventSubscription, LineEvent, ProductionEvent};
pub use channel::{BoundedChannel, ProductChannel};
pub use controller::ProductionController;
pub use error::{PolicyError, PolicyResult, PopError, PushError};
pub use id::{ChannelId, StageKind};
pub use metrics::{Ledger, LineCounts, StatsSnapshot};
pub use policy::{AnyPolicy, BuiltinPolicy, PolicyContext, PolicyOutcome, StagePolicy};
pub use registry::{HealthReport, Worker, WorkerInfo, WorkerPriority, WorkerRegistry};
pub use station::{Station, StationBuilder, StationState, StationStats};

/// Lock a mutex, recovering the data if a holder panicked. Every critical
/// section in this module leaves its data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
