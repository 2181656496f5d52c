//! Event plumbing between stations, the controller and observers.
//!
//! Stations and the worker registry publish [`LineEvent`]s on one bounded
//! crossbeam channel. The controller's dispatcher thread is its only consumer;
//! it re-publishes every event as a [`ProductionEvent`] (adding derived events
//! such as "a product finished") to every [`EventSubscription`] through the
//! [`EventBus`].
//!
//! Emission never blocks and never takes a lock shared with control calls, so
//! a station can report while the controller is in the middle of a stop.

use crate::pipeline::id::StageKind;
use crate::pipeline::lock;
use crate::pipeline::metrics::StatsSnapshot;
use crate::pipeline::station::StationState;
use crate::types::ProductId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Channel capacity for station/registry events (workers → dispatcher).
pub const LINE_EVENT_CAPACITY: usize = 10_000;
/// Channel capacity for each observer subscription.
/// 10,000 events is several minutes of a busy line.
pub const SUBSCRIPTION_CAPACITY: usize = 10_000;

/// Events raised by stations and the registry.
#[derive(Debug, Clone)]
pub enum LineEvent {
    StateChanged {
        stage: StageKind,
        state: StationState,
    },
    ProductProcessed {
        stage: StageKind,
        product_id: ProductId,
    },
    ProductRejected {
        stage: StageKind,
        product_id: ProductId,
        reason: String,
    },
    ProductReworked {
        stage: StageKind,
        product_id: ProductId,
    },
    /// A policy fault caught at the station boundary.
    StageError { stage: StageKind, message: String },
    HealthAlert { worker: String, message: String },
    WorkerTerminated { worker: String },
    CleanupPerformed { removed: usize },
}

/// Create the worker → dispatcher event channel.
pub fn line_event_channel() -> (Sender<LineEvent>, Receiver<LineEvent>) {
    bounded(LINE_EVENT_CAPACITY)
}

/// Publish without blocking. A full channel drops the event; a closed one
/// means the controller is gone and nobody is listening.
pub(crate) fn emit(tx: &Sender<LineEvent>, event: LineEvent) {
    if let Err(TrySendError::Full(event)) = tx.try_send(event) {
        tracing::trace!("Event channel full, dropping {:?}", event);
    }
}

/// Events surfaced to observers (UI, loggers, statistics collectors).
#[derive(Debug, Clone)]
pub enum ProductionEvent {
    Started,
    Paused,
    Resumed,
    Stopped,
    Reset,
    ProductProcessed {
        stage: StageKind,
        product_id: ProductId,
    },
    ProductRejected {
        stage: StageKind,
        product_id: ProductId,
        reason: String,
    },
    ProductReworked {
        stage: StageKind,
        product_id: ProductId,
    },
    /// Raised alongside `ProductProcessed` for the terminal stage.
    ProductFinished { product_id: ProductId, total: u64 },
    StageError { stage: StageKind, message: String },
    StationStateChanged {
        stage: StageKind,
        state: StationState,
    },
    StatisticsUpdated(StatsSnapshot),
    HealthAlert { worker: String, message: String },
    WorkerTerminated { worker: String },
    CleanupPerformed { removed: usize },
    /// The controller is being dropped; no further events follow.
    Shutdown,
}

impl From<LineEvent> for ProductionEvent {
    fn from(event: LineEvent) -> Self {
        match event {
            LineEvent::StateChanged { stage, state } => {
                ProductionEvent::StationStateChanged { stage, state }
            }
            LineEvent::ProductProcessed { stage, product_id } => {
                ProductionEvent::ProductProcessed { stage, product_id }
            }
            LineEvent::ProductRejected {
                stage,
                product_id,
                reason,
            } => ProductionEvent::ProductRejected {
                stage,
                product_id,
                reason,
            },
            LineEvent::ProductReworked { stage, product_id } => {
                ProductionEvent::ProductReworked { stage, product_id }
            }
            LineEvent::StageError { stage, message } => {
                ProductionEvent::StageError { stage, message }
            }
            LineEvent::HealthAlert { worker, message } => {
                ProductionEvent::HealthAlert { worker, message }
            }
            LineEvent::WorkerTerminated { worker } => ProductionEvent::WorkerTerminated { worker },
            LineEvent::CleanupPerformed { removed } => ProductionEvent::CleanupPerformed { removed },
        }
    }
}

/// One formatted line per event, for text loggers.
impl fmt::Display for ProductionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionEvent::Started => f.write_str("Production started"),
            ProductionEvent::Paused => f.write_str("Production paused"),
            ProductionEvent::Resumed => f.write_str("Production resumed"),
            ProductionEvent::Stopped => f.write_str("Production stopped"),
            ProductionEvent::Reset => f.write_str("Production reset"),
            ProductionEvent::ProductProcessed { stage, product_id } => {
                write!(f, "[{}] Processed product {}", stage, product_id)
            }
            ProductionEvent::ProductRejected {
                stage,
                product_id,
                reason,
            } => write!(f, "[{}] Rejected product {}: {}", stage, product_id, reason),
            ProductionEvent::ProductReworked { stage, product_id } => {
                write!(f, "[{}] Product {} sent to rework", stage, product_id)
            }
            ProductionEvent::ProductFinished { product_id, total } => {
                write!(f, "Product {} finished (total: {})", product_id, total)
            }
            ProductionEvent::StageError { stage, message } => {
                write!(f, "[{}] Error: {}", stage, message)
            }
            ProductionEvent::StationStateChanged { stage, state } => {
                write!(f, "[{}] State changed to {}", stage, state)
            }
            ProductionEvent::StatisticsUpdated(snapshot) => {
                write!(f, "Statistics updated ({} values)", snapshot.len())
            }
            ProductionEvent::HealthAlert { worker, message } => {
                write!(f, "Health alert for {}: {}", worker, message)
            }
            ProductionEvent::WorkerTerminated { worker } => {
                write!(f, "Worker {} terminated", worker)
            }
            ProductionEvent::CleanupPerformed { removed } => {
                write!(f, "Cleanup marked {} finished workers inactive", removed)
            }
            ProductionEvent::Shutdown => f.write_str("Production line shut down"),
        }
    }
}

/// Fan-out of production events to any number of subscribers.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ProductionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = bounded(SUBSCRIPTION_CAPACITY);
        lock(&self.subscribers).push(tx);
        EventSubscription { rx }
    }

    /// Deliver to every live subscriber. Dropped subscriptions are pruned;
    /// a subscriber that stopped draining loses the event.
    pub fn publish(&self, event: ProductionEvent) {
        let mut subscribers = lock(&self.subscribers);

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Subscriber queue full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer-side handle. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: Receiver<ProductionEvent>,
}

impl EventSubscription {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<ProductionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<ProductionEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProductionEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for an event matching `pred`, discarding others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&ProductionEvent) -> bool,
    ) -> Option<ProductionEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let event = self.recv_timeout(remaining)?;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    pub fn receiver(&self) -> &Receiver<ProductionEvent> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(ProductionEvent::Started);
        bus.publish(ProductionEvent::Stopped);

        assert!(matches!(a.drain().as_slice(), [ProductionEvent::Started, ProductionEvent::Stopped]));
        assert_eq!(b.drain().len(), 2);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ProductionEvent::Reset);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(matches!(keep.try_recv(), Some(ProductionEvent::Reset)));
    }

    #[test]
    fn test_line_event_conversion() {
        let id = ProductId::new();
        let event: ProductionEvent = LineEvent::ProductRejected {
            stage: StageKind::Packaging,
            product_id: id,
            reason: "damaged".into(),
        }
        .into();

        match &event {
            ProductionEvent::ProductRejected {
                stage,
                product_id,
                reason,
            } => {
                assert_eq!(*stage, StageKind::Packaging);
                assert_eq!(*product_id, id);
                assert_eq!(reason, "damaged");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(event.to_string().starts_with("[Packaging] Rejected product"));
    }

    #[test]
    fn test_emit_never_blocks_when_full() {
        let (tx, rx) = bounded(1);
        emit(&tx, LineEvent::CleanupPerformed { removed: 1 });
        emit(&tx, LineEvent::CleanupPerformed { removed: 2 });
        assert_eq!(rx.len(), 1);

        drop(rx);
        emit(&tx, LineEvent::CleanupPerformed { removed: 3 });
    }

    #[test]
    fn test_wait_for_skips_other_events() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(ProductionEvent::Started);
        bus.publish(ProductionEvent::Paused);

        let found = sub.wait_for(Duration::from_millis(50), |e| {
            matches!(e, ProductionEvent::Paused)
        });
        assert!(matches!(found, Some(ProductionEvent::Paused)));
        assert!(sub.wait_for(Duration::from_millis(10), |_| true).is_none());
    }
}
