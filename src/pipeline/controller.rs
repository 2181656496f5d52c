//! Production line orchestrator.
//!
//! [`ProductionController`] builds the fixed topology from a [`LineConfig`],
//! registers every station with the [`WorkerRegistry`] and drives the
//! pipeline-wide lifecycle. Two helper threads run alongside the stations:
//!
//! - `line-events` consumes station/registry [`LineEvent`]s and re-publishes
//!   them to observers as [`ProductionEvent`]s, adding `ProductFinished` for
//!   every product that leaves the terminal stage;
//! - `line-metrics` publishes a [`StatsSnapshot`] once per sampling interval
//!   while the line is running.
//!
//! Control calls are serialized on one mutex and only ever wait on a station
//! inside `stop`, which is bounded by the stop grace period.

use crate::config::{LineConfig, StationConfig};
use crate::error::{LineError, Result};
use crate::pipeline::bridge::{
    line_event_channel, EventBus, EventSubscription, LineEvent, ProductionEvent,
};
use crate::pipeline::channel::ProductChannel;
use crate::pipeline::id::{ChannelId, StageKind};
use crate::pipeline::lock;
use crate::pipeline::metrics::{Ledger, LineCounts, StatsSnapshot};
use crate::pipeline::policy::AnyPolicy;
use crate::pipeline::registry::{Worker, WorkerPriority, WorkerRegistry};
use crate::pipeline::station::{Station, StationBuilder};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Stations and channels of one line, shared with the helper threads.
struct Line {
    /// Indexed by `StageKind::index()`
    stations: Vec<Arc<Station>>,
    /// Channel `n` joins stage `n` to stage `n + 1`
    channels: Vec<Arc<ProductChannel>>,
    ledger: Arc<Ledger>,
}

impl Line {
    fn station(&self, stage: StageKind) -> &Station {
        &self.stations[stage.index()]
    }

    fn counts(&self) -> LineCounts {
        let _audit = self.ledger.audit();
        let intake = self.station(StageKind::Intake);
        LineCounts {
            created: intake.processed() + intake.rejected(),
            finished: self.station(StageKind::Shipping).processed(),
            rejected: self.stations.iter().map(|s| s.rejected()).sum(),
            queued: self.channels.iter().map(|c| c.size() as u64).sum(),
            held: self.stations.iter().map(|s| s.held() as u64).sum(),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let counts = self.counts();
        let mut snapshot = StatsSnapshot::new();
        snapshot.insert("created_count", counts.created as f64);
        snapshot.insert("finished_count", counts.finished as f64);
        snapshot.insert("rejected_count", counts.rejected as f64);
        snapshot.insert("wip", counts.wip() as f64);

        for (index, channel) in self.channels.iter().enumerate() {
            snapshot.insert(ChannelId(index as u32).metric_key(), channel.size() as f64);
        }

        for station in &self.stations {
            let prefix = station.stage().metric_prefix();
            snapshot.insert(format!("{prefix}_processed"), station.processed() as f64);
            snapshot.insert(format!("{prefix}_rejected"), station.rejected() as f64);
            snapshot.insert(format!("{prefix}_throughput"), station.throughput());
            snapshot.insert(format!("{prefix}_state"), f64::from(station.state() as u8));
        }
        snapshot
    }
}

fn priority_for(stage: StageKind) -> WorkerPriority {
    match stage {
        StageKind::Intake => WorkerPriority::Normal,
        StageKind::Assembler | StageKind::QualityInspection | StageKind::Packaging => {
            WorkerPriority::High
        }
        StageKind::Shipping => WorkerPriority::Critical,
    }
}

struct Helper {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Helper {
    fn shutdown(self, what: &str) {
        drop(self.shutdown);
        if self.handle.join().is_err() {
            tracing::warn!("{} thread panicked", what);
        }
    }
}

/// Orchestrates one five-stage production line.
pub struct ProductionController {
    config: Mutex<LineConfig>,
    line: Arc<Line>,
    registry: WorkerRegistry,
    bus: Arc<EventBus>,
    control: Mutex<()>,
    running: AtomicBool,
    paused: AtomicBool,
    dispatcher: Mutex<Option<Helper>>,
    sampler: Mutex<Option<Helper>>,
}

impl ProductionController {
    /// Build and wire a stopped line.
    pub fn new(config: LineConfig) -> Result<Self> {
        config.validate()?;

        let (events, event_rx) = line_event_channel();
        let capacity = config.channel_capacity;
        let ledger = Arc::new(Ledger::new());

        let channels: Vec<Arc<ProductChannel>> = (0..StageKind::COUNT - 1)
            .map(|_| Arc::new(ProductChannel::new(capacity)))
            .collect();

        let stations: Vec<Arc<Station>> = StageKind::ALL
            .into_iter()
            .map(|stage| {
                let index = stage.index();
                let mut builder =
                    StationBuilder::new(stage, &config).ledger(Arc::clone(&ledger));
                if index > 0 {
                    builder = builder.input(Arc::clone(&channels[index - 1]));
                }
                if let Some(output) = channels.get(index) {
                    builder = builder.output(Arc::clone(output));
                }
                // Rework re-enters the assembler through its only input
                if stage == StageKind::QualityInspection {
                    builder = builder.rework(Arc::clone(&channels[0]));
                }
                Arc::new(builder.build(events.clone()))
            })
            .collect();

        let registry = WorkerRegistry::new(&config.health, events);
        for station in &stations {
            let worker: Arc<dyn Worker> = Arc::clone(station) as Arc<dyn Worker>;
            registry.register(worker, priority_for(station.stage()));
        }

        let line = Arc::new(Line {
            stations,
            channels,
            ledger,
        });
        let bus = Arc::new(EventBus::new());
        let dispatcher = spawn_dispatcher(event_rx, Arc::clone(&line), Arc::clone(&bus))?;

        tracing::info!(
            "Production line ready ({} stations, channel capacity {})",
            StageKind::COUNT,
            capacity
        );

        Ok(Self {
            config: Mutex::new(config),
            line,
            registry,
            bus,
            control: Mutex::new(()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
            sampler: Mutex::new(None),
        })
    }

    // ==================== Lifecycle ====================

    pub fn start(&self) -> bool {
        let _control = lock(&self.control);
        if self.running.load(Ordering::Acquire) {
            return false;
        }

        for stage in StageKind::ALL {
            match self.registry.start(stage.name()) {
                Ok(true) => {}
                Ok(false) => tracing::warn!("Station {} did not start", stage),
                Err(e) => tracing::error!("Failed to start {}: {}", stage, e),
            }
        }

        self.running.store(true, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.start_sampler();

        tracing::info!("Production started");
        self.bus.publish(ProductionEvent::Started);
        true
    }

    pub fn pause(&self) -> bool {
        let _control = lock(&self.control);
        if !self.running.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire) {
            return false;
        }

        for stage in StageKind::ALL {
            if let Err(e) = self.registry.pause(stage.name()) {
                tracing::warn!("Failed to pause {}: {}", stage, e);
            }
        }
        self.paused.store(true, Ordering::Release);

        tracing::info!("Production paused");
        self.bus.publish(ProductionEvent::Paused);
        true
    }

    pub fn resume(&self) -> bool {
        let _control = lock(&self.control);
        if !self.running.load(Ordering::Acquire) || !self.paused.load(Ordering::Acquire) {
            return false;
        }

        for stage in StageKind::ALL {
            if let Err(e) = self.registry.resume(stage.name()) {
                tracing::warn!("Failed to resume {}: {}", stage, e);
            }
        }
        self.paused.store(false, Ordering::Release);

        tracing::info!("Production resumed");
        self.bus.publish(ProductionEvent::Resumed);
        true
    }

    pub fn stop(&self) -> bool {
        let _control = lock(&self.control);
        self.stop_locked()
    }

    fn stop_locked(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }

        self.stop_sampler();
        // Upstream first so nothing new enters while the rest wind down
        for stage in StageKind::ALL {
            if let Err(e) = self.registry.stop(stage.name()) {
                tracing::warn!("Failed to stop {}: {}", stage, e);
            }
        }

        self.running.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);

        tracing::info!("Production stopped");
        self.bus.publish(ProductionEvent::Stopped);
        true
    }

    /// Stop if needed, then empty every channel and zero every counter.
    pub fn reset(&self) {
        let _control = lock(&self.control);
        self.stop_locked();

        let (cleared, discarded) = {
            let _audit = self.line.ledger.audit();
            let cleared: usize = self.line.channels.iter().map(|c| c.clear()).sum();
            let discarded: usize = self
                .line
                .stations
                .iter()
                .map(|station| {
                    station.reset_statistics();
                    station.discard_parked()
                })
                .sum();
            (cleared, discarded)
        };

        tracing::info!(
            "Production reset ({} queued and {} held products discarded)",
            cleared,
            discarded
        );
        self.bus.publish(ProductionEvent::Reset);
    }

    // ==================== Configuration ====================

    /// Change one station's processing settings.
    ///
    /// `name` is the display name ("Quality Inspection") or the metric prefix
    /// ("quality_inspection").
    pub fn configure_station(
        &self,
        name: &str,
        min_processing_ms: u64,
        max_processing_ms: u64,
        failure_rate: f64,
    ) -> Result<()> {
        let stage = StageKind::from_name(name)?;
        let settings = StationConfig::new(min_processing_ms, max_processing_ms, failure_rate);
        self.line.station(stage).configure(settings.clone())?;
        *lock(&self.config).stations.get_mut(stage) = settings;
        Ok(())
    }

    /// Record a new channel capacity. Existing channels keep theirs; the
    /// value applies to the next line built from [`config`](Self::config).
    pub fn set_channel_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(LineError::InvalidSetting(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        lock(&self.config).channel_capacity = capacity;
        tracing::info!("Channel capacity set to {} for the next line", capacity);
        Ok(())
    }

    /// Replace a stage's policy; takes effect from the station's next item.
    pub fn set_policy(&self, stage: StageKind, policy: AnyPolicy) {
        self.line.station(stage).set_policy(policy);
    }

    pub fn config(&self) -> LineConfig {
        lock(&self.config).clone()
    }

    // ==================== Observation ====================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn created_count(&self) -> u64 {
        self.counts().created
    }

    pub fn finished_count(&self) -> u64 {
        self.line.station(StageKind::Shipping).processed()
    }

    pub fn rejected_count(&self) -> u64 {
        self.counts().rejected
    }

    /// Product accounting across the line
    pub fn counts(&self) -> LineCounts {
        self.line.counts()
    }

    /// Current depth of every channel, in flow order
    pub fn channel_depths(&self) -> Vec<(ChannelId, usize)> {
        self.line
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| (ChannelId(index as u32), channel.size()))
            .collect()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ProductChannel> {
        self.line.channels.get(id.index()).map(|c| c.as_ref())
    }

    /// Assemble a statistics snapshot now.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.line.snapshot()
    }

    pub fn station(&self, stage: StageKind) -> &Station {
        self.line.station(stage)
    }

    /// Stations in flow order
    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.line.stations.iter().map(|s| s.as_ref())
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    // ==================== Helper threads ====================

    fn start_sampler(&self) {
        let mut sampler = lock(&self.sampler);
        if sampler.is_some() {
            return;
        }

        let interval = lock(&self.config).timing.metrics_interval();
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let line = Arc::clone(&self.line);
        let bus = Arc::clone(&self.bus);

        let spawned = thread::Builder::new()
            .name("line-metrics".into())
            .spawn(move || run_sampler(interval, shutdown_rx, line, bus));

        match spawned {
            Ok(handle) => *sampler = Some(Helper { shutdown, handle }),
            Err(e) => tracing::error!("Failed to spawn metrics sampler: {}", e),
        }
    }

    fn stop_sampler(&self) {
        if let Some(sampler) = lock(&self.sampler).take() {
            sampler.shutdown("Metrics sampler");
        }
    }
}

fn run_sampler(
    interval: Duration,
    shutdown: Receiver<()>,
    line: Arc<Line>,
    bus: Arc<EventBus>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let snapshot = line.snapshot();
                tracing::trace!("Statistics sampled ({} values)", snapshot.len());
                bus.publish(ProductionEvent::StatisticsUpdated(snapshot));
            }
            recv(shutdown) -> _ => break,
        }
    }
}

fn spawn_dispatcher(
    events: Receiver<LineEvent>,
    line: Arc<Line>,
    bus: Arc<EventBus>,
) -> Result<Helper> {
    let (shutdown, shutdown_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("line-events".into())
        .spawn(move || {
            let dispatch = |event: LineEvent| {
                let finished = match &event {
                    LineEvent::ProductProcessed { stage, product_id } if stage.is_terminal() => {
                        Some(*product_id)
                    }
                    _ => None,
                };
                bus.publish(event.into());
                if let Some(product_id) = finished {
                    let total = line.station(StageKind::Shipping).processed();
                    tracing::debug!("Product {} finished (total: {})", product_id, total);
                    bus.publish(ProductionEvent::ProductFinished { product_id, total });
                }
            };

            loop {
                select! {
                    recv(events) -> event => match event {
                        Ok(event) => dispatch(event),
                        Err(_) => break,
                    },
                    recv(shutdown_rx) -> _ => {
                        while let Ok(event) = events.try_recv() {
                            dispatch(event);
                        }
                        break;
                    }
                }
            }
            bus.publish(ProductionEvent::Shutdown);
        })?;

    Ok(Helper { shutdown, handle })
}

impl Drop for ProductionController {
    fn drop(&mut self) {
        self.stop();
        for channel in &self.line.channels {
            channel.stop();
        }
        self.registry.set_health_monitoring(false);
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.shutdown("Event dispatcher");
        }
        tracing::debug!("Production line shut down");
    }
}
