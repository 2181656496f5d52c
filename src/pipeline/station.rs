//! Station: one independently running stage of the line.
//!
//! A station owns a worker thread that repeatedly pulls a product from its
//! input channel, runs its policy on it and pushes it downstream. The source
//! stage has no input channel and instead synthesizes a product on every tick
//! of its production cadence.
//!
//! # States
//!
//! ```text
//! Idle ──start──► Running ◄──resume── Paused
//!                  │  ▲ ╲──pause──────►
//!     output full  ▼  │ push succeeds
//!                 Blocked
//! {Running, Paused, Blocked, Error} ──stop──► Stopping ──loop exits──► Stopped ──start──► Running
//! any ──policy fault──► Error ──next iteration──► Running
//! ```
//!
//! The state is a single atomic byte; control calls and the run loop move it
//! with compare-and-swap so neither can overwrite a transition made by the
//! other (e.g. a pause arriving while the loop leaves `Blocked`).
//!
//! # Ownership of products
//!
//! Between pop and push/drop the product is owned by the worker thread. If
//! a stop interrupts the downstream push, the product is parked in the station
//! and delivered first when the station starts again, so no item is lost or
//! duplicated across a stop.
//!
//! Every hand-off (pop, push, reject, park) updates the channel, the
//! in-flight slot and the counters under one shared guard of the line's
//! [`Ledger`], so line counts taken under its audit guard always balance.
//!
//! The worker owns its policy for the whole run. A worker abandoned inside
//! its policy keeps it; the next run falls back to the built-in policy unless
//! one was set in the meantime.
//!
//! # Stop protocol
//!
//! `stop` raises the stop flag, wakes a paused wait and interrupts every
//! channel wait of this station, then waits up to the stop grace period for
//! the thread to exit. A worker that does not exit in time (stuck inside its
//! policy) is abandoned: the run generation is bumped so the stale thread can
//! no longer deliver anything, and its in-flight product is written off as
//! rejected.

use crate::config::{LineConfig, ReworkConfig, StationConfig, TimingConfig};
use crate::error::Result;
use crate::pipeline::bridge::{emit, LineEvent};
use crate::pipeline::channel::ProductChannel;
use crate::pipeline::error::PopError;
use crate::pipeline::id::StageKind;
use crate::pipeline::lock;
use crate::pipeline::metrics::Ledger;
use crate::pipeline::policy::{AnyPolicy, PolicyContext, PolicyOutcome};
use crate::pipeline::registry::Worker;
use crate::types::{Product, ProductId, ProductType};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Run state of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StationState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Blocked = 3,
    Stopping = 4,
    Stopped = 5,
    Error = 6,
}

impl StationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StationState::Idle,
            1 => StationState::Running,
            2 => StationState::Paused,
            3 => StationState::Blocked,
            4 => StationState::Stopping,
            5 => StationState::Stopped,
            _ => StationState::Error,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StationState::Idle => "Idle",
            StationState::Running => "Running",
            StationState::Paused => "Paused",
            StationState::Blocked => "Blocked",
            StationState::Stopping => "Stopping",
            StationState::Stopped => "Stopped",
            StationState::Error => "Error",
        }
    }

    /// True while a worker loop is live for this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StationState::Running | StationState::Paused | StationState::Blocked | StationState::Error
        )
    }
}

impl fmt::Display for StationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Point-in-time view of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationStats {
    pub stage: StageKind,
    pub state: StationState,
    pub processed: u64,
    pub rejected: u64,
    pub reworked: u64,
    pub errors: u64,
    /// Source only: ticks whose product could not be handed off
    pub skipped: u64,
    /// Items per minute since start or the last statistics reset
    pub throughput: f64,
    pub queue_depth: usize,
    pub held: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    rejected: AtomicU64,
    reworked: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.reworked.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Forward,
    Rework,
}

struct Parked {
    product: Product,
    route: Route,
}

/// Where the policy lives while no worker owns it.
///
/// A running worker owns its policy outright, so a worker stuck inside it
/// holds no lock. `set_policy` leaves a replacement here for the worker to
/// pick up between items.
struct PolicySlot {
    name: String,
    waiting: Option<AnyPolicy>,
}

type Transfer<'a> = RwLockReadGuard<'a, ()>;

/// State shared between the control handle and the worker thread.
struct StationShared {
    stage: StageKind,
    state: AtomicU8,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    /// Bumped on every start and on abandonment; a worker whose generation
    /// is no longer current must not touch channels or counters.
    generation: AtomicU64,
    control: Mutex<()>,
    wake: Condvar,

    input: Option<Arc<ProductChannel>>,
    output: Option<Arc<ProductChannel>>,
    rework: Option<Arc<ProductChannel>>,

    settings: Mutex<StationConfig>,
    rework_config: ReworkConfig,
    timing: TimingConfig,
    tick_interval: Duration,
    seed: Option<u64>,
    policy: Mutex<PolicySlot>,

    ledger: Arc<Ledger>,
    counters: Counters,
    in_flight: Mutex<Option<ProductId>>,
    parked: Mutex<Option<Parked>>,
    stats_epoch: Mutex<Option<Instant>>,
    clock: Instant,
    heartbeat_ms: AtomicU64,
    events: Sender<LineEvent>,
}

impl StationShared {
    fn state(&self) -> StationState {
        StationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, to: StationState) {
        let previous = StationState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        if previous != to {
            self.state_changed(to);
        }
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[StationState], to: StationState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = StationState::from_u8(current);
            if !from.contains(&state) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if state != to {
                        self.state_changed(to);
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn state_changed(&self, state: StationState) {
        tracing::trace!("{} -> {}", self.stage, state);
        emit(
            &self.events,
            LineEvent::StateChanged {
                stage: self.stage,
                state,
            },
        );
    }

    fn beat(&self) {
        let now = self.clock.elapsed().as_millis() as u64;
        self.heartbeat_ms.store(now, Ordering::Release);
    }

    fn heartbeat_age(&self) -> Duration {
        let last = Duration::from_millis(self.heartbeat_ms.load(Ordering::Acquire));
        self.clock.elapsed().saturating_sub(last)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn should_continue(&self, generation: u64) -> bool {
        self.is_current(generation) && !self.stop_requested.load(Ordering::Acquire)
    }

    /// Cancel predicate for deliveries: only a stop (or abandonment) may
    /// interrupt a product on its way downstream.
    fn stopping(&self, generation: u64) -> bool {
        !self.should_continue(generation)
    }

    /// Cancel predicate for waiting on input: pause also interrupts.
    fn interrupted(&self, generation: u64) -> bool {
        self.stopping(generation) || self.pause_requested.load(Ordering::Acquire)
    }

    /// Enter one accounting step of this run. `None` once the run has been
    /// written off; abandonment holds the audit guard, so the answer stays
    /// valid for as long as the guard is held.
    fn enter(&self, generation: u64) -> Option<Transfer<'_>> {
        let transfer = self.ledger.transfer();
        self.is_current(generation).then_some(transfer)
    }

    fn wake_waiters(&self) {
        let _control = lock(&self.control);
        self.wake.notify_all();
    }

    fn interrupt_channels(&self) {
        for channel in [&self.input, &self.output, &self.rework].into_iter().flatten() {
            channel.interrupt();
        }
    }

    /// Sleep up to `timeout`, returning early on stop or pause.
    fn idle_wait(&self, timeout: Duration) {
        let control = lock(&self.control);
        if self.stop_requested.load(Ordering::Acquire) || self.pause_requested.load(Ordering::Acquire)
        {
            return;
        }
        let _ = self
            .wake
            .wait_timeout(control, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn wait_while_paused(&self, generation: u64) {
        let mut control = lock(&self.control);
        while self.pause_requested.load(Ordering::Acquire) && self.should_continue(generation) {
            self.beat();
            control = self
                .wake
                .wait_timeout(control, self.timing.pause_poll())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Write off the current run: fence the thread and account for its product.
    fn abandon_run(&self) {
        let written_off = {
            let _audit = self.ledger.audit();
            self.generation.fetch_add(1, Ordering::AcqRel);
            let product_id = lock(&self.in_flight).take();
            if product_id.is_some() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            product_id
        };

        self.stop_requested.store(true, Ordering::Release);
        self.wake_waiters();
        self.interrupt_channels();

        if let Some(product_id) = written_off {
            emit(
                &self.events,
                LineEvent::ProductRejected {
                    stage: self.stage,
                    product_id,
                    reason: "worker terminated".to_string(),
                },
            );
        }
    }

    // ── Policy ownership ──

    fn claim_policy(&self) -> AnyPolicy {
        let mut slot = lock(&self.policy);
        match slot.waiting.take() {
            Some(policy) => policy,
            None => {
                // Still owned by an abandoned worker
                let policy = AnyPolicy::builtin(self.stage);
                tracing::warn!(
                    "{} policy {} was lost with a terminated worker, using {}",
                    self.stage,
                    slot.name,
                    policy.name()
                );
                slot.name = policy.name().to_string();
                policy
            }
        }
    }

    /// Put the policy back for the next run unless a replacement is waiting.
    fn release_policy(&self, policy: AnyPolicy) {
        lock(&self.policy).waiting.get_or_insert(policy);
    }

    fn replacement_policy(&self) -> Option<AnyPolicy> {
        lock(&self.policy).waiting.take()
    }

    // ── Worker loop ──

    fn run(&self, generation: u64) {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(generation)),
            None => StdRng::from_os_rng(),
        };
        let mut policy = self.claim_policy();
        let mut next_tick = Instant::now() + self.tick_interval;

        tracing::debug!("Station {} started", self.stage);

        while self.should_continue(generation) {
            self.beat();

            if self.pause_requested.load(Ordering::Acquire) {
                self.wait_while_paused(generation);
                continue;
            }
            self.transition(&[StationState::Error], StationState::Running);

            if let Some(replacement) = self.replacement_policy() {
                tracing::debug!("{} switching policy to {}", self.stage, replacement.name());
                policy = replacement;
            }

            if let Some(Parked { product, route }) = self.unpark(generation) {
                self.deliver(generation, product, route);
                continue;
            }

            match &self.input {
                Some(input) => self.process_next(generation, input, &mut policy, &mut rng),
                None => {
                    let now = Instant::now();
                    if now < next_tick {
                        self.idle_wait((next_tick - now).min(self.timing.pause_poll()));
                        continue;
                    }
                    next_tick += self.tick_interval;
                    if next_tick < now {
                        next_tick = now + self.tick_interval;
                    }
                    self.generate(generation, &mut policy, &mut rng);
                }
            }
        }

        if self.is_current(generation) {
            self.release_policy(policy);
        }
        tracing::debug!("Station {} loop exited", self.stage);
    }

    fn unpark(&self, generation: u64) -> Option<Parked> {
        let _transfer = self.enter(generation)?;
        let parked = lock(&self.parked).take()?;
        *lock(&self.in_flight) = Some(parked.product.id());
        Some(parked)
    }

    fn process_next(
        &self,
        generation: u64,
        input: &ProductChannel,
        policy: &mut AnyPolicy,
        rng: &mut StdRng,
    ) {
        let popped = input.pop_guarded(
            self.timing.channel_timeout(),
            || self.interrupted(generation),
            || self.enter(generation),
        );
        let mut product = match popped {
            Ok((product, _transfer)) => {
                *lock(&self.in_flight) = Some(product.id());
                product
            }
            Err(PopError::Stopped) => {
                self.idle_wait(self.timing.pause_poll());
                return;
            }
            Err(_) => return,
        };

        let product_id = product.id();
        tracing::trace!("{} processing product {}", self.stage, product_id);

        let outcome = self.apply_policy(policy, &mut product, rng);
        if !self.is_current(generation) {
            tracing::debug!("{} dropping product {} from a terminated run", self.stage, product_id);
            return;
        }
        self.dispose(generation, product, outcome);
    }

    /// Source tick. The product only counts as created once it is handed off
    /// or rejected, so it is never part of `held`.
    fn generate(&self, generation: u64, policy: &mut AnyPolicy, rng: &mut StdRng) {
        let product_type = ProductType::all()
            .choose(rng)
            .copied()
            .unwrap_or(ProductType::Washer);
        let mut product = Product::new(product_type);
        let product_id = product.id();
        *lock(&self.in_flight) = Some(product_id);

        let outcome = self.apply_policy(policy, &mut product, rng);
        if !self.is_current(generation) {
            return;
        }

        match (outcome, &self.output) {
            (Ok(PolicyOutcome::Accepted), Some(output)) => {
                match output.try_push_guarded(product, || self.enter(generation)) {
                    Ok(_transfer) => {
                        tracing::trace!("Generated new product {} ({})", product_id, product_type);
                        self.complete(product_id, Route::Forward);
                    }
                    Err(_) => {
                        lock(&self.in_flight).take();
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Output buffer full, product generation skipped");
                    }
                }
            }
            (outcome, _) => self.dispose(generation, product, outcome),
        }
    }

    fn apply_policy(
        &self,
        policy: &mut AnyPolicy,
        product: &mut Product,
        rng: &mut StdRng,
    ) -> std::result::Result<PolicyOutcome, String> {
        let settings = lock(&self.settings).clone();
        let mut ctx = PolicyContext {
            stage: self.stage,
            settings: &settings,
            rework: &self.rework_config,
            rng,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| policy.process(product, &mut ctx))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(err.to_string()),
            Err(payload) => Err(format!("Processing error: {}", panic_message(payload.as_ref()))),
        }
    }

    fn dispose(
        &self,
        generation: u64,
        product: Product,
        outcome: std::result::Result<PolicyOutcome, String>,
    ) {
        match outcome {
            Ok(PolicyOutcome::Accepted) => self.deliver(generation, product, Route::Forward),
            Ok(PolicyOutcome::Rework) => self.deliver(generation, product, Route::Rework),
            Ok(PolicyOutcome::Rejected(reason)) => self.reject(generation, product, reason),
            Err(message) => self.fault(generation, product, message),
        }
    }

    fn deliver(&self, generation: u64, mut product: Product, route: Route) {
        let channel = match route {
            Route::Forward => self.output.as_deref(),
            Route::Rework => self.rework.as_deref(),
        };

        match (channel, route) {
            (Some(output), Route::Forward) => self.forward(generation, output, product),
            (Some(rework), Route::Rework) => self.send_back(generation, rework, product),
            // Terminal stage
            (None, Route::Forward) => {
                if let Some(_transfer) = self.enter(generation) {
                    self.complete(product.id(), Route::Forward);
                }
            }
            (None, Route::Rework) => {
                product.reject();
                self.reject(generation, product, "no rework route".to_string());
            }
        }
    }

    /// Push downstream, retrying while the channel stays full.
    fn forward(&self, generation: u64, output: &ProductChannel, product: Product) {
        let product_id = product.id();
        let mut product = match output.try_push_guarded(product, || self.enter(generation)) {
            Ok(_transfer) => return self.complete(product_id, Route::Forward),
            Err(err) if err.is_full() => err.into_inner(),
            Err(err) => return self.park(generation, err.into_inner(), Route::Forward),
        };

        loop {
            if self.transition(&[StationState::Running], StationState::Blocked) {
                tracing::debug!("{} output buffer blocked", self.stage);
            }

            match output.push_guarded(
                product,
                self.timing.channel_timeout(),
                || self.stopping(generation),
                || self.enter(generation),
            ) {
                Ok(transfer) => {
                    self.complete(product_id, Route::Forward);
                    drop(transfer);
                    self.transition(&[StationState::Blocked], StationState::Running);
                    return;
                }
                Err(err) if err.is_timeout() => {
                    product = err.into_inner();
                    self.beat();
                }
                Err(err) => return self.park(generation, err.into_inner(), Route::Forward),
            }
        }
    }

    /// One bounded attempt to route a product back for rework.
    fn send_back(&self, generation: u64, rework: &ProductChannel, product: Product) {
        let product_id = product.id();
        match rework.push_guarded(
            product,
            self.timing.channel_timeout(),
            || self.stopping(generation),
            || self.enter(generation),
        ) {
            Ok(_transfer) => self.complete(product_id, Route::Rework),
            Err(err) if err.is_timeout() || err.is_full() => {
                let mut product = err.into_inner();
                product.reject();
                self.reject(generation, product, "rework queue saturated".to_string());
            }
            Err(err) => self.park(generation, err.into_inner(), Route::Rework),
        }
    }

    /// Account for a product that left this station. Caller holds the transfer guard.
    fn complete(&self, product_id: ProductId, route: Route) {
        let event = match route {
            Route::Forward => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                LineEvent::ProductProcessed {
                    stage: self.stage,
                    product_id,
                }
            }
            Route::Rework => {
                self.counters.reworked.fetch_add(1, Ordering::Relaxed);
                LineEvent::ProductReworked {
                    stage: self.stage,
                    product_id,
                }
            }
        };
        lock(&self.in_flight).take();
        emit(&self.events, event);
    }

    fn reject(&self, generation: u64, product: Product, reason: String) {
        {
            let Some(_transfer) = self.enter(generation) else {
                return;
            };
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            lock(&self.in_flight).take();
        }
        tracing::debug!("{} rejected product {}: {}", self.stage, product.id(), reason);
        emit(
            &self.events,
            LineEvent::ProductRejected {
                stage: self.stage,
                product_id: product.id(),
                reason,
            },
        );
    }

    /// A policy fault. The product is dropped, not requeued.
    fn fault(&self, generation: u64, product: Product, message: String) {
        {
            let Some(_transfer) = self.enter(generation) else {
                return;
            };
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            lock(&self.in_flight).take();
        }
        self.transition(
            &[StationState::Running, StationState::Blocked],
            StationState::Error,
        );
        tracing::error!("{} failed on product {}: {}", self.stage, product.id(), message);
        emit(
            &self.events,
            LineEvent::StageError {
                stage: self.stage,
                message,
            },
        );
    }

    fn park(&self, generation: u64, product: Product, route: Route) {
        let product_id = product.id();
        {
            let Some(_transfer) = self.enter(generation) else {
                tracing::debug!("{} dropping product {} from a terminated run", self.stage, product_id);
                return;
            };
            *lock(&self.parked) = Some(Parked { product, route });
            lock(&self.in_flight).take();
        }
        tracing::debug!("{} holding product {} until restart", self.stage, product_id);

        // Channel stopped underneath a running station; don't spin on it
        if !self.stop_requested.load(Ordering::Acquire) {
            self.idle_wait(self.timing.pause_poll());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

// ==================== Builder ====================

/// Wires a station to its channels before it is started.
pub struct StationBuilder {
    stage: StageKind,
    settings: StationConfig,
    rework_config: ReworkConfig,
    timing: TimingConfig,
    tick_interval: Duration,
    seed: Option<u64>,
    input: Option<Arc<ProductChannel>>,
    output: Option<Arc<ProductChannel>>,
    rework: Option<Arc<ProductChannel>>,
    policy: Option<AnyPolicy>,
    ledger: Option<Arc<Ledger>>,
}

impl StationBuilder {
    pub fn new(stage: StageKind, config: &LineConfig) -> Self {
        // Each stage gets its own stream from the line seed
        let seed = config
            .seed
            .map(|seed| seed ^ (stage.index() as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));

        Self {
            stage,
            settings: config.stations.get(stage).clone(),
            rework_config: config.rework.clone(),
            timing: config.timing.clone(),
            tick_interval: config.intake.interval(),
            seed,
            input: None,
            output: None,
            rework: None,
            policy: None,
            ledger: None,
        }
    }

    pub fn input(mut self, channel: Arc<ProductChannel>) -> Self {
        self.input = Some(channel);
        self
    }

    pub fn output(mut self, channel: Arc<ProductChannel>) -> Self {
        self.output = Some(channel);
        self
    }

    /// Channel that receives products the policy routes to rework
    pub fn rework(mut self, channel: Arc<ProductChannel>) -> Self {
        self.rework = Some(channel);
        self
    }

    /// Replace the stage's built-in policy
    pub fn policy(mut self, policy: AnyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Share the line's accounting fence; a lone station gets its own
    pub fn ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self, events: Sender<LineEvent>) -> Station {
        let policy = self
            .policy
            .unwrap_or_else(|| AnyPolicy::builtin(self.stage));

        let shared = StationShared {
            stage: self.stage,
            state: AtomicU8::new(StationState::Idle as u8),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            control: Mutex::new(()),
            wake: Condvar::new(),
            input: self.input,
            output: self.output,
            rework: self.rework,
            settings: Mutex::new(self.settings),
            rework_config: self.rework_config,
            timing: self.timing,
            tick_interval: self.tick_interval,
            seed: self.seed,
            policy: Mutex::new(PolicySlot {
                name: policy.name().to_string(),
                waiting: Some(policy),
            }),
            ledger: self.ledger.unwrap_or_default(),
            counters: Counters::default(),
            in_flight: Mutex::new(None),
            parked: Mutex::new(None),
            stats_epoch: Mutex::new(None),
            clock: Instant::now(),
            heartbeat_ms: AtomicU64::new(0),
            events,
        };

        Station {
            shared: Arc::new(shared),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }
}

// ==================== Station ====================

#[derive(Default)]
struct Lifecycle {
    handle: Option<JoinHandle<()>>,
    /// Disconnects when the worker thread exits
    done: Option<Receiver<()>>,
}

/// Control handle of one station.
pub struct Station {
    shared: Arc<StationShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Station {
    pub fn stage(&self) -> StageKind {
        self.shared.stage
    }

    pub fn name(&self) -> &'static str {
        self.shared.stage.name()
    }

    pub fn state(&self) -> StationState {
        self.shared.state()
    }

    /// Start a fresh worker loop. Only valid from `Idle` or `Stopped`.
    pub fn start(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        let shared = &self.shared;

        match shared.state() {
            StationState::Idle | StationState::Stopped => {}
            state => {
                tracing::debug!("Station {} already {}", shared.stage, state);
                return false;
            }
        }

        shared.stop_requested.store(false, Ordering::Release);
        shared.pause_requested.store(false, Ordering::Release);
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        lock(&shared.stats_epoch).get_or_insert_with(Instant::now);
        shared.beat();
        shared.set_state(StationState::Running);

        let (done_tx, done_rx) = bounded::<()>(1);
        let worker = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("station-{}", shared.stage.metric_prefix()))
            .spawn(move || {
                let _done = done_tx;
                worker.run(generation);
            });

        match spawned {
            Ok(handle) => {
                lifecycle.handle = Some(handle);
                lifecycle.done = Some(done_rx);
                true
            }
            Err(e) => {
                tracing::error!("Failed to spawn worker for {}: {}", shared.stage, e);
                shared.set_state(StationState::Stopped);
                emit(
                    &shared.events,
                    LineEvent::StageError {
                        stage: shared.stage,
                        message: format!("failed to spawn worker: {}", e),
                    },
                );
                false
            }
        }
    }

    /// Pause between items. The current item, if any, is finished first.
    pub fn pause(&self) -> bool {
        let shared = &self.shared;
        if !shared.transition(
            &[StationState::Running, StationState::Blocked, StationState::Error],
            StationState::Paused,
        ) {
            return false;
        }
        shared.pause_requested.store(true, Ordering::Release);
        shared.wake_waiters();
        if let Some(input) = &shared.input {
            input.interrupt();
        }
        tracing::debug!("Station {} paused", shared.stage);
        true
    }

    pub fn resume(&self) -> bool {
        let shared = &self.shared;
        if !shared.transition(&[StationState::Paused], StationState::Running) {
            return false;
        }
        shared.pause_requested.store(false, Ordering::Release);
        shared.wake_waiters();
        tracing::debug!("Station {} resumed", shared.stage);
        true
    }

    /// Stop the worker, waiting up to the stop grace period for it to exit.
    pub fn stop(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        let shared = &self.shared;

        if !shared.transition(
            &[
                StationState::Running,
                StationState::Paused,
                StationState::Blocked,
                StationState::Error,
            ],
            StationState::Stopping,
        ) {
            return false;
        }

        shared.stop_requested.store(true, Ordering::Release);
        shared.pause_requested.store(false, Ordering::Release);
        shared.wake_waiters();
        shared.interrupt_channels();

        let grace = shared.timing.stop_grace();
        let exited = match lifecycle.done.take() {
            Some(done) => !matches!(done.recv_timeout(grace), Err(RecvTimeoutError::Timeout)),
            None => true,
        };

        let handle = lifecycle.handle.take();
        if exited {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::warn!("Worker of {} panicked", shared.stage);
                }
            }
        } else {
            tracing::warn!(
                "Station {} did not stop within {:?}, abandoning its worker",
                shared.stage,
                grace
            );
            shared.abandon_run();
        }

        shared.set_state(StationState::Stopped);
        tracing::debug!("Station {} stopped", shared.stage);
        true
    }

    /// Abandon the worker thread without waiting for it.
    pub fn force_terminate(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.handle.is_none() {
            return;
        }

        tracing::warn!("Force-terminating station {}", self.shared.stage);
        self.shared.set_state(StationState::Stopping);
        self.shared.abandon_run();
        lifecycle.handle.take();
        lifecycle.done.take();
        self.shared.set_state(StationState::Stopped);
    }

    /// Whether the current worker thread is still executing
    pub fn is_running(&self) -> bool {
        lock(&self.lifecycle)
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.shared.heartbeat_age()
    }

    // ── Observation ──

    pub fn processed(&self) -> u64 {
        self.shared.counters.processed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.shared.counters.rejected.load(Ordering::Relaxed)
    }

    pub fn reworked(&self) -> u64 {
        self.shared.counters.reworked.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.shared.counters.errors.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.shared.counters.skipped.load(Ordering::Relaxed)
    }

    /// Items per minute since start or the last statistics reset
    pub fn throughput(&self) -> f64 {
        let epoch = *lock(&self.shared.stats_epoch);
        match epoch {
            Some(start) => {
                let elapsed_ms = start.elapsed().as_millis();
                if elapsed_ms == 0 {
                    0.0
                } else {
                    self.processed() as f64 * 60_000.0 / elapsed_ms as f64
                }
            }
            None => 0.0,
        }
    }

    /// Product currently being processed, if any
    pub fn current_product(&self) -> Option<ProductId> {
        *lock(&self.shared.in_flight)
    }

    /// Products owned by this station (in flight plus parked). The source's
    /// product is not admitted until it is handed off, so it is never held.
    pub fn held(&self) -> usize {
        let in_flight = self.shared.input.is_some() && lock(&self.shared.in_flight).is_some();
        usize::from(in_flight) + usize::from(lock(&self.shared.parked).is_some())
    }

    /// Depth of the input channel; zero for the source
    pub fn queue_depth(&self) -> usize {
        self.shared.input.as_ref().map_or(0, |input| input.size())
    }

    pub fn stats(&self) -> StationStats {
        StationStats {
            stage: self.stage(),
            state: self.state(),
            processed: self.processed(),
            rejected: self.rejected(),
            reworked: self.reworked(),
            errors: self.errors(),
            skipped: self.skipped(),
            throughput: self.throughput(),
            queue_depth: self.queue_depth(),
            held: self.held(),
        }
    }

    // ── Configuration ──

    pub fn settings(&self) -> StationConfig {
        lock(&self.shared.settings).clone()
    }

    /// Change processing settings; picked up from the next item on.
    pub fn configure(&self, settings: StationConfig) -> Result<()> {
        settings.validate()?;
        tracing::info!(
            "Configured {}: {}-{} ms, failure rate {}",
            self.shared.stage,
            settings.min_processing_ms,
            settings.max_processing_ms,
            settings.failure_rate
        );
        *lock(&self.shared.settings) = settings;
        Ok(())
    }

    /// Replace the policy; a running worker picks it up before its next item.
    pub fn set_policy(&self, policy: AnyPolicy) {
        let mut slot = lock(&self.shared.policy);
        slot.name = policy.name().to_string();
        slot.waiting = Some(policy);
    }

    pub fn policy_name(&self) -> String {
        lock(&self.shared.policy).name.clone()
    }

    /// Zero all counters and restart the throughput window.
    pub fn reset_statistics(&self) {
        self.shared.counters.reset();
        let mut epoch = lock(&self.shared.stats_epoch);
        *epoch = self.state().is_active().then(Instant::now);
    }

    /// Drop a product held across a stop. Returns how many were dropped.
    pub fn discard_parked(&self) -> usize {
        usize::from(lock(&self.shared.parked).take().is_some())
    }
}

impl Worker for Station {
    fn name(&self) -> &str {
        self.shared.stage.name()
    }

    fn start(&self) -> bool {
        Station::start(self)
    }

    fn stop(&self) -> bool {
        Station::stop(self)
    }

    fn pause(&self) -> bool {
        Station::pause(self)
    }

    fn resume(&self) -> bool {
        Station::resume(self)
    }

    fn is_running(&self) -> bool {
        Station::is_running(self)
    }

    fn heartbeat_age(&self) -> Duration {
        Station::heartbeat_age(self)
    }

    fn force_terminate(&self) {
        Station::force_terminate(self)
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if lifecycle.handle.take().is_some() {
            self.shared.stop_requested.store(true, Ordering::Release);
            self.shared.wake_waiters();
            self.shared.interrupt_channels();
        }
    }
}

impl fmt::Debug for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Station")
            .field("stage", &self.shared.stage)
            .field("state", &self.state())
            .field("processed", &self.processed())
            .field("rejected", &self.rejected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bridge::line_event_channel;
    use crate::pipeline::error::{PolicyError, PolicyResult};
    use crate::pipeline::policy::StagePolicy;
    use crate::types::ProductState;
    use serial_test::serial;
    use std::collections::HashSet;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> LineConfig {
        let mut config = LineConfig::default();
        config.seed = Some(1);
        config.timing = TimingConfig {
            channel_timeout_ms: 50,
            pause_poll_ms: 10,
            stop_grace_ms: 1000,
            metrics_interval_ms: 50,
        };
        for stage in StageKind::ALL {
            *config.stations.get_mut(stage) = StationConfig::new(0, 0, 0.0);
        }
        config
    }

    fn product_at(state: ProductState) -> Product {
        let mut product = Product::new(ProductType::Washer);
        product.set_state(state);
        product
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    struct Wired {
        station: Station,
        input: Arc<ProductChannel>,
        output: Arc<ProductChannel>,
        events: Receiver<LineEvent>,
    }

    fn packaging(config: &LineConfig, policy: Option<AnyPolicy>) -> Wired {
        let input = Arc::new(ProductChannel::new(10));
        let output = Arc::new(ProductChannel::new(10));
        let (tx, events) = line_event_channel();
        let mut builder = StationBuilder::new(StageKind::Packaging, config)
            .input(input.clone())
            .output(output.clone());
        if let Some(policy) = policy {
            builder = builder.policy(policy);
        }
        Wired {
            station: builder.build(tx),
            input,
            output,
            events,
        }
    }

    struct Failing;

    impl StagePolicy for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn process(
            &mut self,
            _product: &mut Product,
            _ctx: &mut PolicyContext<'_>,
        ) -> PolicyResult<PolicyOutcome> {
            Err(PolicyError::Fault("boom".into()))
        }
    }

    /// Panics on the first product, accepts the rest.
    struct PanicOnce {
        calls: u32,
    }

    impl StagePolicy for PanicOnce {
        fn name(&self) -> &str {
            "PanicOnce"
        }

        fn process(
            &mut self,
            product: &mut Product,
            _ctx: &mut PolicyContext<'_>,
        ) -> PolicyResult<PolicyOutcome> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("exploded");
            }
            product.advance();
            Ok(PolicyOutcome::Accepted)
        }
    }

    /// Blocks until released.
    struct Gate(Receiver<()>);

    impl StagePolicy for Gate {
        fn name(&self) -> &str {
            "Gate"
        }

        fn process(
            &mut self,
            product: &mut Product,
            _ctx: &mut PolicyContext<'_>,
        ) -> PolicyResult<PolicyOutcome> {
            let _ = self.0.recv_timeout(Duration::from_secs(5));
            product.advance();
            Ok(PolicyOutcome::Accepted)
        }
    }

    #[test]
    #[serial]
    fn test_lifecycle_transitions() {
        let wired = packaging(&fast_config(), None);
        let station = &wired.station;
        assert_eq!(station.state(), StationState::Idle);
        assert!(!station.pause());
        assert!(!station.stop());

        assert!(station.start());
        assert_eq!(station.state(), StationState::Running);
        assert!(!station.start());

        assert!(station.pause());
        assert_eq!(station.state(), StationState::Paused);
        assert!(!station.pause());
        assert!(station.resume());
        assert!(!station.resume());

        assert!(station.stop());
        assert_eq!(station.state(), StationState::Stopped);
        assert!(!station.is_running());
        assert!(!station.stop());

        assert!(station.start());
        assert!(station.is_running());
        assert!(station.stop());
    }

    #[test]
    #[serial]
    fn test_full_failure_rate_rejects_everything() {
        let mut config = fast_config();
        config.stations.packaging.failure_rate = 1.0;
        let wired = packaging(&config, None);
        for _ in 0..5 {
            wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        }

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.rejected() == 5));
        assert!(wired.station.stop());

        assert_eq!(wired.station.processed(), 0);
        assert!(wired.output.is_empty());
        let rejections = wired
            .events
            .try_iter()
            .filter(|e| matches!(e, LineEvent::ProductRejected { .. }))
            .count();
        assert_eq!(rejections, 5);
    }

    #[test]
    #[serial]
    fn test_pause_blocks_between_items() {
        let mut config = fast_config();
        config.stations.packaging = StationConfig::new(5, 5, 0.0);
        let wired = packaging(&config, None);
        let station = &wired.station;

        assert!(station.start());
        assert!(station.pause());

        let mut pushed = HashSet::new();
        for _ in 0..5 {
            let product = product_at(ProductState::AtPackaging);
            pushed.insert(product.id());
            wired.input.try_push(product).unwrap();
        }

        thread::sleep(Duration::from_millis(60));
        assert_eq!(station.processed(), 0);
        assert_eq!(wired.input.size(), 5);

        assert!(station.resume());
        assert!(wait_until(WAIT, || station.processed() == 5));
        assert!(station.stop());

        let mut delivered = HashSet::new();
        while let Ok(product) = wired.output.try_pop() {
            assert_eq!(product.state(), ProductState::AtShipping);
            delivered.insert(product.id());
        }
        assert_eq!(delivered, pushed);
    }

    #[test]
    #[serial]
    fn test_policy_error_is_reported_and_loop_continues() {
        let wired = packaging(&fast_config(), Some(AnyPolicy::custom(Failing)));
        for _ in 0..2 {
            wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        }

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.errors() == 2));
        assert!(wait_until(WAIT, || wired.station.state() == StationState::Running));

        assert_eq!(wired.station.rejected(), 2);
        assert_eq!(wired.station.held(), 0);
        assert!(wired.station.stop());

        let messages: Vec<_> = wired
            .events
            .try_iter()
            .filter_map(|e| match e {
                LineEvent::StageError { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(messages, ["Processing error: boom", "Processing error: boom"]);
    }

    #[test]
    #[serial]
    fn test_panicking_policy_does_not_kill_worker() {
        let wired = packaging(&fast_config(), Some(AnyPolicy::custom(PanicOnce { calls: 0 })));
        for _ in 0..2 {
            wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        }

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.processed() == 1));
        assert!(wired.station.is_running());
        assert_eq!(wired.station.errors(), 1);
        assert_eq!(wired.station.rejected(), 1);
        assert!(wired.station.stop());

        let error = wired.events.try_iter().find_map(|e| match e {
            LineEvent::StageError { message, .. } => Some(message),
            _ => None,
        });
        assert!(error.unwrap().contains("exploded"));
    }

    #[test]
    #[serial]
    fn test_stop_while_blocked_parks_product() {
        let config = fast_config();
        let wired = packaging(&config, None);
        let output_capacity_one = Arc::new(ProductChannel::new(1));
        let (tx, _events) = line_event_channel();
        let station = StationBuilder::new(StageKind::Packaging, &config)
            .input(wired.input.clone())
            .output(output_capacity_one.clone())
            .build(tx);

        output_capacity_one
            .try_push(product_at(ProductState::AtShipping))
            .unwrap();
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();

        assert!(station.start());
        assert!(wait_until(WAIT, || station.state() == StationState::Blocked));

        let started = Instant::now();
        assert!(station.stop());
        assert!(started.elapsed() < config.timing.stop_grace());
        assert_eq!(station.held(), 1);
        assert_eq!(station.processed(), 0);
        assert!(wired.input.is_empty());

        // Room downstream: the parked product goes out first on restart
        output_capacity_one.try_pop().unwrap();
        assert!(station.start());
        assert!(wait_until(WAIT, || station.processed() == 1));
        assert_eq!(station.held(), 0);
        assert_eq!(output_capacity_one.size(), 1);
        assert!(station.stop());
    }

    #[test]
    #[serial]
    fn test_stuck_worker_is_abandoned_on_stop() {
        let mut config = fast_config();
        config.timing.stop_grace_ms = 30;
        let (release, gate) = bounded(1);
        let wired = packaging(&config, Some(AnyPolicy::custom(Gate(gate))));
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.current_product().is_some()));

        assert!(wired.station.stop());
        assert_eq!(wired.station.state(), StationState::Stopped);
        assert_eq!(wired.station.rejected(), 1);
        assert_eq!(wired.station.errors(), 1);
        assert_eq!(wired.station.held(), 0);

        // The stale thread finishes its item but may not deliver it
        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(wired.output.is_empty());
        assert_eq!(wired.station.processed(), 0);
    }

    #[test]
    #[serial]
    fn test_restart_after_abandoned_worker_processes_again() {
        let mut config = fast_config();
        config.timing.stop_grace_ms = 30;
        let (release, gate) = bounded(1);
        let wired = packaging(&config, Some(AnyPolicy::custom(Gate(gate))));
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.current_product().is_some()));
        assert!(wired.station.stop());

        // Control calls never wait on the stuck thread
        let asked = Instant::now();
        assert_eq!(wired.station.policy_name(), "Gate");
        assert!(asked.elapsed() < Duration::from_millis(100));

        // The stuck thread still owns its policy; the new run falls back to the built-in one
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.processed() == 1));
        assert_eq!(wired.station.policy_name(), "Packaging");
        assert_eq!(wired.output.size(), 1);
        assert_eq!(wired.station.held(), 0);

        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(wired.station.stop());
        assert_eq!(wired.station.processed(), 1);
        assert_eq!(wired.station.rejected(), 1);
        assert_eq!(wired.output.size(), 1);
    }

    #[test]
    #[serial]
    fn test_set_policy_while_worker_is_stuck() {
        let mut config = fast_config();
        config.timing.stop_grace_ms = 30;
        let (release, gate) = bounded(1);
        let wired = packaging(&config, Some(AnyPolicy::custom(Gate(gate))));
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();

        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.current_product().is_some()));

        let replaced = Instant::now();
        wired.station.set_policy(AnyPolicy::custom(Failing));
        assert!(replaced.elapsed() < Duration::from_millis(100));
        assert_eq!(wired.station.policy_name(), "Failing");

        assert!(wired.station.stop());
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        assert!(wired.station.start());
        // One written off by the stop, one faulted by the replacement
        assert!(wait_until(WAIT, || wired.station.errors() == 2));
        assert_eq!(wired.station.processed(), 0);
        assert!(wired.station.stop());
        release.send(()).unwrap();
    }

    #[test]
    #[serial]
    fn test_policy_survives_clean_restart() {
        let wired = packaging(&fast_config(), Some(AnyPolicy::custom(Failing)));
        assert!(wired.station.start());
        assert!(wired.station.stop());

        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.errors() == 1));
        assert!(wired.station.stop());
        assert_eq!(wired.station.policy_name(), "Failing");
    }

    #[test]
    #[serial]
    fn test_heartbeat_stays_fresh_while_idle() {
        let wired = packaging(&fast_config(), None);
        assert!(wired.station.start());
        thread::sleep(Duration::from_millis(150));
        assert!(wired.station.heartbeat_age() < Duration::from_millis(120));
        assert!(wired.station.stop());
    }

    #[test]
    #[serial]
    fn test_source_skips_when_output_full() {
        let mut config = fast_config();
        config.intake.production_rate_per_minute = 60_000;
        let output = Arc::new(ProductChannel::new(2));
        let (tx, _events) = line_event_channel();
        let intake = StationBuilder::new(StageKind::Intake, &config)
            .output(output.clone())
            .build(tx);

        assert!(intake.start());
        assert!(wait_until(WAIT, || intake.skipped() >= 1));
        assert!(intake.stop());

        assert_eq!(output.size(), 2);
        assert_eq!(intake.processed(), 2);
        assert_eq!(intake.held(), 0);
        while let Ok(product) = output.try_pop() {
            assert_eq!(product.state(), ProductState::AtAssembler);
            assert_eq!(product.trace()[0].stage, "Intake");
        }
    }

    #[test]
    fn test_configure_validates() {
        let wired = packaging(&fast_config(), None);
        assert!(wired.station.configure(StationConfig::new(10, 5, 0.0)).is_err());
        assert!(wired.station.configure(StationConfig::new(1, 5, 0.5)).is_ok());
        assert_eq!(wired.station.settings().failure_rate, 0.5);
        assert_eq!(wired.station.policy_name(), "Packaging");
    }

    #[test]
    #[serial]
    fn test_reset_statistics() {
        let wired = packaging(&fast_config(), None);
        wired.input.try_push(product_at(ProductState::AtPackaging)).unwrap();
        assert!(wired.station.start());
        assert!(wait_until(WAIT, || wired.station.processed() == 1));
        assert!(wired.station.throughput() > 0.0);
        assert!(wired.station.stop());

        wired.station.reset_statistics();
        assert_eq!(wired.station.stats().processed, 0);
        assert_eq!(wired.station.throughput(), 0.0);
    }
}
