//! Worker registry and health monitor.
//!
//! The registry tracks named workers (the stations) and drives their
//! lifecycle by name. An optional monitor thread periodically checks every
//! worker marked active:
//!
//! - a worker whose thread has already ended is marked inactive and an alert
//!   is raised;
//! - a worker whose heartbeat is older than the unresponsive threshold is
//!   force-terminated, marked inactive and reported.
//!
//! Control calls never hold the registry lock while calling into a worker, so
//! a slow `stop` cannot stall the monitor's bookkeeping or other lookups.

use crate::config::HealthConfig;
use crate::error::{LineError, Result};
use crate::pipeline::bridge::{emit, LineEvent};
use crate::pipeline::lock;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lifecycle surface the registry manages.
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Start the worker. `false` if it was not in a startable state.
    fn start(&self) -> bool;

    fn stop(&self) -> bool;

    fn pause(&self) -> bool;

    fn resume(&self) -> bool;

    /// Whether the worker's thread is still executing
    fn is_running(&self) -> bool;

    /// Time since the worker last proved it is making progress
    fn heartbeat_age(&self) -> Duration;

    /// Abandon the worker's thread without waiting for it
    fn force_terminate(&self);
}

/// Scheduling hint recorded with each worker. Informational only.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum WorkerPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Bookkeeping for one registered worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub priority: WorkerPriority,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Outcome of one health check pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    /// Marked active but their thread had already ended
    pub exited: Vec<String>,
    /// Force-terminated for a stale heartbeat
    pub terminated: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.exited.is_empty() && self.terminated.is_empty()
    }
}

struct Entry {
    worker: Arc<dyn Worker>,
    info: WorkerInfo,
}

struct RegistryInner {
    /// Registration order is preserved
    entries: Mutex<Vec<Entry>>,
    health_enabled: AtomicBool,
    check_interval_ms: AtomicU64,
    unresponsive_threshold_ms: AtomicU64,
    events: Sender<LineEvent>,
}

impl RegistryInner {
    fn find(&self, name: &str) -> Result<Arc<dyn Worker>> {
        lock(&self.entries)
            .iter()
            .find(|entry| entry.info.name == name)
            .map(|entry| Arc::clone(&entry.worker))
            .ok_or_else(|| LineError::UnknownWorker(name.to_string()))
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut WorkerInfo)) {
        if let Some(entry) = lock(&self.entries)
            .iter_mut()
            .find(|entry| entry.info.name == name)
        {
            f(&mut entry.info);
        }
    }

    fn active_workers(&self) -> Vec<(String, Arc<dyn Worker>)> {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.info.active)
            .map(|entry| (entry.info.name.clone(), Arc::clone(&entry.worker)))
            .collect()
    }

    fn unresponsive_threshold(&self) -> Duration {
        Duration::from_millis(self.unresponsive_threshold_ms.load(Ordering::Relaxed))
    }

    fn check_health(&self) -> HealthReport {
        let mut report = HealthReport::default();

        for (name, worker) in self.active_workers() {
            report.checked += 1;

            if !worker.is_running() {
                tracing::warn!("Worker {} is marked active but no longer running", name);
                self.update(&name, |info| info.active = false);
                emit(
                    &self.events,
                    LineEvent::HealthAlert {
                        worker: name.clone(),
                        message: "worker exited unexpectedly".to_string(),
                    },
                );
                report.exited.push(name);
            }
        }

        report.terminated = self.terminate_unresponsive();
        report
    }

    fn terminate_unresponsive(&self) -> Vec<String> {
        let threshold = self.unresponsive_threshold();
        let mut terminated = Vec::new();

        for (name, worker) in self.active_workers() {
            let age = worker.heartbeat_age();
            if age <= threshold {
                continue;
            }

            tracing::error!(
                "Worker {} unresponsive for {} ms, terminating",
                name,
                age.as_millis()
            );
            worker.force_terminate();
            self.update(&name, |info| info.active = false);
            emit(
                &self.events,
                LineEvent::WorkerTerminated {
                    worker: name.clone(),
                },
            );
            emit(
                &self.events,
                LineEvent::HealthAlert {
                    worker: name.clone(),
                    message: format!("unresponsive for {} ms", age.as_millis()),
                },
            );
            terminated.push(name);
        }

        terminated
    }
}

struct Monitor {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Named worker registry with an optional health monitor thread.
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
    monitor: Mutex<Option<Monitor>>,
}

impl WorkerRegistry {
    pub fn new(health: &HealthConfig, events: Sender<LineEvent>) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(Vec::new()),
                health_enabled: AtomicBool::new(false),
                check_interval_ms: AtomicU64::new(health.check_interval_ms.max(1)),
                unresponsive_threshold_ms: AtomicU64::new(health.unresponsive_threshold_ms),
                events,
            }),
            monitor: Mutex::new(None),
        };
        registry.set_health_monitoring(health.enabled);
        registry
    }

    /// Register a worker under its own name. A duplicate name is ignored.
    pub fn register(&self, worker: Arc<dyn Worker>, priority: WorkerPriority) -> bool {
        let name = worker.name().to_string();
        let mut entries = lock(&self.inner.entries);
        if entries.iter().any(|entry| entry.info.name == name) {
            tracing::warn!("Worker {} already registered", name);
            return false;
        }

        tracing::debug!("Registered worker {} ({:?})", name, priority);
        entries.push(Entry {
            worker,
            info: WorkerInfo {
                name,
                priority,
                registered_at: Utc::now(),
                started_at: None,
                active: false,
            },
        });
        true
    }

    /// Remove a worker, stopping it first if it is active.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let worker = self.inner.find(name)?;
        if self.is_active(name) {
            self.inner.update(name, |info| info.active = false);
            worker.stop();
        }
        lock(&self.inner.entries).retain(|entry| entry.info.name != name);
        tracing::debug!("Unregistered worker {}", name);
        Ok(())
    }

    pub fn start(&self, name: &str) -> Result<bool> {
        let worker = self.inner.find(name)?;
        let started = worker.start();
        if started {
            self.inner.update(name, |info| {
                info.active = true;
                info.started_at = Some(Utc::now());
            });
        }
        Ok(started)
    }

    pub fn stop(&self, name: &str) -> Result<bool> {
        let worker = self.inner.find(name)?;
        // Inactive first so the monitor doesn't report the exit
        self.inner.update(name, |info| info.active = false);
        Ok(worker.stop())
    }

    pub fn pause(&self, name: &str) -> Result<bool> {
        Ok(self.inner.find(name)?.pause())
    }

    pub fn resume(&self, name: &str) -> Result<bool> {
        Ok(self.inner.find(name)?.resume())
    }

    pub fn worker_info(&self, name: &str) -> Option<WorkerInfo> {
        lock(&self.inner.entries)
            .iter()
            .find(|entry| entry.info.name == name)
            .map(|entry| entry.info.clone())
    }

    /// All workers in registration order
    pub fn workers(&self) -> Vec<WorkerInfo> {
        lock(&self.inner.entries)
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.worker_info(name).is_some_and(|info| info.active)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.entries)
            .iter()
            .filter(|entry| entry.info.active)
            .count()
    }

    // ── Health ──

    /// Run one health check pass now.
    pub fn check_health(&self) -> HealthReport {
        self.inner.check_health()
    }

    /// Force-terminate every active worker with a stale heartbeat.
    pub fn terminate_unresponsive(&self) -> Vec<String> {
        self.inner.terminate_unresponsive()
    }

    /// Mark workers whose thread has ended as inactive. Returns how many.
    pub fn perform_cleanup(&self) -> usize {
        let finished: Vec<String> = self
            .inner
            .active_workers()
            .into_iter()
            .filter(|(_, worker)| !worker.is_running())
            .map(|(name, _)| name)
            .collect();

        for name in &finished {
            self.inner.update(name, |info| info.active = false);
        }

        if !finished.is_empty() {
            tracing::info!("Cleanup marked {} finished workers inactive", finished.len());
            emit(
                &self.inner.events,
                LineEvent::CleanupPerformed {
                    removed: finished.len(),
                },
            );
        }
        finished.len()
    }

    pub fn health_monitoring_enabled(&self) -> bool {
        self.inner.health_enabled.load(Ordering::Acquire)
    }

    /// Start or stop the monitor thread.
    pub fn set_health_monitoring(&self, enabled: bool) {
        let mut monitor = lock(&self.monitor);
        self.inner.health_enabled.store(enabled, Ordering::Release);

        if !enabled {
            if let Some(running) = monitor.take() {
                shutdown_monitor(running);
            }
            return;
        }
        if monitor.is_some() {
            return;
        }

        let interval = self.health_check_interval();
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || {
                let ticker = tick(interval);
                tracing::debug!("Health monitor started ({:?} interval)", interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let report = inner.check_health();
                            if !report.is_healthy() {
                                tracing::warn!("Health check found problems: {:?}", report);
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::debug!("Health monitor stopped");
            });

        match spawned {
            Ok(handle) => *monitor = Some(Monitor { shutdown, handle }),
            Err(e) => {
                tracing::error!("Failed to spawn health monitor: {}", e);
                self.inner.health_enabled.store(false, Ordering::Release);
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.inner.check_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the check interval; a running monitor is restarted with it.
    pub fn set_health_check_interval(&self, interval: Duration) {
        let ms = (interval.as_millis() as u64).max(1);
        self.inner.check_interval_ms.store(ms, Ordering::Relaxed);
        if self.health_monitoring_enabled() {
            self.set_health_monitoring(false);
            self.set_health_monitoring(true);
        }
    }

    pub fn unresponsive_threshold(&self) -> Duration {
        self.inner.unresponsive_threshold()
    }

    pub fn set_unresponsive_threshold(&self, threshold: Duration) {
        self.inner
            .unresponsive_threshold_ms
            .store(threshold.as_millis() as u64, Ordering::Relaxed);
    }
}

fn shutdown_monitor(monitor: Monitor) {
    drop(monitor.shutdown);
    if monitor.handle.join().is_err() {
        tracing::warn!("Health monitor panicked");
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            shutdown_monitor(monitor);
        }
    }
}
