//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use prodline::pipeline::EventSubscription;
use prodline::ProductionEvent;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Receive events until none arrives for `quiet`.
pub fn settle_events(events: &EventSubscription, quiet: Duration) -> Vec<ProductionEvent> {
    let mut received = Vec::new();
    while let Some(event) = events.recv_timeout(quiet) {
        received.push(event);
    }
    received
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
