// Test support shared by unit tests, integration tests and benches.
//
// - mock: scripted in-memory backend, behind `test-utils-mock`
// - postgres: embedded PostgreSQL server, behind `test-utils`
//
// Nothing here is part of a default build.

pub mod mock;

#[cfg(feature = "test-utils")]
pub mod postgres;

#[cfg(feature = "test-utils")]
use std::sync::LazyLock;
#[cfg(feature = "test-utils")]
use tokio::runtime::Runtime;

use crate::adapter::Backend;
use crate::connection::Connection;
use crate::driver::{ConnHandle, Driver};

/// Shared tokio runtime for test utilities to avoid creating multiple runtimes
#[cfg(feature = "test-utils")]
pub(crate) static SHARED_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("Failed to create tokio runtime for test utilities"));

/// Poll `conn` until it reports ready. Returns the number of polls used, or
/// `None` if `budget` ran out first.
pub fn poll_connection<B: Backend>(conn: &mut Connection<B>, budget: usize) -> Option<usize> {
    (1..=budget).find(|_| conn.poll().is_ready())
}

/// Poll the connection behind `handle` until it reports ready, sleeping
/// `tick` between polls. Returns `false` if `budget` polls were not enough.
///
/// # Panics
/// Panics if `handle` does not belong to `driver`.
pub fn wait_ready<B: Backend>(
    driver: &mut Driver<B>,
    handle: &ConnHandle,
    budget: usize,
    tick: std::time::Duration,
) -> bool {
    for _ in 0..budget {
        let status = driver.poll(handle).expect("handle belongs to this driver");
        if status.is_ready() {
            return true;
        }
        if !tick.is_zero() {
            std::thread::sleep(tick);
        }
    }
    false
}
