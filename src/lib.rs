//! Poll-driven PostgreSQL driver.
//!
//! A [`Driver`] owns a fixed pool of [`Connection`]s. A host borrows a
//! connection with [`Driver::create`], queues a command with
//! [`Driver::query`] and then calls [`Driver::poll`] from its own loop until
//! it reports [`PollStatus::Ready`]. No call waits on the network once the
//! pool is warm; lost sessions are re-established transparently and an
//! overlapping query cancels the one still running.
//!
//! ```rust
//! use pgpoll::prelude::*;
//! use pgpoll::test_utils::mock::MockBackend;
//!
//! let config = DriverConfig::new("host=mock", 1);
//! let mut driver = Driver::with_backend(MockBackend::new(), &config).unwrap();
//! let handle = driver.create().unwrap();
//! driver.query(&handle, "select 1").unwrap();
//! while driver.poll(&handle).unwrap().is_pending() {}
//! assert_eq!(driver.result(&handle).unwrap(), Some("1"));
//! driver.free(handle).unwrap();
//! driver.shutdown();
//! ```

pub mod adapter;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod pool;
pub mod prelude;
#[cfg(any(test, feature = "test-utils-mock"))]
pub mod test_utils;
pub mod types;

pub use config::DriverConfig;
pub use connection::Connection;
pub use driver::{ConnHandle, Driver};
pub use error::PgPollError;
pub use pool::{ObjectPool, PoolHandle, PoolStats};
pub use types::{ConnState, ConnectMode, PollStatus};
