//! Convenient imports for common functionality.

pub use crate::adapter::{Backend, PgBackend};
pub use crate::config::DriverConfig;
pub use crate::connection::Connection;
pub use crate::driver::{ConnHandle, Driver};
pub use crate::error::PgPollError;
pub use crate::pool::{ObjectPool, PoolHandle, PoolStats};
pub use crate::types::{ConnState, ConnectMode, PollStatus};
