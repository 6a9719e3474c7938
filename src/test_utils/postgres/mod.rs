/// Embedded `PostgreSQL` server for integration tests and benches
pub mod embedded;

pub use embedded::*;
