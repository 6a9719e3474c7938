use std::time::Duration;

use clap::{Parser, ValueEnum};
use pgpoll::{ConnectMode, DriverConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run queries over a pgpoll connection pool")]
pub(crate) struct Args {
    /// libpq-style connection string or postgresql:// URL
    #[arg(long, env = "PGPOLL_CONNINFO")]
    pub(crate) conninfo: String,
    #[arg(long, default_value_t = 4)]
    pub(crate) pool_size: u16,
    #[arg(long, value_enum, default_value = "blocking")]
    pub(crate) warmup: ConnectMode,
    #[arg(long, default_value_t = 1)]
    pub(crate) io_threads: usize,
    /// Abandon a query that is not ready after this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub(crate) timeout: Duration,
    /// Sleep between two polling rounds
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1ms")]
    pub(crate) tick: Duration,
    #[arg(long, value_enum, default_value = "text")]
    pub(crate) format: OutputFormat,
    /// Commands to run; each may hold several `;`-separated statements
    #[arg(required = true)]
    pub(crate) queries: Vec<String>,
}

impl Args {
    pub(crate) fn driver_config(&self) -> DriverConfig {
        DriverConfig::new(self.conninfo.clone(), self.pool_size)
            .with_warmup(self.warmup)
            .with_io_threads(self.io_threads)
    }
}
