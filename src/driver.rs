use crate::adapter::{Backend, PgBackend};
use crate::config::DriverConfig;
use crate::connection::Connection;
use crate::error::PgPollError;
use crate::pool::{ObjectPool, PoolHandle, PoolStats};
use crate::types::{ConnState, ConnectMode, PollStatus};

/// Handle to one pooled connection, obtained from [`Driver::create`].
pub type ConnHandle = PoolHandle;

/// Driver context: the backend plus a fixed pool of connections.
///
/// Everything a host needs goes through this value; there is no global
/// state, so several drivers may coexist.
pub struct Driver<B: Backend = PgBackend> {
    backend: B,
    conninfo: String,
    pool: ObjectPool<Connection<B>>,
}

impl<B: Backend> std::fmt::Debug for Driver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Driver<PgBackend> {
    /// Start the Postgres adapter and warm up `config.pool_size` connections.
    ///
    /// # Errors
    /// Returns `PgPollError::ConfigError` for an invalid config,
    /// `PgPollError::RuntimeError` if the I/O runtime cannot start, and
    /// `PgPollError::ConnectionError` if a blocking warm-up connect fails.
    pub fn init(config: &DriverConfig) -> Result<Self, PgPollError> {
        config.validate()?;
        let backend = PgBackend::new(config.io_threads)?;
        Self::with_backend(backend, config)
    }
}

impl<B: Backend> Driver<B> {
    /// Like [`Driver::init`] but over any backend.
    ///
    /// Every slot is created and connected up front. In blocking mode the
    /// first failed connect aborts; in non-blocking mode handshakes are only
    /// started and finish as the connections are polled.
    ///
    /// # Errors
    /// Returns `PgPollError::ConfigError` for an invalid config and
    /// `PgPollError::ConnectionError` if a blocking warm-up connect fails.
    pub fn with_backend(backend: B, config: &DriverConfig) -> Result<Self, PgPollError> {
        config.validate()?;
        let mut driver = Self {
            backend,
            conninfo: config.conninfo.clone(),
            pool: ObjectPool::new(usize::from(config.pool_size)),
        };
        driver.warm_up(config.warmup)?;

        tracing::info!(
            pool_size = config.pool_size,
            warmup = ?config.warmup,
            "driver initialized"
        );
        Ok(driver)
    }

    fn warm_up(&mut self, mode: ConnectMode) -> Result<(), PgPollError> {
        let mut handles = Vec::with_capacity(self.pool.capacity());
        while let Some(handle) = self.create() {
            handles.push(handle);
        }

        let mut outcome = Ok(());
        for handle in &handles {
            let conninfo = self.conninfo.clone();
            let conn = self.pool.get_mut(handle)?;
            if let Err(e) = conn.connect(&conninfo, mode) {
                tracing::error!(slot = handle.index(), error = %e, "warm-up connect failed");
                outcome = Err(e);
                break;
            }
        }

        // released in reverse so the first slot is handed out first
        for handle in handles.into_iter().rev() {
            self.pool.release(handle)?;
        }
        outcome
    }

    /// Disconnect every connection and drop the driver.
    pub fn shutdown(mut self) {
        for conn in self.pool.iter_mut() {
            conn.disconnect();
        }
        tracing::info!(connections = self.pool.allocated(), "driver shut down");
    }

    /// Borrow a connection. `None` when every connection is taken.
    pub fn create(&mut self) -> Option<ConnHandle> {
        let backend = &self.backend;
        let conninfo = &self.conninfo;
        let handle = self
            .pool
            .acquire_with(|| Connection::with_conninfo(backend.clone(), conninfo.clone()));
        if handle.is_none() {
            tracing::debug!(capacity = self.pool.capacity(), "pool exhausted");
        }
        handle
    }

    /// Abort whatever the connection is doing and give it back.
    ///
    /// # Errors
    /// Returns `PgPollError::UnreleasedHandle` carrying `handle` if it
    /// belongs to another driver; that driver can still free it.
    pub fn free(&mut self, handle: ConnHandle) -> Result<(), PgPollError> {
        match self.pool.get_mut(&handle) {
            Ok(conn) => conn.abort(),
            Err(_) => return Err(PgPollError::UnreleasedHandle(handle)),
        }
        self.pool.release(handle)
    }

    /// Queue `text` on the connection; see [`Connection::do_query`].
    ///
    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn query(&mut self, handle: &ConnHandle, text: impl Into<String>) -> Result<(), PgPollError> {
        self.pool.get_mut(handle)?.do_query(text);
        Ok(())
    }

    /// One step of progress; see [`Connection::poll`].
    ///
    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn poll(&mut self, handle: &ConnHandle) -> Result<PollStatus, PgPollError> {
        Ok(self.pool.get_mut(handle)?.poll())
    }

    /// Stored result text, if a value or an error is available.
    ///
    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn result(&self, handle: &ConnHandle) -> Result<Option<&str>, PgPollError> {
        let conn = self.pool.get(handle)?;
        Ok((conn.has_result() || conn.result_is_error()).then(|| conn.result()))
    }

    /// Byte length of what [`Driver::result`] returns, 0 for nothing.
    ///
    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn result_len(&self, handle: &ConnHandle) -> Result<usize, PgPollError> {
        Ok(self.result(handle)?.map_or(0, str::len))
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn is_error(&self, handle: &ConnHandle) -> Result<bool, PgPollError> {
        Ok(self.pool.get(handle)?.result_is_error())
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn is_null(&self, handle: &ConnHandle) -> Result<bool, PgPollError> {
        Ok(self.pool.get(handle)?.result_is_null())
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn state(&self, handle: &ConnHandle) -> Result<ConnState, PgPollError> {
        Ok(self.pool.get(handle)?.state())
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn connection(&self, handle: &ConnHandle) -> Result<&Connection<B>, PgPollError> {
        self.pool.get(handle)
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` for a handle from another driver.
    pub fn connection_mut(
        &mut self,
        handle: &ConnHandle,
    ) -> Result<&mut Connection<B>, PgPollError> {
        self.pool.get_mut(handle)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
