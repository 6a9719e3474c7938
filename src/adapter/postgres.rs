use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_postgres::error::DbError;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use super::{Backend, CancelToken, ConnStatus, PollingStatus, QueryResult, Session};
use crate::error::PgPollError;

type ConnectOutcome = Result<Client, tokio_postgres::Error>;
type QueryOutcome = Result<Vec<SimpleQueryMessage>, tokio_postgres::Error>;

const SERVER_CLOSED: &str = "server closed the connection unexpectedly\n";

/// `tokio-postgres` backed session factory.
///
/// Socket futures run on a tokio runtime owned by (or lent to) the backend.
/// The session methods called by the state machine only spawn tasks and
/// inspect `oneshot` channels, so none of them ever waits.
#[derive(Clone)]
pub struct PgBackend {
    handle: Handle,
    _runtime: Option<Arc<Runtime>>,
}

impl std::fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBackend")
            .field("owns_runtime", &self._runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl PgBackend {
    /// Build a backend with its own I/O runtime.
    ///
    /// # Errors
    /// Returns `PgPollError::RuntimeError` if the runtime cannot be started.
    pub fn new(io_threads: usize) -> Result<Self, PgPollError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("pgpoll-io")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(runtime)),
        })
    }

    /// Run socket I/O on a runtime the host already owns.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }
}

impl Backend for PgBackend {
    type Session = PgSession;

    fn start_connect(&self, conninfo: &str) -> PgSession {
        PgSession::spawn(self.handle.clone(), conninfo)
    }

    fn connect_blocking(&self, conninfo: &str) -> PgSession {
        if Handle::try_current().is_ok() {
            return PgSession::failed(
                self.handle.clone(),
                "blocking connect requested from inside an async runtime\n",
            );
        }

        let mut session = PgSession::spawn(self.handle.clone(), conninfo);
        let Phase::Connecting(rx) = std::mem::replace(&mut session.phase, Phase::Failed) else {
            return session;
        };
        match self.handle.block_on(rx) {
            Ok(Ok(client)) => session.phase = Phase::Ready(Arc::new(client)),
            Ok(Err(err)) => session.error = describe_error(&err),
            Err(_) => session.error = "connection task terminated unexpectedly\n".to_string(),
        }
        session
    }
}

enum Phase {
    Connecting(oneshot::Receiver<ConnectOutcome>),
    Ready(Arc<Client>),
    Failed,
}

struct InFlight {
    rx: oneshot::Receiver<QueryOutcome>,
    task: JoinHandle<()>,
}

/// One `tokio-postgres` session. Dropping it aborts the socket task.
pub struct PgSession {
    handle: Handle,
    phase: Phase,
    conn_task: Option<JoinHandle<()>>,
    closed: Option<oneshot::Receiver<String>>,
    in_flight: Option<InFlight>,
    results: VecDeque<QueryResult>,
    error: String,
    nonblocking: bool,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Connecting(_) => "connecting",
            Phase::Ready(_) => "ready",
            Phase::Failed => "failed",
        };
        f.debug_struct("PgSession")
            .field("phase", &phase)
            .field("busy", &self.in_flight.is_some())
            .field("nonblocking", &self.nonblocking)
            .finish_non_exhaustive()
    }
}

impl PgSession {
    fn spawn(handle: Handle, conninfo: &str) -> Self {
        let (tx, rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let conninfo = conninfo.to_owned();
        let conn_task = handle.spawn(async move {
            match tokio_postgres::connect(&conninfo, NoTls).await {
                Ok((client, connection)) => {
                    if tx.send(Ok(client)).is_err() {
                        return;
                    }
                    let reason = match connection.await {
                        Ok(()) => SERVER_CLOSED.to_string(),
                        Err(err) => describe_error(&err),
                    };
                    let _ = closed_tx.send(reason);
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                }
            }
        });
        Self {
            handle,
            phase: Phase::Connecting(rx),
            conn_task: Some(conn_task),
            closed: Some(closed_rx),
            in_flight: None,
            results: VecDeque::new(),
            error: String::new(),
            nonblocking: false,
        }
    }

    fn failed(handle: Handle, message: &str) -> Self {
        Self {
            handle,
            phase: Phase::Failed,
            conn_task: None,
            closed: None,
            in_flight: None,
            results: VecDeque::new(),
            error: message.to_string(),
            nonblocking: false,
        }
    }

    fn mark_broken(&mut self, message: String) {
        self.error = message;
        self.phase = Phase::Failed;
    }

    fn connection_lost(&mut self) -> bool {
        if let Some(closed) = self.closed.as_mut() {
            if let Ok(reason) = closed.try_recv() {
                self.closed = None;
                self.mark_broken(reason);
                return true;
            }
        }
        match &self.phase {
            Phase::Ready(client) if client.is_closed() => {
                self.mark_broken(SERVER_CLOSED.to_string());
                true
            }
            Phase::Failed => true,
            _ => false,
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        if let Some(task) = self.conn_task.take() {
            task.abort();
        }
    }
}

impl Session for PgSession {
    type Cancel = PgCancel;

    fn connect_poll(&mut self) -> PollingStatus {
        let received = match &mut self.phase {
            Phase::Connecting(rx) => rx.try_recv(),
            Phase::Ready(_) => return PollingStatus::Ok,
            Phase::Failed => return PollingStatus::Failed,
        };
        match received {
            Err(TryRecvError::Empty) => PollingStatus::InProgress,
            Ok(Ok(client)) => {
                self.phase = Phase::Ready(Arc::new(client));
                PollingStatus::Ok
            }
            Ok(Err(err)) => {
                self.mark_broken(describe_error(&err));
                PollingStatus::Failed
            }
            Err(TryRecvError::Closed) => {
                self.mark_broken("connection task terminated unexpectedly\n".to_string());
                PollingStatus::Failed
            }
        }
    }

    // Socket I/O lives on the runtime, the caller never blocks either way.
    fn set_nonblocking(&mut self) {
        self.nonblocking = true;
    }

    fn status(&mut self) -> ConnStatus {
        if let Phase::Connecting(_) = self.phase {
            return ConnStatus::Started;
        }
        if self.connection_lost() {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn error_message(&self) -> &str {
        &self.error
    }

    fn send_query(&mut self, text: &str) -> bool {
        if self.in_flight.is_some() {
            self.error = "another command is already in progress\n".to_string();
            return false;
        }
        let client = match &self.phase {
            Phase::Ready(client) if !client.is_closed() => Arc::clone(client),
            _ => {
                self.error = "no connection to the server\n".to_string();
                return false;
            }
        };

        let sql = text.to_owned();
        let (tx, rx) = oneshot::channel();
        let task = self.handle.spawn(async move {
            let _ = tx.send(client.simple_query(&sql).await);
        });
        self.results.clear();
        self.in_flight = Some(InFlight { rx, task });
        tracing::trace!(len = text.len(), "query submitted");
        true
    }

    fn consume_input(&mut self) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return true;
        };
        let received = in_flight.rx.try_recv();
        if matches!(received, Err(TryRecvError::Empty)) {
            return true;
        }
        self.in_flight = None;

        match received {
            Ok(Ok(messages)) => {
                self.results = collect_results(messages);
                true
            }
            Ok(Err(err)) => match server_error(&err) {
                Some(result) => {
                    self.results = VecDeque::from([result]);
                    true
                }
                None => {
                    self.mark_broken(describe_error(&err));
                    false
                }
            },
            Err(_) => {
                self.mark_broken("query task terminated unexpectedly\n".to_string());
                false
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.results.pop_front()
    }

    fn cancel_token(&mut self) -> Option<PgCancel> {
        match &self.phase {
            Phase::Ready(client) => Some(PgCancel {
                handle: self.handle.clone(),
                token: Some(client.cancel_token()),
                delivery: None,
                done: None,
            }),
            _ => None,
        }
    }
}

/// Cancel request for the query running on a [`PgSession`].
///
/// The request goes out over a fresh socket on the I/O runtime; `cancel`
/// only schedules it and `poll_done` reports when it has been handed over.
pub struct PgCancel {
    handle: Handle,
    token: Option<tokio_postgres::CancelToken>,
    delivery: Option<oneshot::Receiver<bool>>,
    done: Option<bool>,
}

impl std::fmt::Debug for PgCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCancel")
            .field("used", &self.token.is_none())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl CancelToken for PgCancel {
    fn cancel(&mut self) -> bool {
        let Some(token) = self.token.take() else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let delivered = match token.cancel_query(NoTls).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "cancel request failed");
                    false
                }
            };
            let _ = tx.send(delivered);
        });
        self.delivery = Some(rx);
        true
    }

    fn poll_done(&mut self) -> Option<bool> {
        if self.done.is_some() {
            return self.done;
        }
        let Some(delivery) = self.delivery.as_mut() else {
            return Some(false);
        };
        let done = match delivery.try_recv() {
            Err(TryRecvError::Empty) => return None,
            Ok(delivered) => delivered,
            Err(TryRecvError::Closed) => false,
        };
        self.delivery = None;
        self.done = Some(done);
        self.done
    }
}

/// Split a simple-query reply into one result object per statement.
fn collect_results(messages: Vec<SimpleQueryMessage>) -> VecDeque<QueryResult> {
    let mut results = VecDeque::new();
    let mut nfields: Option<usize> = None;
    let mut rows: Vec<Vec<Option<String>>> = Vec::new();

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                nfields = Some(columns.len());
            }
            SimpleQueryMessage::Row(row) => {
                nfields.get_or_insert(row.len());
                rows.push((0..row.len()).map(|idx| row.get(idx).map(str::to_owned)).collect());
            }
            SimpleQueryMessage::CommandComplete(_) => {
                let result = match nfields.take() {
                    Some(count) => QueryResult::tuples(count, std::mem::take(&mut rows)),
                    None => QueryResult::command(),
                };
                results.push_back(result);
            }
            _ => {}
        }
    }
    results
}

fn server_error(err: &tokio_postgres::Error) -> Option<QueryResult> {
    let db = err.as_db_error()?;
    Some(QueryResult::fatal(
        Some(db.code().code().to_owned()),
        render_db_error(db),
    ))
}

fn describe_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => render_db_error(db),
        None => format!("{err}\n"),
    }
}

/// Render a server error the way libpq's `PQresultErrorMessage` does.
pub(crate) fn render_db_error(db: &DbError) -> String {
    let mut text = format!("{}:  {}\n", db.severity(), db.message());
    if let Some(detail) = db.detail() {
        let _ = writeln!(text, "DETAIL:  {detail}");
    }
    if let Some(hint) = db.hint() {
        let _ = writeln!(text, "HINT:  {hint}");
    }
    text
}
