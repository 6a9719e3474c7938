// Connection library adapter.
//
// The state machine in `connection` talks to the database only through the
// traits below. They mirror the primitives of a non-blocking client library:
// start a handshake and poll it, submit a command, poll for busy/ready, pull
// results one at a time, grab a one-shot cancel token. No method may wait on
// I/O; each call inspects whatever progress has already happened and returns.
//
// - postgres: the tokio-postgres backed implementation

pub mod postgres;

pub use postgres::{PgBackend, PgCancel, PgSession};

/// Progress of an asynchronous handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Still exchanging startup messages.
    InProgress,
    /// Session established.
    Ok,
    /// Handshake failed; the session's error message says why.
    Failed,
}

/// Liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Established and usable.
    Ok,
    /// Dead; tear it down and start over.
    Bad,
    /// Handshake has not finished yet.
    Started,
}

/// Status of one result object produced by a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Statement ran and returned no row description.
    CommandOk,
    /// Statement ran and returned rows (possibly zero).
    TuplesOk,
    /// Statement was empty.
    EmptyQuery,
    /// Server rejected the statement.
    FatalError,
}

/// One result object, the way a client library hands it out after a
/// statement of a (possibly multi-statement) command finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    status: ExecStatus,
    nfields: usize,
    rows: Vec<Vec<Option<String>>>,
    sqlstate: Option<String>,
    error_message: String,
}

impl QueryResult {
    /// A statement that produced a row description (possibly zero rows).
    #[must_use]
    pub fn tuples(nfields: usize, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            status: ExecStatus::TuplesOk,
            nfields,
            rows,
            sqlstate: None,
            error_message: String::new(),
        }
    }

    /// A statement without a row description (INSERT, SET, ...).
    #[must_use]
    pub fn command() -> Self {
        Self {
            status: ExecStatus::CommandOk,
            nfields: 0,
            rows: Vec::new(),
            sqlstate: None,
            error_message: String::new(),
        }
    }

    #[must_use]
    pub fn empty_query() -> Self {
        Self {
            status: ExecStatus::EmptyQuery,
            ..Self::command()
        }
    }

    /// A statement the server failed. `message` is the full, human readable
    /// report (severity prefix, detail and hint lines included).
    #[must_use]
    pub fn fatal(sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::FatalError,
            nfields: 0,
            rows: Vec::new(),
            sqlstate,
            error_message: message.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> ExecStatus {
        self.status
    }

    #[must_use]
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// Cell text; `None` when out of range or SQL NULL.
    #[must_use]
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    #[must_use]
    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    /// Five character SQLSTATE of a fatal error.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    #[must_use]
    pub fn error_message(&self) -> &str {
        &self.error_message
    }
}

/// Factory for sessions. Cloned into every pooled connection.
pub trait Backend: Clone {
    type Session: Session;

    /// Begin a handshake without waiting. Problems, including a malformed
    /// connection string, surface later through `Session::connect_poll`.
    fn start_connect(&self, conninfo: &str) -> Self::Session;

    /// Connect synchronously. Check `Session::status` for the outcome.
    fn connect_blocking(&self, conninfo: &str) -> Self::Session;
}

/// A single backend session.
pub trait Session {
    type Cancel: CancelToken;

    /// Advance the handshake as far as already-arrived data allows.
    fn connect_poll(&mut self) -> PollingStatus;

    /// Switch subsequent I/O to non-blocking mode.
    fn set_nonblocking(&mut self);

    fn status(&mut self) -> ConnStatus;

    /// Raw text of the last connection-level failure.
    fn error_message(&self) -> &str;

    /// Submit command text. `false` means the library refused it.
    fn send_query(&mut self, text: &str) -> bool;

    /// Absorb whatever input has arrived. `false` means the session broke.
    fn consume_input(&mut self) -> bool;

    /// `true` while the next result object has not fully arrived.
    fn is_busy(&self) -> bool;

    /// Next result object of the current command, `None` once all are consumed.
    fn next_result(&mut self) -> Option<QueryResult>;

    /// One-shot token able to cancel the running command.
    fn cancel_token(&mut self) -> Option<Self::Cancel>;
}

/// Cancel capability obtained from a live session.
pub trait CancelToken {
    /// Submit the cancel request. `false` if it could not be sent.
    fn cancel(&mut self) -> bool;

    /// Delivery of a submitted request: `None` while it is still on its way,
    /// `Some(true)` once the server has it, `Some(false)` if it never will.
    /// A token that was never submitted reports `Some(false)`.
    fn poll_done(&mut self) -> Option<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_accessors_distinguish_null_from_missing() {
        let res = QueryResult::tuples(2, vec![vec![Some("1".into()), None]]);
        assert_eq!(res.ntuples(), 1);
        assert_eq!(res.nfields(), 2);
        assert_eq!(res.value(0, 0), Some("1"));
        assert!(!res.is_null(0, 0));
        assert!(res.is_null(0, 1));
        assert!(!res.is_null(1, 0));
        assert_eq!(res.value(3, 3), None);
    }

    #[test]
    fn fatal_result_keeps_code_and_message() {
        let res = QueryResult::fatal(Some("42601".into()), "ERROR:  syntax error\n");
        assert_eq!(res.status(), ExecStatus::FatalError);
        assert_eq!(res.sqlstate(), Some("42601"));
        assert_eq!(res.error_message(), "ERROR:  syntax error\n");
        assert_eq!(res.ntuples(), 0);
    }
}
