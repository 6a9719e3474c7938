// Connection state machine.
//
// One `Connection` runs one query at a time over one backend session and is
// driven entirely by `poll`. The session lives inside the state it belongs
// to, so a state without its session cannot be expressed. Every transition
// caused by `poll` is in `Connection::step`; `connect`, `do_query`, `abort`
// and `disconnect` are the only other places that move the machine.

mod outcome;

use std::mem;

use crate::adapter::{Backend, CancelToken, ConnStatus, PollingStatus, Session};
use crate::error::PgPollError;
use crate::types::{ConnState, ConnectMode, PollStatus};

use outcome::Outcome;

enum State<S: Session> {
    Start,
    Connecting(S),
    Connected(S),
    Query(S),
    Result(S),
    Cancel(S, S::Cancel),
}

impl<S: Session> State<S> {
    fn kind(&self) -> ConnState {
        match self {
            State::Start => ConnState::Start,
            State::Connecting(_) => ConnState::Connecting,
            State::Connected(_) => ConnState::Connected,
            State::Query(_) => ConnState::Query,
            State::Result(_) => ConnState::Result,
            State::Cancel(..) => ConnState::Cancel,
        }
    }
}

/// What to do when a running query cannot be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelFallback {
    /// Drop the session and start a fresh handshake.
    Reconnect,
    /// Drop the session and stay disconnected.
    Teardown,
}

/// A single poll-driven backend connection.
///
/// ```rust
/// use pgpoll::prelude::*;
/// use pgpoll::test_utils::mock::MockBackend;
///
/// let mut conn = Connection::new(MockBackend::new());
/// conn.connect("host=mock", ConnectMode::NonBlocking).unwrap();
/// conn.do_query("select 1");
/// while conn.poll().is_pending() {}
/// assert!(conn.has_result());
/// assert_eq!(conn.result(), "1");
/// ```
pub struct Connection<B: Backend> {
    backend: B,
    state: State<B::Session>,
    conninfo: Option<String>,
    pending: Option<String>,
    in_flight: Option<String>,
    outcome: Outcome,
    last_error: String,
    failures: u32,
}

impl<B: Backend> std::fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state.kind())
            .field("pending", &self.pending)
            .field("in_flight", &self.in_flight)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Connection<B> {
    /// An idle connection with no connection string; `connect` must come first.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: State::Start,
            conninfo: None,
            pending: None,
            in_flight: None,
            outcome: Outcome::default(),
            last_error: String::new(),
            failures: 0,
        }
    }

    /// An idle connection that will start its handshake on the first `poll`.
    #[must_use]
    pub fn with_conninfo(backend: B, conninfo: impl Into<String>) -> Self {
        let mut conn = Self::new(backend);
        conn.conninfo = Some(conninfo.into());
        conn
    }

    /// Tear down any session and connect again with `conninfo`.
    ///
    /// In `NonBlocking` mode only the handshake is started; its outcome shows
    /// up through `poll`.
    ///
    /// # Errors
    /// Returns `PgPollError::ConnectionError` carrying the library's message
    /// if a blocking connect fails. The message is also kept in `last_error`.
    pub fn connect(&mut self, conninfo: &str, mode: ConnectMode) -> Result<(), PgPollError> {
        self.disconnect();
        self.outcome.clear();
        self.failures = 0;
        self.conninfo = Some(conninfo.to_owned());

        match mode {
            ConnectMode::NonBlocking => {
                self.state = self.begin_handshake();
                Ok(())
            }
            ConnectMode::Blocking => {
                let mut session = self.backend.connect_blocking(conninfo);
                if session.status() == ConnStatus::Ok {
                    session.set_nonblocking();
                    self.state = State::Connected(session);
                    Ok(())
                } else {
                    self.last_error = session.error_message().to_owned();
                    Err(PgPollError::ConnectionError(self.last_error.clone()))
                }
            }
        }
    }

    /// Close the session. A running query gets a best-effort cancel first.
    ///
    /// The connection string is kept, so a later `do_query` reconnects.
    pub fn disconnect(&mut self) {
        let state = mem::replace(&mut self.state, State::Start);
        let had_session = !matches!(state, State::Start);
        if let State::Query(session) = state {
            drop(self.cancel(session, CancelFallback::Teardown));
        }
        self.pending = None;
        self.in_flight = None;
        if had_session {
            tracing::debug!("disconnected");
        }
    }

    /// Queue `text` as the next command.
    ///
    /// An unread result is discarded; a query still in flight is cancelled
    /// (falling back to a reconnect if it cannot be). Never blocks.
    pub fn do_query(&mut self, text: impl Into<String>) {
        self.outcome.clear();
        self.state = match mem::replace(&mut self.state, State::Start) {
            State::Result(session) => State::Connected(session),
            State::Query(session) => self.cancel(session, CancelFallback::Reconnect),
            other => other,
        };
        self.pending = Some(text.into());
    }

    /// Give up on the current command.
    ///
    /// A running query is cancelled; if the cancel cannot be sent the
    /// session is replaced so the machine never sticks in QUERY.
    pub fn abort(&mut self) {
        self.pending = None;
        self.state = match mem::replace(&mut self.state, State::Start) {
            State::Query(session) => self.cancel(session, CancelFallback::Reconnect),
            other => other,
        };
    }

    /// Make one bounded step of progress.
    pub fn poll(&mut self) -> PollStatus {
        let state = mem::replace(&mut self.state, State::Start);
        let before = state.kind();
        let (next, status) = self.step(state);
        let after = next.kind();
        if before != after {
            tracing::trace!(from = %before, to = %after, "state transition");
        }
        self.state = next;
        status
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state.kind()
    }

    /// `true` only while a complete result is stored and unread.
    #[must_use]
    pub fn has_result(&self) -> bool {
        matches!(self.state, State::Result(_)) && self.outcome.has_result
    }

    #[must_use]
    pub fn result_is_null(&self) -> bool {
        self.outcome.is_null
    }

    #[must_use]
    pub fn result_is_error(&self) -> bool {
        self.outcome.is_error
    }

    /// Stored value, SQLSTATE-prefixed server error, or raw connection error.
    #[must_use]
    pub fn result(&self) -> &str {
        &self.outcome.text
    }

    /// Message of the last failed blocking connect.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    #[must_use]
    pub fn has_last_error(&self) -> bool {
        !self.last_error.is_empty()
    }

    #[must_use]
    pub fn pending_query(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    #[must_use]
    pub fn conninfo(&self) -> Option<&str> {
        self.conninfo.as_deref()
    }

    fn step(&mut self, state: State<B::Session>) -> (State<B::Session>, PollStatus) {
        match state {
            State::Start => {
                let next = self.begin_handshake();
                let status = match next {
                    State::Start => PollStatus::Ready,
                    _ => PollStatus::Pending,
                };
                (next, status)
            }
            State::Connecting(session) => self.advance_handshake(session),
            State::Connected(session) => self.submit(session),
            State::Query(session) => self.drain(session, None),
            State::Result(session) => (State::Result(session), PollStatus::Ready),
            State::Cancel(session, token) => self.drain(session, Some(token)),
        }
    }

    fn begin_handshake(&mut self) -> State<B::Session> {
        match self.conninfo.as_deref() {
            Some(conninfo) => State::Connecting(self.backend.start_connect(conninfo)),
            None => State::Start,
        }
    }

    fn advance_handshake(&mut self, mut session: B::Session) -> (State<B::Session>, PollStatus) {
        match session.connect_poll() {
            PollingStatus::InProgress => (State::Connecting(session), PollStatus::Pending),
            PollingStatus::Ok => {
                session.set_nonblocking();
                if self.failures > 0 {
                    tracing::info!(attempts = self.failures, "connection re-established");
                }
                self.failures = 0;
                let (next, _) = self.submit(session);
                (next, PollStatus::Pending)
            }
            PollingStatus::Failed => (
                self.reconnect(session, "handshake failed"),
                PollStatus::Pending,
            ),
        }
    }

    fn submit(&mut self, mut session: B::Session) -> (State<B::Session>, PollStatus) {
        let Some(query) = self.pending.take() else {
            return (State::Connected(session), PollStatus::Ready);
        };
        self.outcome.clear();

        match session.status() {
            ConnStatus::Bad => {
                self.pending = Some(query);
                (self.reconnect(session, "connection lost"), PollStatus::Pending)
            }
            ConnStatus::Started => {
                self.pending = Some(query);
                (State::Connecting(session), PollStatus::Pending)
            }
            ConnStatus::Ok => {
                if session.send_query(&query) {
                    tracing::debug!(len = query.len(), "query sent");
                    self.in_flight = Some(query);
                    (State::Query(session), PollStatus::Pending)
                } else {
                    let message = session.error_message().to_owned();
                    tracing::warn!(error = %message.trim_end(), "query submission rejected");
                    self.outcome.set_connection_error(message);
                    (State::Connected(session), PollStatus::Ready)
                }
            }
        }
    }

    fn drain(
        &mut self,
        mut session: B::Session,
        mut token: Option<<B::Session as Session>::Cancel>,
    ) -> (State<B::Session>, PollStatus) {
        let cancelling = token.is_some();
        // CANCEL ends only once the request has reached the server, or a
        // late cancel would hit the next command
        let cancel_done = token.as_mut().and_then(CancelToken::poll_done);
        if cancel_done == Some(false) {
            drop(token);
            tracing::warn!("cancel request was not delivered, reconnecting");
            drop(session);
            return (self.begin_handshake(), PollStatus::Pending);
        }

        match session.status() {
            ConnStatus::Bad => {
                self.requeue_in_flight();
                return (self.reconnect(session, "connection lost"), PollStatus::Pending);
            }
            ConnStatus::Started => {
                self.requeue_in_flight();
                return (State::Connecting(session), PollStatus::Pending);
            }
            ConnStatus::Ok => {}
        }

        if session.is_busy() && !session.consume_input() {
            self.requeue_in_flight();
            return (
                self.reconnect(session, "connection lost while reading results"),
                PollStatus::Pending,
            );
        }

        while !session.is_busy() {
            let Some(result) = session.next_result() else {
                return match token {
                    Some(token) if cancel_done == Some(true) => {
                        drop(token);
                        tracing::debug!("cancelled query drained");
                        (State::Connected(session), PollStatus::Pending)
                    }
                    Some(token) => (State::Cancel(session, token), PollStatus::Pending),
                    None => {
                        self.in_flight = None;
                        (State::Result(session), PollStatus::Ready)
                    }
                };
            };
            if !cancelling {
                self.outcome.absorb(&result);
            }
        }

        let state = match token {
            Some(token) => State::Cancel(session, token),
            None => State::Query(session),
        };
        (state, PollStatus::Pending)
    }

    fn cancel(&mut self, mut session: B::Session, fallback: CancelFallback) -> State<B::Session> {
        self.in_flight = None;
        if let Some(mut token) = session.cancel_token() {
            if token.cancel() {
                tracing::debug!("cancel requested");
                return State::Cancel(session, token);
            }
        }

        tracing::warn!(
            fallback = ?fallback,
            error = %session.error_message().trim_end(),
            "could not cancel running query"
        );
        drop(session);
        match fallback {
            CancelFallback::Reconnect => self.begin_handshake(),
            CancelFallback::Teardown => State::Start,
        }
    }

    fn reconnect(&mut self, session: B::Session, context: &'static str) -> State<B::Session> {
        let message = session.error_message().to_owned();
        drop(session);

        self.failures = self.failures.saturating_add(1);
        if self.failures == 1 {
            tracing::warn!(error = %message.trim_end(), "{}, reconnecting", context);
        } else {
            tracing::debug!(
                attempt = self.failures,
                error = %message.trim_end(),
                "{}, reconnecting",
                context
            );
        }
        self.outcome.set_connection_error(message);
        self.begin_handshake()
    }

    fn requeue_in_flight(&mut self) {
        let in_flight = self.in_flight.take();
        if self.pending.is_none() {
            self.pending = in_flight;
        }
    }
}
