//! Deterministic in-memory backend.
//!
//! Every session created by one [`MockBackend`] talks to the same fake
//! server, so tests can inspect side effects, kill live sessions or make
//! cancel requests fail. Time is counted in calls: a handshake needs
//! `handshake_ticks` calls to `connect_poll`, a query needs `query_ticks`
//! (plus any `sleep`) calls to `consume_input`.
//!
//! Statements, separated by `;`:
//!
//! | Statement | Result |
//! |---|---|
//! | `select null` | one NULL cell |
//! | `select <literal>` | one cell, single quotes stripped |
//! | `get <key>` | one cell with the stored value, NULL if unset |
//! | `set <key> <value>` | command, stores the value |
//! | `sleep <ticks>` | command, delays completion |
//! | `empty` | zero rows |
//! | `error <sqlstate>` | fatal error, rest of the command skipped |
//!
//! A command runs as one implicit transaction: an error or a cancel
//! discards every `set` in it.
//!
//! Cancel requests travel for `cancel_delay` ticks before the server sees
//! them. One that lands while a command runs kills that command, whichever
//! it is; one that lands on an idle session is ignored.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::adapter::{Backend, CancelToken, ConnStatus, PollingStatus, QueryResult, Session};

const SERVER_CLOSED: &str = "server closed the connection unexpectedly\n";
const CANCELED: &str = "ERROR:  canceling statement due to user request\n";

#[derive(Debug)]
struct ServerState {
    handshake_ticks: u32,
    query_ticks: u32,
    failing_handshakes: u32,
    cancel_tokens: bool,
    cancel_accepts: bool,
    cancel_delay: u32,
    cancel_delivery_fails: bool,
    reject_queries: bool,
    epoch: u64,
    next_session: u64,
    next_cancel: u64,
    connects: usize,
    blocking_connects: usize,
    live_sessions: usize,
    nonblocking_switches: usize,
    cancels_sent: usize,
    cancels: Vec<CancelRequest>,
    running: HashSet<u64>,
    cancel_hits: HashSet<u64>,
    store: HashMap<String, String>,
    committed: Vec<String>,
}

#[derive(Debug)]
struct CancelRequest {
    id: u64,
    session: u64,
    ticks_left: u32,
    delivered: Option<bool>,
    orphaned: bool,
}

impl ServerState {
    /// Let one tick pass for every cancel request still on its way.
    fn tick_cancels(&mut self) {
        let Self {
            cancels,
            running,
            cancel_hits,
            cancel_delivery_fails,
            ..
        } = self;
        for request in cancels.iter_mut().filter(|r| r.delivered.is_none()) {
            request.ticks_left = request.ticks_left.saturating_sub(1);
            if request.ticks_left == 0 {
                request.delivered = Some(deliver(request.session, *cancel_delivery_fails, running, cancel_hits));
            }
        }
        cancels.retain(|r| !(r.orphaned && r.delivered.is_some()));
    }
}

fn deliver(session: u64, fails: bool, running: &HashSet<u64>, hits: &mut HashSet<u64>) -> bool {
    if fails {
        return false;
    }
    if running.contains(&session) {
        hits.insert(session);
    }
    true
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            handshake_ticks: 1,
            query_ticks: 1,
            failing_handshakes: 0,
            cancel_tokens: true,
            cancel_accepts: true,
            cancel_delay: 0,
            cancel_delivery_fails: false,
            reject_queries: false,
            epoch: 0,
            next_session: 0,
            next_cancel: 0,
            connects: 0,
            blocking_connects: 0,
            live_sessions: 0,
            nonblocking_switches: 0,
            cancels_sent: 0,
            cancels: Vec::new(),
            running: HashSet::new(),
            cancel_hits: HashSet::new(),
            store: HashMap::new(),
            committed: Vec::new(),
        }
    }
}

/// Handle to a shared fake server. Cloning shares the server.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    server: Rc<RefCell<ServerState>>,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to `connect_poll` before a handshake completes.
    pub fn set_handshake_ticks(&self, ticks: u32) {
        self.server.borrow_mut().handshake_ticks = ticks;
    }

    /// Calls to `consume_input` before a query completes.
    pub fn set_query_ticks(&self, ticks: u32) {
        self.server.borrow_mut().query_ticks = ticks.max(1);
    }

    /// Make the next `count` handshakes fail with "connection refused".
    pub fn fail_next_handshakes(&self, count: u32) {
        self.server.borrow_mut().failing_handshakes = count;
    }

    /// Whether sessions hand out cancel tokens.
    pub fn set_cancel_tokens(&self, enabled: bool) {
        self.server.borrow_mut().cancel_tokens = enabled;
    }

    /// Whether cancel requests can be sent at all.
    pub fn set_cancel_accepts(&self, accepts: bool) {
        self.server.borrow_mut().cancel_accepts = accepts;
    }

    /// Ticks a sent cancel request travels before the server sees it.
    pub fn set_cancel_delay(&self, ticks: u32) {
        self.server.borrow_mut().cancel_delay = ticks;
    }

    /// Make sent cancel requests get lost on the way.
    pub fn set_cancel_delivery_fails(&self, fails: bool) {
        self.server.borrow_mut().cancel_delivery_fails = fails;
    }

    /// Refuse every `send_query` while set.
    pub fn set_reject_queries(&self, reject: bool) {
        self.server.borrow_mut().reject_queries = reject;
    }

    /// Kill every session that is currently established.
    pub fn drop_connections(&self) {
        self.server.borrow_mut().epoch += 1;
    }

    /// Stored value of `key`, as written by a committed `set`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.server.borrow().store.get(key).cloned()
    }

    /// Non-blocking handshakes started so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.server.borrow().connects
    }

    #[must_use]
    pub fn blocking_connects(&self) -> usize {
        self.server.borrow().blocking_connects
    }

    /// Sessions not yet dropped.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.server.borrow().live_sessions
    }

    /// Commands that ran to completion without error, in order.
    #[must_use]
    pub fn committed(&self) -> Vec<String> {
        self.server.borrow().committed.clone()
    }

    /// Cancel requests sent so far.
    #[must_use]
    pub fn cancel_requests(&self) -> usize {
        self.server.borrow().cancels_sent
    }

    /// Sessions switched to non-blocking mode so far.
    #[must_use]
    pub fn nonblocking_switches(&self) -> usize {
        self.server.borrow().nonblocking_switches
    }

    fn open(&self, conninfo: &str, blocking: bool) -> MockSession {
        let mut server = self.server.borrow_mut();
        if blocking {
            server.blocking_connects += 1;
        } else {
            server.connects += 1;
        }
        server.next_session += 1;
        server.live_sessions += 1;

        let failure = if let Some(word) = malformed_word(conninfo) {
            Some(format!(
                "missing \"=\" after \"{word}\" in connection info string\n"
            ))
        } else if server.failing_handshakes > 0 {
            server.failing_handshakes -= 1;
            Some("could not connect to server: Connection refused\n".to_string())
        } else {
            None
        };

        MockSession {
            server: Rc::clone(&self.server),
            id: server.next_session,
            epoch: server.epoch,
            phase: MockPhase::Handshake(server.handshake_ticks),
            failure,
            error: String::new(),
            query: None,
            results: VecDeque::new(),
        }
    }
}

impl Backend for MockBackend {
    type Session = MockSession;

    fn start_connect(&self, conninfo: &str) -> MockSession {
        self.open(conninfo, false)
    }

    fn connect_blocking(&self, conninfo: &str) -> MockSession {
        let mut session = self.open(conninfo, true);
        session.phase = MockPhase::Handshake(0);
        session.connect_poll();
        session
    }
}

fn malformed_word(conninfo: &str) -> Option<&str> {
    let first = conninfo.split_whitespace().next()?;
    if first.contains('=') || conninfo.contains("://") {
        None
    } else {
        Some(first)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockPhase {
    Handshake(u32),
    Ready,
    Failed,
}

#[derive(Debug)]
struct MockQuery {
    text: String,
    ticks_left: u32,
}

/// Session on the fake server.
#[derive(Debug)]
pub struct MockSession {
    server: Rc<RefCell<ServerState>>,
    id: u64,
    epoch: u64,
    phase: MockPhase,
    failure: Option<String>,
    error: String,
    query: Option<MockQuery>,
    results: VecDeque<QueryResult>,
}

impl MockSession {
    fn alive(&mut self) -> bool {
        if self.phase == MockPhase::Ready && self.server.borrow().epoch != self.epoch {
            self.phase = MockPhase::Failed;
            self.error = SERVER_CLOSED.to_string();
        }
        self.phase != MockPhase::Failed
    }

    fn finish(&mut self, query: &MockQuery) {
        let mut server = self.server.borrow_mut();
        let mut scratch = server.store.clone();
        let mut results = VecDeque::new();
        let mut failed = false;

        for statement in query.text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let result = run_statement(statement, &mut scratch);
            failed = result.sqlstate().is_some();
            results.push_back(result);
            if failed {
                break;
            }
        }

        server.running.remove(&self.id);
        if !failed {
            server.store = scratch;
            server.committed.push(query.text.clone());
        }
        self.results = results;
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut server = self.server.borrow_mut();
        server.live_sessions -= 1;
        server.running.remove(&self.id);
        server.cancel_hits.remove(&self.id);
    }
}

fn run_statement(statement: &str, store: &mut HashMap<String, String>) -> QueryResult {
    let mut words = statement.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let rest: Vec<&str> = words.collect();

    match (verb.as_str(), rest.as_slice()) {
        ("select", [literal]) if literal.eq_ignore_ascii_case("null") => {
            QueryResult::tuples(1, vec![vec![None]])
        }
        ("select", [_, ..]) => {
            let literal = rest.join(" ");
            let literal = literal.trim_matches('\'').to_string();
            QueryResult::tuples(1, vec![vec![Some(literal)]])
        }
        ("get", [key]) => QueryResult::tuples(1, vec![vec![store.get(*key).cloned()]]),
        ("set", [key, value]) => {
            store.insert((*key).to_string(), (*value).to_string());
            QueryResult::command()
        }
        ("sleep", [_]) => QueryResult::command(),
        ("empty", []) => QueryResult::tuples(1, Vec::new()),
        ("error", [code]) => QueryResult::fatal(Some((*code).to_string()), format!("ERROR:  {code}\n")),
        _ => QueryResult::fatal(
            Some("42601".to_string()),
            format!("ERROR:  syntax error at or near \"{verb}\"\n"),
        ),
    }
}

fn sleep_ticks(text: &str) -> u32 {
    text.split(';')
        .filter_map(|statement| {
            let mut words = statement.split_whitespace();
            match (words.next(), words.next()) {
                (Some(verb), Some(ticks)) if verb.eq_ignore_ascii_case("sleep") => {
                    ticks.parse::<u32>().ok()
                }
                _ => None,
            }
        })
        .sum()
}

impl Session for MockSession {
    type Cancel = MockCancel;

    fn connect_poll(&mut self) -> PollingStatus {
        match self.phase {
            MockPhase::Ready => PollingStatus::Ok,
            MockPhase::Failed => PollingStatus::Failed,
            MockPhase::Handshake(_) if self.failure.is_some() => {
                self.error = self.failure.take().unwrap_or_default();
                self.phase = MockPhase::Failed;
                PollingStatus::Failed
            }
            MockPhase::Handshake(0) => {
                self.phase = MockPhase::Ready;
                PollingStatus::Ok
            }
            MockPhase::Handshake(left) => {
                self.phase = MockPhase::Handshake(left - 1);
                PollingStatus::InProgress
            }
        }
    }

    fn set_nonblocking(&mut self) {
        self.server.borrow_mut().nonblocking_switches += 1;
    }

    fn status(&mut self) -> ConnStatus {
        if let MockPhase::Handshake(_) = self.phase {
            return ConnStatus::Started;
        }
        if self.alive() {
            ConnStatus::Ok
        } else {
            ConnStatus::Bad
        }
    }

    fn error_message(&self) -> &str {
        &self.error
    }

    fn send_query(&mut self, text: &str) -> bool {
        if !self.alive() || self.phase != MockPhase::Ready {
            self.error = "no connection to the server\n".to_string();
            return false;
        }
        if self.query.is_some() {
            self.error = "another command is already in progress\n".to_string();
            return false;
        }
        let mut server = self.server.borrow_mut();
        if server.reject_queries {
            self.error = "command rejected by mock server\n".to_string();
            return false;
        }
        let base = server.query_ticks;
        server.running.insert(self.id);
        drop(server);
        self.results.clear();
        self.query = Some(MockQuery {
            text: text.to_string(),
            ticks_left: base + sleep_ticks(text),
        });
        true
    }

    fn consume_input(&mut self) -> bool {
        if !self.alive() {
            return false;
        }
        let hit = {
            let mut server = self.server.borrow_mut();
            server.tick_cancels();
            server.cancel_hits.remove(&self.id)
        };
        let Some(mut query) = self.query.take() else {
            return true;
        };
        if hit {
            self.server.borrow_mut().running.remove(&self.id);
            self.results = VecDeque::from([QueryResult::fatal(Some("57014".to_string()), CANCELED)]);
            return true;
        }
        query.ticks_left = query.ticks_left.saturating_sub(1);
        if query.ticks_left == 0 {
            self.finish(&query);
        } else {
            self.query = Some(query);
        }
        true
    }

    fn is_busy(&self) -> bool {
        self.query.is_some()
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.results.pop_front()
    }

    fn cancel_token(&mut self) -> Option<MockCancel> {
        if self.phase != MockPhase::Ready || !self.server.borrow().cancel_tokens {
            return None;
        }
        Some(MockCancel {
            server: Rc::clone(&self.server),
            session: self.id,
            used: false,
            request: None,
            done: None,
        })
    }
}

/// Cancel token for a [`MockSession`].
#[derive(Debug)]
pub struct MockCancel {
    server: Rc<RefCell<ServerState>>,
    session: u64,
    used: bool,
    request: Option<u64>,
    done: Option<bool>,
}

impl CancelToken for MockCancel {
    fn cancel(&mut self) -> bool {
        if self.used {
            return false;
        }
        self.used = true;
        let mut server = self.server.borrow_mut();
        if !server.cancel_accepts {
            return false;
        }
        server.next_cancel += 1;
        server.cancels_sent += 1;
        let id = server.next_cancel;
        let mut request = CancelRequest {
            id,
            session: self.session,
            ticks_left: server.cancel_delay,
            delivered: None,
            orphaned: false,
        };
        if request.ticks_left == 0 {
            let ServerState {
                running,
                cancel_hits,
                cancel_delivery_fails,
                ..
            } = &mut *server;
            request.delivered = Some(deliver(self.session, *cancel_delivery_fails, running, cancel_hits));
        }
        server.cancels.push(request);
        self.request = Some(id);
        true
    }

    fn poll_done(&mut self) -> Option<bool> {
        if self.done.is_some() {
            return self.done;
        }
        let Some(id) = self.request else {
            return Some(false);
        };
        let mut server = self.server.borrow_mut();
        server.tick_cancels();
        let position = server.cancels.iter().position(|r| r.id == id)?;
        let delivered = server.cancels[position].delivered?;
        server.cancels.remove(position);
        self.done = Some(delivered);
        self.done
    }
}

impl Drop for MockCancel {
    fn drop(&mut self) {
        let Some(id) = self.request else {
            return;
        };
        // still travelling requests reach the server regardless
        let mut server = self.server.borrow_mut();
        server.cancels.retain(|r| r.id != id || r.delivered.is_none());
        if let Some(request) = server.cancels.iter_mut().find(|r| r.id == id) {
            request.orphaned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_session(backend: &MockBackend) -> MockSession {
        let mut session = backend.connect_blocking("host=mock");
        assert_eq!(session.status(), ConnStatus::Ok);
        session
    }

    fn run(session: &mut MockSession, text: &str) -> Vec<QueryResult> {
        assert!(session.send_query(text));
        while session.is_busy() {
            assert!(session.consume_input());
        }
        std::iter::from_fn(|| session.next_result()).collect()
    }

    #[test]
    fn handshake_takes_configured_ticks() {
        let backend = MockBackend::new();
        backend.set_handshake_ticks(2);
        let mut session = backend.start_connect("host=mock");
        assert_eq!(session.status(), ConnStatus::Started);
        assert_eq!(session.connect_poll(), PollingStatus::InProgress);
        assert_eq!(session.connect_poll(), PollingStatus::InProgress);
        assert_eq!(session.connect_poll(), PollingStatus::Ok);
        assert_eq!(backend.connects(), 1);
    }

    #[test]
    fn statements_produce_one_result_each() {
        let backend = MockBackend::new();
        let mut session = ready_session(&backend);
        let results = run(&mut session, "set a 1; get a; select null; empty");
        assert_eq!(results.len(), 4);
        assert_eq!(results[1].value(0, 0), Some("1"));
        assert!(results[2].is_null(0, 0));
        assert_eq!(results[3].ntuples(), 0);
        assert_eq!(backend.value("a").as_deref(), Some("1"));
    }

    #[test]
    fn error_rolls_back_the_whole_command() {
        let backend = MockBackend::new();
        let mut session = ready_session(&backend);
        let results = run(&mut session, "set a 1; error 22012; set b 2");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].sqlstate(), Some("22012"));
        assert_eq!(backend.value("a"), None);
        assert_eq!(backend.value("b"), None);
        assert!(backend.committed().is_empty());
    }

    #[test]
    fn cancel_discards_side_effects() {
        let backend = MockBackend::new();
        let mut session = ready_session(&backend);
        assert!(session.send_query("set a 1; sleep 10"));
        let mut token = session.cancel_token().unwrap();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(session.consume_input());
        let result = session.next_result().unwrap();
        assert_eq!(result.sqlstate(), Some("57014"));
        assert_eq!(backend.value("a"), None);
        assert_eq!(token.poll_done(), Some(true));
    }

    #[test]
    fn late_cancel_hits_the_next_command() {
        let backend = MockBackend::new();
        backend.set_cancel_delay(2);
        let mut session = ready_session(&backend);
        assert!(session.send_query("select 1"));
        let mut token = session.cancel_token().unwrap();
        assert!(token.cancel());

        assert!(session.consume_input());
        assert_eq!(session.next_result().unwrap().value(0, 0), Some("1"));

        assert!(session.send_query("sleep 5; select 2"));
        assert!(session.consume_input());
        assert!(!session.is_busy());
        assert_eq!(session.next_result().unwrap().sqlstate(), Some("57014"));
    }

    #[test]
    fn cancel_landing_on_idle_session_is_ignored() {
        let backend = MockBackend::new();
        backend.set_cancel_delay(2);
        let mut session = ready_session(&backend);
        assert!(session.send_query("select 1"));
        let mut token = session.cancel_token().unwrap();
        assert!(token.cancel());
        assert!(session.consume_input());
        assert_eq!(token.poll_done(), Some(true));

        let results = run(&mut session, "select 2");
        assert_eq!(results[0].value(0, 0), Some("2"));
    }

    #[test]
    fn lost_cancel_leaves_the_command_running() {
        let backend = MockBackend::new();
        backend.set_cancel_delivery_fails(true);
        let mut session = ready_session(&backend);
        assert!(session.send_query("sleep 3; select 'done'"));
        let mut token = session.cancel_token().unwrap();
        assert!(token.cancel());
        assert_eq!(token.poll_done(), Some(false));

        while session.is_busy() {
            assert!(session.consume_input());
        }
        assert_eq!(session.next_result().unwrap().sqlstate(), None);
        assert_eq!(session.next_result().unwrap().value(0, 0), Some("done"));
    }

    #[test]
    fn dropped_connections_go_bad() {
        let backend = MockBackend::new();
        let mut session = ready_session(&backend);
        backend.drop_connections();
        assert_eq!(session.status(), ConnStatus::Bad);
        assert_eq!(session.error_message(), SERVER_CLOSED);
        drop(session);
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn unknown_statement_is_a_syntax_error() {
        let backend = MockBackend::new();
        let mut session = ready_session(&backend);
        let results = run(&mut session, "blah");
        assert_eq!(results[0].sqlstate(), Some("42601"));
        assert_eq!(
            results[0].error_message(),
            "ERROR:  syntax error at or near \"blah\"\n"
        );
    }
}
