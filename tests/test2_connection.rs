use pgpoll::prelude::*;
use pgpoll::test_utils::mock::MockBackend;
use pgpoll::test_utils::poll_connection;

const BUDGET: usize = 200;

fn connected(backend: &MockBackend) -> Connection<MockBackend> {
    let mut conn = Connection::new(backend.clone());
    conn.connect("host=mock", ConnectMode::Blocking).unwrap();
    conn
}

fn run(conn: &mut Connection<MockBackend>, text: &str) {
    conn.do_query(text);
    assert!(
        poll_connection(conn, BUDGET).is_some(),
        "query {text:?} never became ready"
    );
}

#[test]
fn test2_single_cell_result() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "select 'hello world'");
    assert_eq!(conn.state(), ConnState::Result);
    assert!(conn.has_result());
    assert!(!conn.result_is_error());
    assert!(!conn.result_is_null());
    assert_eq!(conn.result(), "hello world");
}

#[test]
fn test2_last_statement_wins() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "select 1; set x 9; select 3");
    assert_eq!(conn.result(), "3");

    run(&mut conn, "select 3");
    assert_eq!(conn.result(), "3");

    // a trailing command without rows leaves nothing behind
    run(&mut conn, "select 1; set y 2");
    assert!(!conn.has_result());
    assert!(!conn.result_is_error());
    assert_eq!(conn.result(), "");
}

#[test]
fn test2_null_cell() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "select null");
    assert!(conn.has_result());
    assert!(conn.result_is_null());
    assert_eq!(conn.result(), "");
}

#[test]
fn test2_zero_rows_is_no_result() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "empty");
    assert_eq!(conn.state(), ConnState::Result);
    assert!(!conn.has_result());
    assert!(!conn.result_is_error());
}

#[test]
fn test2_server_error_is_prefixed_with_sqlstate() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "error 42883");
    assert!(conn.result_is_error());
    assert!(conn.has_result());
    let text = conn.result();
    assert_eq!(text.as_bytes()[5], b'_');
    assert!(text.starts_with("42883_"));

    // the connection stays usable after a server error
    run(&mut conn, "select 2");
    assert!(!conn.result_is_error());
    assert_eq!(conn.result(), "2");
}

#[test]
fn test2_overlapping_query_cancels_the_running_one() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);

    conn.do_query("set a 1; sleep 50");
    conn.poll();
    assert_eq!(conn.state(), ConnState::Query);

    conn.do_query("get a");
    assert_eq!(conn.state(), ConnState::Cancel);
    assert_eq!(backend.cancel_requests(), 1);
    assert!(poll_connection(&mut conn, BUDGET).is_some());

    assert_eq!(conn.state(), ConnState::Result);
    assert!(conn.has_result());
    assert!(conn.result_is_null(), "cancelled set must not be visible");
    assert_eq!(backend.value("a"), None);
}

#[test]
fn test2_failed_cancel_falls_back_to_a_new_session() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    conn.do_query("set a 1; sleep 50");
    conn.poll();

    backend.set_cancel_accepts(false);
    conn.do_query("select 5");
    assert_eq!(conn.state(), ConnState::Connecting);
    assert_eq!(backend.live_sessions(), 1);

    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert_eq!(conn.result(), "5");
    assert_eq!(backend.value("a"), None);
}

#[test]
fn test2_late_cancel_does_not_hit_the_replacement_query() {
    let backend = MockBackend::new();
    backend.set_cancel_delay(3);
    let mut conn = connected(&backend);

    conn.do_query("set a 1; sleep 1");
    conn.poll();
    conn.poll();
    assert_eq!(conn.state(), ConnState::Query);

    // the first command completes on the server while its cancel travels
    conn.do_query("sleep 5; select 'second'");
    assert_eq!(conn.poll(), PollStatus::Pending);
    assert_eq!(conn.state(), ConnState::Cancel);

    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert!(!conn.result_is_error(), "replacement got {:?}", conn.result());
    assert_eq!(conn.result(), "second");
    assert_eq!(backend.value("a").as_deref(), Some("1"));
}

#[test]
fn test2_freed_connection_waits_for_cancel_delivery() {
    let backend = MockBackend::new();
    backend.set_cancel_delay(4);
    let mut conn = connected(&backend);
    conn.do_query("sleep 1");
    conn.poll();

    conn.abort();
    conn.do_query("sleep 3; select 'next holder'");
    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert!(!conn.result_is_error(), "next holder got {:?}", conn.result());
    assert_eq!(conn.result(), "next holder");
}

#[test]
fn test2_undelivered_cancel_forces_reconnect() {
    let backend = MockBackend::new();
    backend.set_cancel_delivery_fails(true);
    let mut conn = connected(&backend);
    conn.do_query("set a 1; sleep 50");
    conn.poll();

    conn.do_query("select 5");
    assert_eq!(conn.state(), ConnState::Cancel);
    conn.poll();
    assert_eq!(conn.state(), ConnState::Connecting);
    assert_eq!(conn.pending_query(), Some("select 5"));

    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert_eq!(conn.result(), "5");
    assert_eq!(backend.value("a"), None);
    assert_eq!(backend.live_sessions(), 1);
}

#[test]
fn test2_reconnects_after_disconnect() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    conn.disconnect();
    assert_eq!(conn.state(), ConnState::Start);

    run(&mut conn, "select 6");
    assert_eq!(conn.result(), "6");
    assert!(!conn.result_is_error());
    assert_eq!(backend.connects(), 1);
}

#[test]
fn test2_reconnects_after_server_drops_idle_session() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    run(&mut conn, "select 1");

    backend.drop_connections();
    run(&mut conn, "select 7");
    assert_eq!(conn.result(), "7");
    assert!(!conn.result_is_error());
    assert_eq!(backend.live_sessions(), 1);
}

#[test]
fn test2_query_lost_mid_flight_is_resent() {
    let backend = MockBackend::new();
    backend.set_query_ticks(5);
    let mut conn = connected(&backend);

    conn.do_query("set k v; get k");
    conn.poll();
    assert_eq!(conn.state(), ConnState::Query);

    backend.drop_connections();
    conn.poll();
    assert_eq!(conn.state(), ConnState::Connecting);
    assert!(conn.result_is_error());
    assert_eq!(conn.result(), "server closed the connection unexpectedly\n");

    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert_eq!(conn.result(), "v");
    assert_eq!(backend.committed(), vec!["set k v; get k".to_string()]);
}

#[test]
fn test2_handshake_failures_retry_until_success() {
    let backend = MockBackend::new();
    backend.fail_next_handshakes(2);
    let mut conn = Connection::new(backend.clone());
    conn.connect("host=mock", ConnectMode::NonBlocking).unwrap();
    conn.do_query("select 8");

    assert_eq!(conn.poll(), PollStatus::Pending);
    assert!(conn.result_is_error());
    assert_eq!(
        conn.result(),
        "could not connect to server: Connection refused\n"
    );
    assert_eq!(conn.state(), ConnState::Connecting);

    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert_eq!(conn.result(), "8");
    assert_eq!(backend.connects(), 3);
}

#[test]
fn test2_abort_leaves_no_residue() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    conn.do_query("set b 1; sleep 20; select 'stale'");
    conn.poll();

    conn.abort();
    assert_eq!(conn.pending_query(), None);
    assert!(poll_connection(&mut conn, BUDGET).is_some());
    assert_eq!(conn.state(), ConnState::Connected);
    assert!(!conn.has_result());
    assert!(!conn.result_is_error());
    assert_eq!(backend.value("b"), None);

    run(&mut conn, "select 9");
    assert_eq!(conn.result(), "9");
}

#[test]
fn test2_abort_when_idle_is_harmless() {
    let backend = MockBackend::new();
    let mut conn = connected(&backend);
    conn.abort();
    assert_eq!(conn.state(), ConnState::Connected);
    assert_eq!(conn.poll(), PollStatus::Ready);
}
