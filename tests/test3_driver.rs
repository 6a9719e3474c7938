use std::time::Duration;

use pgpoll::prelude::*;
use pgpoll::test_utils::mock::MockBackend;
use pgpoll::test_utils::wait_ready;

const BUDGET: usize = 200;

fn driver(backend: &MockBackend, size: u16) -> Driver<MockBackend> {
    Driver::with_backend(backend.clone(), &DriverConfig::new("host=mock", size)).unwrap()
}

#[test]
fn test3_capacity_one_round_trip() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 1);

    let h = driver.create().expect("first create succeeds");
    assert!(driver.create().is_none());

    driver.query(&h, "select 1")?;
    assert!(wait_ready(&mut driver, &h, BUDGET, Duration::ZERO));
    assert_eq!(driver.result(&h)?, Some("1"));
    assert_eq!(driver.result_len(&h)?, 1);
    assert!(!driver.is_error(&h)?);

    driver.free(h)?;
    assert!(driver.create().is_some());
    Ok(())
}

#[test]
fn test3_exhaustion_until_free() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 4);
    let mut held: Vec<ConnHandle> = (0..4).map(|_| driver.create().unwrap()).collect();
    assert!(driver.create().is_none());
    assert_eq!(driver.stats().in_use, 4);

    let freed = held.pop().unwrap();
    let freed_index = freed.index();
    driver.free(freed)?;
    let again = driver.create().unwrap();
    assert_eq!(again.index(), freed_index);
    assert!(driver.create().is_none());
    Ok(())
}

#[test]
fn test3_freed_mid_query_handle_is_clean_for_the_next_holder() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 1);

    let h = driver.create().unwrap();
    driver.query(&h, "set leaked 1; sleep 30")?;
    driver.poll(&h)?;
    assert_eq!(driver.state(&h)?, ConnState::Query);
    driver.free(h)?;

    let h = driver.create().unwrap();
    driver.query(&h, "get leaked")?;
    assert!(wait_ready(&mut driver, &h, BUDGET, Duration::ZERO));
    assert!(driver.is_null(&h)?);
    assert_eq!(driver.result(&h)?, Some(""));
    assert_eq!(backend.value("leaked"), None);
    Ok(())
}

#[test]
fn test3_queries_are_multiplexed_over_the_pool() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 3);

    let slow = driver.create().unwrap();
    let fast = driver.create().unwrap();
    driver.query(&slow, "sleep 10; select 'slow'")?;
    driver.query(&fast, "select 'fast'")?;

    let mut fast_done_first = false;
    for _ in 0..BUDGET {
        let slow_ready = driver.poll(&slow)?.is_ready();
        let fast_ready = driver.poll(&fast)?.is_ready();
        if fast_ready && !slow_ready {
            fast_done_first = true;
        }
        if slow_ready && fast_ready {
            break;
        }
    }

    assert!(fast_done_first);
    assert_eq!(driver.result(&slow)?, Some("slow"));
    assert_eq!(driver.result(&fast)?, Some("fast"));
    Ok(())
}

#[test]
fn test3_lost_sessions_recover_through_the_facade() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 2);
    let h = driver.create().unwrap();

    backend.drop_connections();
    driver.query(&h, "select 'back'")?;
    assert!(wait_ready(&mut driver, &h, BUDGET, Duration::ZERO));
    assert_eq!(driver.result(&h)?, Some("back"));
    assert!(!driver.is_error(&h)?);
    Ok(())
}

#[test]
fn test3_connection_error_is_visible_while_reconnecting() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut driver = driver(&backend, 1);
    let h = driver.create().unwrap();

    backend.drop_connections();
    backend.fail_next_handshakes(1000);
    driver.query(&h, "select 1")?;
    assert!(!wait_ready(&mut driver, &h, 20, Duration::ZERO));

    assert!(driver.is_error(&h)?);
    let text = driver.result(&h)?.unwrap();
    assert!(!text.as_bytes().get(5).is_some_and(|b| *b == b'_'));
    assert_eq!(driver.result_len(&h)?, text.len());

    // the host bounds retries by giving up on the handle
    driver.free(h)?;
    assert_eq!(driver.stats().idle, 1);
    Ok(())
}

#[test]
fn test3_json_config_drives_init() -> Result<(), PgPollError> {
    let config = DriverConfig::from_json(
        r#"{"conninfo": "host=mock", "pool_size": 2, "warmup": "non-blocking"}"#,
    )?;
    let backend = MockBackend::new();
    let driver = Driver::with_backend(backend.clone(), &config)?;
    assert_eq!(driver.stats().capacity, 2);
    assert_eq!(backend.connects(), 2);
    driver.shutdown();
    assert_eq!(backend.live_sessions(), 0);
    Ok(())
}

#[test]
fn test3_free_on_the_wrong_driver_keeps_the_slot() -> Result<(), PgPollError> {
    let backend = MockBackend::new();
    let mut one = driver(&backend, 1);
    let mut two = driver(&backend, 1);

    let h = one.create().expect("slot available");
    let err = two.free(h).unwrap_err();
    assert!(matches!(err, PgPollError::UnreleasedHandle(_)));
    assert_eq!(two.stats().idle, 1);

    let h = err.into_handle().expect("handle is handed back");
    one.free(h)?;
    assert_eq!(one.stats().in_use, 0);
    assert!(one.create().is_some());
    Ok(())
}

#[test]
fn test3_mock_backend_is_not_in_default_builds() {
    let manifest = include_str!("../Cargo.toml");
    let features: Vec<&str> = manifest
        .lines()
        .skip_while(|line| line.trim() != "[features]")
        .skip(1)
        .take_while(|line| !line.starts_with('['))
        .collect();
    assert!(features.contains(&"default = []"));
    assert!(features.contains(&"test-utils-mock = []"));
}
