//! Tests for retry policy module

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ============================================================================
// RetryPolicy Tests
// ============================================================================

#[test]
fn test_retry_policy_default_values() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.initial_delay, Duration::from_millis(100));
    assert_eq!(policy.max_delay, Duration::from_secs(5));
    assert_eq!(policy.backoff_multiplier, 2.0);
    assert!(policy.use_jitter);
    assert_eq!(policy.total_attempts(), 4);
}

#[test]
fn test_retry_policy_from_config() {
    let config = RetryConfig {
        max_attempts: 6,
        initial_delay_ms: 250,
        max_delay_ms: 1_000,
        backoff_multiplier: 3.0,
        use_jitter: false,
    };

    let policy = RetryPolicy::from_config(&config);

    assert_eq!(policy.max_attempts, 6);
    assert_eq!(policy.initial_delay, Duration::from_millis(250));
    assert_eq!(policy.max_delay, Duration::from_secs(1));
    assert!(!policy.use_jitter);
}

#[test]
fn test_calculate_delay_without_jitter() {
    let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(16), 2.0)
        .without_jitter();

    assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
    assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
    assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));

    // Capped at max_delay
    assert_eq!(policy.calculate_delay(5), Duration::from_secs(16));
    assert_eq!(policy.calculate_delay(60), Duration::from_secs(16));
}

#[test]
fn test_calculate_delay_with_jitter_stays_in_range() {
    let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(16), 2.0);

    for _ in 0..20 {
        let secs = policy.calculate_delay(0).as_secs_f64();
        assert!((0.75..=1.25).contains(&secs), "Delay {} out of range", secs);
    }
}

#[test]
fn test_jitter_percent_is_clamped() {
    let policy = RetryPolicy::default().with_jitter_percent(4.0);
    assert_eq!(policy.jitter_percent, 1.0);
}

#[test]
fn test_should_retry_respects_max_attempts() {
    let policy = RetryPolicy::default();

    assert!(policy.should_retry(0));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
}

// ============================================================================
// run_with_retry Tests
// ============================================================================

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
    )
    .without_jitter()
}

#[tokio::test(start_paused = true)]
async fn test_run_with_retry_recovers_from_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));

    let result = run_with_retry(&fast_policy(3), "send", None, || {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Io("connection reset".to_string()))
            } else {
                Ok(42)
            }
        }
    })
    .await;

    assert_eq!(result, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_retry_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = run_with_retry(&fast_policy(2), "send", None, || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unreachable("down".to_string()))
        }
    })
    .await;

    assert_eq!(result, Err(TransportError::Unreachable("down".to_string())));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_retry_does_not_retry_permanent_errors() {
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = run_with_retry(&fast_policy(5), "settle", None, || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::LockLost("gone".to_string()))
        }
    })
    .await;

    assert!(matches!(result, Err(TransportError::LockLost(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_retry_stops_before_deadline() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(1), 1.0)
        .without_jitter();
    let deadline = Instant::now() + Duration::from_millis(2500);

    let result: Result<(), _> = run_with_retry(&policy, "settle", Some(deadline), || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Io("flaky".to_string()))
        }
    })
    .await;

    assert!(result.is_err());
    // Attempts at t=0s and t=1s; a third at t=2s would still fit, a fourth would not
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(Instant::now() < deadline);
}
