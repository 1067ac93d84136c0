//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(ClientError::Timeout {
        operation: "send".to_string(),
        duration: Duration::from_secs(30),
    }
    .is_transient());

    assert!(ClientError::ConnectionFailed {
        reason: ConnectionFailure::Unreachable,
        message: "network error".to_string(),
    }
    .is_transient());

    assert!(!ClientError::ConnectionFailed {
        reason: ConnectionFailure::Unauthorized,
        message: "bad key".to_string(),
    }
    .is_transient());

    assert!(!ClientError::LockLost {
        lock_token: "token".to_string(),
    }
    .is_transient());

    assert!(!ClientError::BatchTooLarge {
        size: 1000,
        max_size: 500,
        rejected_indices: vec![1],
    }
    .is_transient());

    assert!(!ClientError::closed("connection").is_transient());

    assert!(ClientError::SettleFailed {
        lock_token: "token".to_string(),
        message: "connection reset".to_string(),
    }
    .is_transient());
}

#[test]
fn test_retry_suggestions() {
    let timeout = ClientError::Timeout {
        operation: "send".to_string(),
        duration: Duration::from_secs(30),
    };
    assert_eq!(timeout.retry_after(), Some(Duration::from_secs(1)));

    let lock_lost = ClientError::LockLost {
        lock_token: "token".to_string(),
    };
    assert_eq!(lock_lost.retry_after(), None);
}

#[test]
fn test_batch_too_large_names_offending_indices() {
    let err = ClientError::BatchTooLarge {
        size: 2048,
        max_size: 1024,
        rejected_indices: vec![3, 4],
    };

    let text = err.to_string();
    assert!(text.contains("[3, 4]"), "unexpected message: {}", text);
    assert!(text.contains("1024"));
}

#[test]
fn test_closed_error_names_resource() {
    let err = ClientError::closed("sender for 'orders'");
    assert_eq!(err.to_string(), "Operation on closed sender for 'orders'");
}

#[test]
fn test_config_error_conversion() {
    let err: ConfigurationError = config::ConfigError::NotFound("timeout".to_string()).into();
    assert!(matches!(err, ConfigurationError::Parsing { .. }));
}
