//! Tests for lock tracking.

use super::*;
use crate::message::EntityName;
use std::sync::Arc;
use std::time::Duration;

fn record(message_id: &MessageId, lock_duration: Duration) -> LockRecord {
    let now = Instant::now();
    LockRecord {
        entity: EntityRef::Queue(EntityName::new("orders").unwrap()),
        message_id: message_id.clone(),
        acquired_at: now,
        deadline: now + lock_duration,
    }
}

mod lock_state {
    use super::*;

    #[test]
    fn test_locked_settles_once() {
        let now = Instant::now();
        let state = LockState::Locked {
            deadline: now + Duration::from_secs(30),
        };

        assert_eq!(
            state.settle(SettleOutcome::Complete, now),
            Ok(LockState::Completed)
        );
        assert_eq!(
            state.settle(SettleOutcome::Abandon, now),
            Ok(LockState::Abandoned)
        );
        assert_eq!(
            LockState::Completed.settle(SettleOutcome::Abandon, now),
            Err(LockState::Completed)
        );
    }

    #[test]
    fn test_deadline_is_exclusive() {
        let now = Instant::now();
        let state = LockState::Locked { deadline: now };

        assert_eq!(state.at(now), LockState::Expired);
        assert_eq!(
            state.settle(SettleOutcome::Complete, now),
            Err(LockState::Expired)
        );
    }

    #[test]
    fn test_terminal_states() {
        let now = Instant::now();
        assert!(!LockState::Locked { deadline: now }.is_terminal());
        assert!(LockState::Completed.is_terminal());
        assert!(LockState::Abandoned.is_terminal());
        assert!(LockState::Expired.is_terminal());
    }
}

mod tracker {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_claim_succeeds_only_once() {
        let tracker = LockTracker::new();
        let token = LockToken::new();
        tracker.track(token.clone(), record(&MessageId::new(), Duration::from_secs(30)));

        assert!(tracker.claim(&token, Instant::now()).is_some());
        assert!(tracker.claim(&token, Instant::now()).is_none());
        assert_eq!(tracker.held(Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_fails_after_deadline() {
        let tracker = LockTracker::new();
        let token = LockToken::new();
        tracker.track(token.clone(), record(&MessageId::new(), Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(tracker.claim(&token, Instant::now()).is_none());
    }

    #[test]
    fn test_unknown_token_cannot_be_claimed() {
        let tracker = LockTracker::new();
        assert!(tracker.claim(&LockToken::new(), Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_locks_sharing_a_message_id_are_independent() {
        let tracker = LockTracker::new();
        let message_id: MessageId = "dup".parse().unwrap();
        let first = LockToken::new();
        let second = LockToken::new();

        tracker.track(first.clone(), record(&message_id, Duration::from_secs(30)));
        tracker.track(second.clone(), record(&message_id, Duration::from_secs(30)));

        assert_eq!(tracker.held(Instant::now()), 2);
        assert!(tracker.claim(&first, Instant::now()).is_some());
        assert!(tracker.claim(&second, Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_lock_can_be_returned() {
        let tracker = LockTracker::new();
        let token = LockToken::new();
        tracker.track(token.clone(), record(&MessageId::new(), Duration::from_secs(30)));

        let record = tracker.claim(&token, Instant::now()).unwrap();
        tracker.track(token.clone(), record);

        assert_eq!(tracker.held(Instant::now()), 1);
        assert!(tracker.claim(&token, Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_live_locks() {
        let tracker = LockTracker::new();
        let short = LockToken::new();
        let long = LockToken::new();
        tracker.track(short.clone(), record(&MessageId::new(), Duration::from_secs(1)));
        tracker.track(long.clone(), record(&MessageId::new(), Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(tracker.held(Instant::now()), 1);
        assert_eq!(tracker.purge_expired(Instant::now()), 1);
        assert!(tracker.claim(&long, Instant::now()).is_some());
    }

    #[test]
    fn test_clear_forgets_everything() {
        let tracker = LockTracker::new();
        let token = LockToken::new();
        tracker.track(token.clone(), record(&MessageId::new(), Duration::from_secs(30)));

        tracker.clear();

        assert_eq!(tracker.held(Instant::now()), 0);
        assert!(tracker.claim(&token, Instant::now()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let tracker = Arc::new(LockTracker::new());
        let token = LockToken::new();
        tracker.track(token.clone(), record(&MessageId::new(), Duration::from_secs(30)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let token = token.clone();
                tokio::spawn(async move { tracker.claim(&token, Instant::now()).is_some() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
