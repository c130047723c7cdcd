//! Tests for the retry engine

use chug_core::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(8),
        jitter: false,
    }
}

#[test]
fn test_loader_defaults() {
    let policy = RetryPolicy::insert_defaults();
    assert_eq!(policy.max_attempts, 4);
    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.max_delay, Duration::from_secs(2));
    assert!(policy.jitter);
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();

    let out = retry(&fast_policy(4), &cancel, move || {
        let c = c.clone();
        async move {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::insert("evt", "transient"))
            } else {
                Ok(7)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(out, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exhaustion_total_elapsed_covers_backoffs() {
    let cancel = CancellationToken::new();
    let policy = RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter: false,
    };

    // backoffs of 20ms, 40ms, 80ms; the fourth failure exhausts without sleeping
    let expected_floor = Duration::from_millis(20 + 40 + 80);

    let start = Instant::now();
    let result: Result<()> = retry(&policy, &cancel, || async {
        Err(Error::insert("t", "down"))
    })
    .await;
    let elapsed = start.elapsed();

    let err = result.unwrap_err();
    assert!(err.to_string().starts_with("max retry attempts reached"));
    assert!(
        elapsed >= expected_floor,
        "elapsed {elapsed:?} is below the backoff sum {expected_floor:?}"
    );
}

#[tokio::test]
async fn test_exhaustion_preserves_attempt_count() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();

    let result: Result<()> = retry(&fast_policy(3), &cancel, move || {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err(Error::insert("t", "down"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancellation_during_backoff_is_prompt() {
    let cancel = CancellationToken::new();
    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(60),
        jitter: false,
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result: Result<()> = retry(&policy, &cancel, || async {
        Err(Error::insert("t", "down"))
    })
    .await;

    assert!(result.unwrap_err().is_cancelled());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_no_retry_after_success() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();

    let _: i32 = retry(&fast_policy(4), &cancel, move || {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
