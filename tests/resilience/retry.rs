use rivulet::{transform, BackoffStrategy, ItemError, ParallelConfig, PipelineError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum FetchError {
    Transient,
    Fatal,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transient => write!(f, "transient failure"),
            FetchError::Fatal => write!(f, "fatal failure"),
        }
    }
}

#[tokio::test]
async fn fails_twice_then_succeeds() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let retries = Arc::new(Mutex::new(Vec::new()));
    let invocation_probe = Arc::clone(&invocations);
    let retry_probe = Arc::clone(&retries);

    let config = ParallelConfig::<FetchError>::builder()
        .max_retries(3)
        .base_delay(Duration::from_millis(10))
        .backoff(BackoffStrategy::Exponential)
        .on_retry(move |_, attempt, _| {
            retry_probe.lock().unwrap().push(attempt);
        })
        .build();

    let results = transform(
        vec![1i32],
        move |_: i32, _| {
            let probe = Arc::clone(&invocation_probe);
            async move {
                if probe.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Transient)
                } else {
                    Ok(42)
                }
            }
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, vec![42]);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(retries.lock().unwrap().clone(), vec![1, 2]);
}

#[tokio::test]
async fn invocations_bounded_by_max_retries_plus_one() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invocations);

    let config = ParallelConfig::<FetchError>::builder()
        .max_retries(4)
        .base_delay(Duration::from_millis(1))
        .build();

    let result = transform(
        vec![1i32],
        move |_: i32, _| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(FetchError::Transient)
            }
        },
        config,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn non_transient_errors_are_not_retried() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invocations);

    let config = ParallelConfig::<FetchError>::builder()
        .max_retries(5)
        .base_delay(Duration::from_millis(1))
        .retry_on(|error| matches!(error, ItemError::Worker(FetchError::Transient)))
        .build();

    let result = transform(
        vec![1i32],
        move |_: i32, _| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(FetchError::Fatal)
            }
        },
        config,
    )
    .await;

    match result {
        Err(PipelineError::Item {
            index: 0,
            error: ItemError::Worker(FetchError::Fatal),
        }) => {}
        other => panic!("expected fatal worker error, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_max_retries_means_single_attempt() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invocations);

    let config = ParallelConfig::<FetchError>::builder().build();

    let result = transform(
        vec![1i32],
        move |_: i32, _| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(FetchError::Transient)
            }
        },
        config,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_sleeps_respect_the_backoff_schedule() {
    use std::time::Instant;

    let config = ParallelConfig::<FetchError>::builder()
        .max_retries(3)
        .base_delay(Duration::from_millis(20))
        .backoff(BackoffStrategy::Exponential)
        .build();

    let started = Instant::now();
    let result = transform(
        vec![1i32],
        |_: i32, _| async move { Err::<i32, _>(FetchError::Transient) },
        config,
    )
    .await;

    assert!(result.is_err());
    // 20 + 40 + 80 = 140ms of backoff at minimum
    assert!(started.elapsed() >= Duration::from_millis(140));
}

#[tokio::test]
async fn each_item_retries_independently() {
    let config = ParallelConfig::<FetchError>::builder()
        .max_parallelism(4)
        .max_retries(1)
        .base_delay(Duration::from_millis(1))
        .error_mode(rivulet::ErrorMode::BestEffort)
        .build();

    let attempts = Arc::new(Mutex::new(std::collections::HashMap::<i32, usize>::new()));
    let probe = Arc::clone(&attempts);

    let results = transform(
        vec![1i32, 2, 3],
        move |x: i32, _| {
            let probe = Arc::clone(&probe);
            async move {
                let mut map = probe.lock().unwrap();
                let attempt = map.entry(x).or_insert(0);
                *attempt += 1;
                // every item fails its first attempt
                if *attempt == 1 {
                    Err(FetchError::Transient)
                } else {
                    Ok(x)
                }
            }
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    let map = attempts.lock().unwrap();
    assert!(map.values().all(|&n| n == 2));
}
