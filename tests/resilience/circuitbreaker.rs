use rivulet::{
    transform, CircuitBreakerSettings, CircuitState, ErrorMode, ItemError, ParallelConfig,
    PipelineError, RateLimit,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct DownstreamError;

impl std::fmt::Display for DownstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "downstream unavailable")
    }
}

#[tokio::test]
async fn breaker_opens_and_rejects_subsequent_items() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invocations);

    let config = ParallelConfig::<DownstreamError>::builder()
        .max_parallelism(1)
        .error_mode(ErrorMode::CollectAndContinue)
        .circuit_breaker(CircuitBreakerSettings::new(
            3,
            1,
            Duration::from_secs(60),
        ))
        .build();

    let result = transform(
        (1..=20).collect::<Vec<i32>>(),
        move |_: i32, _| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(DownstreamError)
            }
        },
        config,
    )
    .await;

    let aggregate = result.unwrap_err().into_aggregate().unwrap();
    assert_eq!(aggregate.len(), 20);

    let worker_errors = aggregate
        .errors()
        .iter()
        .filter(|(_, e)| e.is_worker())
        .count();
    let rejections = aggregate
        .errors()
        .iter()
        .filter(|(_, e)| e.is_circuit_open())
        .count();
    assert_eq!(worker_errors, 3);
    assert_eq!(rejections, 17);
    // rejected items never reached the worker
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn breaker_probes_after_the_open_timeout() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transition_probe = Arc::clone(&transitions);
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocation_probe = Arc::clone(&invocations);

    let config = ParallelConfig::<DownstreamError>::builder()
        .max_parallelism(1)
        .error_mode(ErrorMode::CollectAndContinue)
        // pace admissions so the run outlives the open timeout; without
        // this, rejections drain the source before any probe can happen
        .rate_limit(RateLimit::new(100.0, 1.0))
        .circuit_breaker(CircuitBreakerSettings::new(
            3,
            1,
            Duration::from_millis(50),
        ))
        .on_state_change(move |from, to| {
            transition_probe.lock().unwrap().push((from, to));
        })
        .build();

    let result = transform(
        (1..=20).collect::<Vec<i32>>(),
        move |x: i32, _| {
            let probe = Arc::clone(&invocation_probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                if x <= 3 {
                    Err(DownstreamError)
                } else {
                    Ok(x)
                }
            }
        },
        config,
    )
    .await;

    // three failures open the circuit; once virtual time passes the 50ms
    // open timeout a probe goes through, succeeds, and closes it again
    assert!(invocations.load(Ordering::SeqCst) > 3);
    let transitions = transitions.lock().unwrap().clone();
    assert!(transitions.contains(&(CircuitState::Closed, CircuitState::Open)));
    assert!(transitions.contains(&(CircuitState::Open, CircuitState::HalfOpen)));
    assert!(transitions.contains(&(CircuitState::HalfOpen, CircuitState::Closed)));

    // with the breaker recovered, later items succeed
    match result {
        Err(PipelineError::Aggregate(aggregate)) => {
            // exactly the three worker failures that tripped the circuit,
            // plus the rejections that landed inside the open window
            let worker_errors = aggregate
                .errors()
                .iter()
                .filter(|(_, e)| e.is_worker())
                .count();
            assert_eq!(worker_errors, 3);
            assert!(aggregate.errors().iter().any(|(_, e)| e.is_circuit_open()));
            assert!(aggregate.len() < 20);
        }
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

#[tokio::test]
async fn open_circuit_rejections_are_not_retried() {
    let retries = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&retries);

    let config = ParallelConfig::<DownstreamError>::builder()
        .max_parallelism(1)
        .max_retries(5)
        .base_delay(Duration::from_millis(1))
        .error_mode(ErrorMode::CollectAndContinue)
        .retry_on(|error| !error.is_worker())
        .circuit_breaker(CircuitBreakerSettings::new(
            1,
            1,
            Duration::from_secs(60),
        ))
        .on_retry(move |_, _, _| {
            probe.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let result = transform(
        vec![1i32, 2, 3],
        |_: i32, _| async move { Err::<i32, _>(DownstreamError) },
        config,
    )
    .await;

    let aggregate = result.unwrap_err().into_aggregate().unwrap();
    assert_eq!(aggregate.len(), 3);
    assert!(aggregate.errors()[1].1.is_circuit_open());
    assert!(aggregate.errors()[2].1.is_circuit_open());
    // neither worker errors (non-transient here) nor rejections retried
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_the_circuit() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&transitions);

    let config = ParallelConfig::<DownstreamError>::builder()
        .max_parallelism(1)
        .error_mode(ErrorMode::BestEffort)
        // keep admissions slow enough for the open timeout to elapse
        // mid-run
        .rate_limit(RateLimit::new(100.0, 1.0))
        .circuit_breaker(CircuitBreakerSettings::new(
            2,
            1,
            Duration::from_millis(30),
        ))
        .on_state_change(move |from, to| {
            probe.lock().unwrap().push((from, to));
        })
        .build();

    transform(
        (0..12).collect::<Vec<i32>>(),
        |_: i32, _| async move {
            tokio::time::sleep(Duration::from_millis(8)).await;
            Err::<i32, _>(DownstreamError)
        },
        config,
    )
    .await
    .unwrap();

    let transitions = transitions.lock().unwrap().clone();
    assert!(transitions.contains(&(CircuitState::Open, CircuitState::HalfOpen)));
    assert!(transitions.contains(&(CircuitState::HalfOpen, CircuitState::Open)));
}

#[tokio::test]
async fn item_failure_mode_reports_circuit_open() {
    let config = ParallelConfig::<DownstreamError>::builder()
        .max_parallelism(1)
        .circuit_breaker(CircuitBreakerSettings::new(
            1,
            1,
            Duration::from_secs(60),
        ))
        .on_error(|_, error| {
            // suppress the worker failure that opens the circuit, keep the
            // rejection
            error.is_worker()
        })
        .build();

    let result = transform(
        vec![1i32, 2],
        |_: i32, _| async move { Err::<i32, _>(DownstreamError) },
        config,
    )
    .await;

    match result {
        Err(PipelineError::Item {
            index: 1,
            error: ItemError::CircuitOpen,
        }) => {}
        other => panic!("expected circuit-open item failure, got {other:?}"),
    }
}
