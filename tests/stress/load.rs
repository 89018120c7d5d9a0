use rivulet::{transform, ErrorMode, ParallelConfig, PipelineCounters};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_items_with_mixed_latencies() {
    let counters = Arc::new(PipelineCounters::new());

    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(32)
        .channel_capacity(64)
        .counters(Arc::clone(&counters))
        .build();

    let n: u32 = 1000;
    let results = transform(
        (0..n).collect::<Vec<u32>>(),
        |x: u32, _| async move {
            tokio::time::sleep(Duration::from_micros((x % 17) as u64 * 100)).await;
            Ok::<_, TestError>(x)
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results.len(), n as usize);
    let unique: BTreeSet<u32> = results.into_iter().collect();
    assert_eq!(unique.len(), n as usize);

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.items_started, n as u64);
    assert_eq!(snapshot.items_completed, n as u64);
    assert_eq!(snapshot.total_failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_stays_correct_under_load() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(16)
        .channel_capacity(8)
        .ordered_output(true)
        .build();

    let input: Vec<u32> = (0..500).collect();
    let results = transform(
        input.clone(),
        |x: u32, _| async move {
            tokio::time::sleep(Duration::from_micros((499 - x) as u64 % 23 * 50)).await;
            Ok::<_, TestError>(x)
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, input);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_churn_converges() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&attempts);

    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(16)
        .max_retries(2)
        .base_delay(Duration::from_millis(1))
        .error_mode(ErrorMode::BestEffort)
        .build();

    // roughly a third of first attempts fail; retries always succeed
    let flaky = Arc::new(std::sync::Mutex::new(std::collections::HashSet::<u32>::new()));
    let results = transform(
        (0..300).collect::<Vec<u32>>(),
        move |x: u32, _| {
            let probe = Arc::clone(&probe);
            let flaky = Arc::clone(&flaky);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                let first_attempt = flaky.lock().unwrap().insert(x);
                if first_attempt && x % 3 == 0 {
                    Err(TestError)
                } else {
                    Ok(x)
                }
            }
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 300);
    assert_eq!(attempts.load(Ordering::SeqCst), 300 + 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_leaves_no_stragglers() {
    let active = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&active);

    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(24)
        .build();

    transform(
        (0..400).collect::<Vec<u32>>(),
        move |x: u32, _| {
            let active = Arc::clone(&probe);
            async move {
                active.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TestError>(x)
            }
        },
        config,
    )
    .await
    .unwrap();

    // the engine joined every worker before returning
    assert_eq!(active.load(Ordering::SeqCst), 0);
}
