use futures::StreamExt;
use rivulet::{transform, transform_stream, ErrorMode, ParallelConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error")
    }
}

#[tokio::test]
async fn ordered_output_matches_source_order_despite_latency() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(3)
        .ordered_output(true)
        .build();

    // item 1 sleeps longest, item 3 shortest; completion order is 3, 2, 1
    let results = transform(
        vec![1i32, 2, 3],
        |x: i32, _| async move {
            tokio::time::sleep(Duration::from_millis((4 - x as u64) * 50)).await;
            Ok::<_, TestError>(x)
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, vec![1, 2, 3]);
}

#[tokio::test]
async fn ordered_output_with_larger_input() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(8)
        .ordered_output(true)
        .build();

    let input: Vec<u64> = (0..50).collect();
    let results = transform(
        input.clone(),
        |x: u64, _| async move {
            // pseudo-random latency to shuffle completion order
            tokio::time::sleep(Duration::from_millis((x * 7) % 13)).await;
            Ok::<_, TestError>(x)
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, input);
}

#[tokio::test]
async fn suppressed_failures_leave_holes_not_stalls() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(4)
        .ordered_output(true)
        .error_mode(ErrorMode::BestEffort)
        .build();

    let results = transform(
        (0..10).collect::<Vec<i32>>(),
        |x: i32, _| async move {
            if x % 2 == 0 {
                Err(TestError)
            } else {
                Ok(x)
            }
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, vec![1, 3, 5, 7, 9]);
}

#[tokio::test]
async fn ordered_failure_at_index_zero_does_not_block_the_rest() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(2)
        .ordered_output(true)
        .error_mode(ErrorMode::BestEffort)
        .build();

    let results = transform(
        vec![0i32, 1, 2],
        |x: i32, _| async move {
            if x == 0 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Err(TestError)
            } else {
                Ok(x)
            }
        },
        config,
    )
    .await
    .unwrap();

    assert_eq!(results, vec![1, 2]);
}

#[tokio::test]
async fn ordered_stream_yields_incrementally() {
    let config = ParallelConfig::<TestError>::builder()
        .max_parallelism(2)
        .ordered_output(true)
        .build();

    let mut stream = transform_stream(
        vec![10i32, 20, 30, 40],
        |x: i32, _| async move { Ok::<_, TestError>(x) },
        config,
    )
    .unwrap();

    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item.unwrap());
    }
    assert_eq!(seen, vec![10, 20, 30, 40]);
}
