//! Batch executor properties over randomized workloads.

use dbkit::db::{BatchExecutor, BatchOptions, BatchProgress};
use dbkit::error::DbError;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn options(batch_size: usize, continue_on_error: bool) -> BatchOptions {
    BatchOptions {
        batch_size,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        continue_on_error,
    }
}

#[tokio::test]
async fn test_counts_add_up_for_random_workloads() {
    let mut rng = rand::thread_rng();

    for _ in 0..50 {
        let item_count: usize = rng.gen_range(0..300);
        let batch_size = rng.gen_range(1..40);
        let total_batches = item_count.div_ceil(batch_size);
        let failing: HashSet<usize> = (0..total_batches).filter(|_| rng.gen_bool(0.3)).collect();

        let executor = BatchExecutor::new(options(batch_size, true));
        let items: Vec<usize> = (0..item_count).collect();
        let result = executor
            .execute(
                items,
                |index, _batch| {
                    let fail = failing.contains(&index);
                    async move {
                        if fail {
                            Err(DbError::invalid_input("rejected"))
                        } else {
                            Ok(())
                        }
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.total_items, item_count);
        assert_eq!(result.total_batches, total_batches);
        assert_eq!(result.processed_items, item_count);
        assert_eq!(
            result.successful_items + result.failed_items,
            result.total_items
        );
        assert_eq!(result.failures.len(), failing.len());
        assert_eq!(
            result.partial_success,
            result.successful_items > 0 && result.failed_items > 0
        );
    }
}

#[tokio::test]
async fn test_items_keep_their_order_across_batches() {
    let mut rng = rand::thread_rng();
    let item_count = rng.gen_range(1..500);
    let batch_size = rng.gen_range(1..64);
    let seen = Mutex::new(Vec::new());

    let executor = BatchExecutor::new(options(batch_size, false));
    let items: Vec<usize> = (0..item_count).collect();
    let result = executor
        .execute(
            items,
            |_, batch| {
                assert!(batch.len() <= batch_size);
                seen.lock().unwrap().extend(batch);
                async { Ok(()) }
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.successful_items, item_count);
    assert_eq!(seen.into_inner().unwrap(), (0..item_count).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_progress_is_cumulative() {
    let reports = Mutex::new(Vec::<BatchProgress>::new());
    let record = |p: &BatchProgress| reports.lock().unwrap().push(p.clone());

    let executor = BatchExecutor::new(options(3, true));
    executor
        .execute(
            (0..10).collect::<Vec<u8>>(),
            |index, _| async move {
                if index == 1 {
                    Err(DbError::invalid_input("bad batch"))
                } else {
                    Ok(())
                }
            },
            Some(&record),
        )
        .await
        .unwrap();

    let reports = reports.into_inner().unwrap();
    assert_eq!(reports.len(), 4);
    let processed: Vec<usize> = reports.iter().map(|p| p.processed_items).collect();
    assert_eq!(processed, vec![3, 6, 9, 10]);
    let last = reports.last().unwrap();
    assert_eq!(last.successful_items, 7);
    assert_eq!(last.failed_items, 3);
    assert!(reports.iter().all(|p| p.total_batches == 4));
}

#[test]
fn test_retry_recovers_without_tokio_macro() {
    let calls = AtomicUsize::new(0);
    let executor = BatchExecutor::new(BatchOptions {
        batch_size: 5,
        max_retries: 2,
        retry_delay: Duration::from_millis(1),
        continue_on_error: false,
    });

    let result = tokio_test::block_on(executor.execute(
        vec![1, 2, 3, 4, 5],
        |_, _| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(DbError::invalid_input("flaky"))
                } else {
                    Ok(())
                }
            }
        },
        None,
    ))
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.successful_items, 5);
    assert!(result.failures.is_empty());
}
