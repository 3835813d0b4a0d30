/// Batch put/delete/get behaviour against the in-memory store
///
/// Covers chunking, per-call metadata, validation rejection, retry
/// exhaustion, concurrency caps and cancellation.
use dynamo_batch::{CapacityMode, Operation};

mod helpers;
use helpers::*;

#[test_log::test(tokio::test)]
async fn test_put_many_items_one_metadata_entry_per_call() {
    let store = store();
    let batcher = batcher(&store);
    let input = items(1000);

    let output = batcher
        .put_items(input.clone(), &BatchOptions::default().capacity(CapacityMode::Total))
        .await
        .unwrap();

    assert_eq!(output.processed, input);
    assert_eq!(output.call_count(), 40);
    assert_eq!(output.attempts, 1);
    assert!(output.metadata.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(output.metadata.iter().all(|call| {
        call.operation == Operation::Put
            && call.requested == 25
            && call.unprocessed == 0
            && !call.capacity.is_empty()
    }));
    assert_eq!(output.consumed_capacity_units(), 1000.0);

    assert_eq!(scan_count(&batcher).await, 1000);
}

#[test_log::test(tokio::test)]
async fn test_get_returns_stored_items() {
    let store = store();
    let batcher = batcher(&store);
    let input = items(1000);
    let _ = batcher
        .put_items(input.clone(), &BatchOptions::default())
        .await
        .unwrap();

    let output = batcher
        .get_items(keys(&input[..200]), &BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(output.items.len(), 200);
    assert_eq!(output.call_count(), 2);
    for found in &output.items {
        assert!(input[..200].contains(found));
    }
}

#[test_log::test(tokio::test)]
async fn test_get_skips_missing_keys() {
    let store = store();
    let batcher = batcher(&store);
    let stored = items(10);
    let _ = batcher
        .put_items(stored.clone(), &BatchOptions::default())
        .await
        .unwrap();

    let mut requested = keys(&stored);
    requested.extend(keys(&items(5)));
    let output = batcher
        .get_items(requested, &BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(output.items.len(), 10);
}

#[test_log::test(tokio::test)]
async fn test_delete_everything() {
    let store = store();
    let batcher = batcher(&store);
    let input = items(1000);
    let _ = batcher
        .put_items(input.clone(), &BatchOptions::default())
        .await
        .unwrap();

    let output = batcher
        .delete_items(keys(&input), &BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(output.call_count(), 40);
    assert_eq!(scan_count(&batcher).await, 0);
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_put_with_invalid_item_reports_rejected_chunk() {
    let store = store();
    let batcher = batcher(&store);
    let mut input = items(36);
    input[25] = invalid_item();

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ValidationException");
    assert!(err.is_validation());
    assert_eq!(err.unprocessed_for(TABLE), &input[25..]);
    assert_eq!(err.unprocessed_count(), 11);
    match &err {
        Error::Validation { rejected, .. } => assert_eq!(rejected, &input[25..].to_vec()),
        other => panic!("unexpected error {other:?}"),
    }

    // the rejected chunk is never retried
    assert_eq!(store.call_count(), 2);
    assert_eq!(scan_count(&batcher).await, 25);
    for committed in &input[..25] {
        assert!(store.get(&schema().key.key_of(committed)).is_some());
    }
}

#[test_log::test(tokio::test)]
async fn test_delete_with_invalid_key_leaves_rejected_chunk() {
    let store = store();
    let batcher = batcher(&store);
    let input = items(36);
    let _ = batcher
        .put_items(input.clone(), &BatchOptions::default())
        .await
        .unwrap();

    let mut to_delete = keys(&input);
    to_delete[25] = invalid_item();
    let err = batcher
        .delete_items(to_delete.clone(), &BatchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ValidationException");
    assert_eq!(err.unprocessed_for(TABLE), &to_delete[25..]);
    assert_eq!(store.len(), 11);
    assert_eq!(store.items().len(), 11);
}

#[test_log::test(tokio::test)]
async fn test_prevalidation_rejects_before_any_call() {
    let store = store();
    let batcher = batcher(&store);
    let mut input = items(36);
    input[25] = invalid_item();

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default().prevalidate(true))
        .await
        .unwrap_err();

    match &err {
        Error::Validation {
            message,
            unprocessed,
            rejected,
        } => {
            assert!(message.contains("item 25"));
            assert_eq!(unprocessed[TABLE], input);
            assert_eq!(rejected, &vec![invalid_item()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.call_count(), 0);
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_empty_input_makes_no_calls() {
    let store = store();
    let batcher = batcher(&store);

    let output = batcher
        .put_items(Vec::new(), &BatchOptions::default())
        .await
        .unwrap();

    assert!(output.processed.is_empty());
    assert!(output.metadata.is_empty());
    assert_eq!(store.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_invalid_options_are_rejected() {
    let store = store();
    let batcher = batcher(&store);

    let err = batcher
        .put_items(items(3), &BatchOptions::default().concurrency(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let err = batcher
        .get_items(keys(&items(3)), &BatchOptions::default().batch_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(store.call_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_single_slot_serializes_every_verb() {
    let store = Arc::new(MemoryStore::new(schema()).with_latency(Duration::from_millis(5)));
    let batcher = batcher(&store);
    let options = BatchOptions::default().concurrency(1);
    let input = items(100);

    let written = batcher.put_items(input.clone(), &options).await.unwrap();
    let read = batcher.get_items(keys(&input), &options).await.unwrap();
    let deleted = batcher.delete_items(keys(&input), &options).await.unwrap();

    assert_eq!(written.call_count(), 4);
    assert_eq!(read.items.len(), 100);
    assert_eq!(deleted.call_count(), 4);
    assert_eq!(store.max_in_flight(), 1);
    assert!(store.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrency_cap_is_reached_not_exceeded() {
    let store = Arc::new(MemoryStore::new(schema()).with_latency(Duration::from_millis(5)));
    let batcher = batcher(&store);

    let output = batcher
        .put_items(items(250), &BatchOptions::default().concurrency(3))
        .await
        .unwrap();

    assert_eq!(output.call_count(), 10);
    assert_eq!(store.max_in_flight(), 3);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_single_attempt_reports_exactly_the_rejected_subset() {
    let store = Arc::new(
        MemoryStore::new(schema()).with_rejection(|item| range_of(item) % 5 == 0),
    );
    let batcher = batcher(&store);
    let input = items(50);

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default().batch_attempts(1))
        .await
        .unwrap_err();

    let expected: Vec<Item> = input
        .iter()
        .filter(|item| range_of(item) % 5 == 0)
        .cloned()
        .collect();
    match &err {
        Error::ExhaustedRetries {
            attempts,
            unprocessed,
        } => {
            assert_eq!(*attempts, 1);
            assert_eq!(unprocessed[TABLE], expected);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.call_count(), 2);
    assert_eq!(store.len(), 40);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unprocessed_items_are_retried_until_the_ceiling() {
    let store = Arc::new(
        MemoryStore::new(schema()).with_rejection(|item| range_of(item) == 3),
    );
    let batcher = batcher(&store);

    let err = batcher
        .put_items(items(10), &BatchOptions::default().batch_attempts(4))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ExhaustedRetries");
    assert_eq!(err.unprocessed_count(), 1);
    assert_eq!(store.call_count(), 4);
    assert_eq!(store.len(), 9);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_throttled_calls_recover() {
    let store = store();
    store.fail_next(ErrorKind::Throttling, 2);
    let batcher = batcher(&store);

    let output = batcher
        .put_items(items(10), &BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(output.attempts, 3);
    assert_eq!(output.call_count(), 3);
    assert_eq!(output.metadata[0].error, Some(ErrorKind::Throttling));
    assert_eq!(output.metadata[1].error, Some(ErrorKind::Throttling));
    assert_eq!(output.metadata[2].error, None);
    assert_eq!(output.metadata[2].attempt, 3);
    assert_eq!(store.len(), 10);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_persistent_transport_failure_is_exhausted() {
    let store = store();
    store.fail_next(ErrorKind::Transport, 100);
    let batcher = batcher(&store);
    let input = items(10);

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default().batch_attempts(3))
        .await
        .unwrap_err();

    match &err {
        Error::TransportExhausted {
            attempts,
            unprocessed,
            ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(unprocessed[TABLE], input);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.call_count(), 3);
}

#[test_log::test(tokio::test)]
async fn test_resubmitting_leftovers_is_idempotent() {
    let store = store();
    store.fail_next(ErrorKind::Transport, 1);
    let batcher = batcher(&store);
    let input = items(30);

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default().batch_attempts(1))
        .await
        .unwrap_err();
    let leftover = err.unprocessed_for(TABLE).to_vec();
    assert!(!leftover.is_empty());
    assert_eq!(store.len(), 30 - leftover.len());

    let _ = batcher
        .put_items(leftover, &BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(store.len(), 30);

    let _ = batcher
        .put_items(input, &BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(store.len(), 30);
}

#[test_log::test(tokio::test)]
async fn test_cancelled_before_start_makes_no_calls() {
    let store = store();
    let batcher = batcher(&store);
    let token = CancellationToken::new();
    token.cancel();
    let input = items(60);

    let err = batcher
        .put_items(input.clone(), &BatchOptions::default().cancel_on(token))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "Cancelled");
    assert_eq!(err.unprocessed_for(TABLE), input.as_slice());
    assert_eq!(store.call_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cancel_stops_queued_chunks_but_not_running_ones() {
    let store = Arc::new(MemoryStore::new(schema()).with_latency(Duration::from_millis(10)));
    let batcher = batcher(&store);
    let token = CancellationToken::new();
    let input = items(100);

    let trigger = token.clone();
    let _ = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        trigger.cancel();
    });

    let err = batcher
        .put_items(
            input.clone(),
            &BatchOptions::default().concurrency(1).cancel_on(token),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "Cancelled");
    assert_eq!(err.unprocessed_for(TABLE), &input[50..]);
    assert_eq!(store.call_count(), 2);
    assert_eq!(store.len(), 50);
}
