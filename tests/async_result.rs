use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand::{AsyncResult, Error};

#[tokio::test]
async fn resolves_exactly_once() {
    let result: AsyncResult<i64> = AsyncResult::new();
    result.set_result(1).unwrap();
    assert!(matches!(result.set_result(2), Err(Error::AlreadyCalled)));
    assert!(matches!(result.set_exception(Error::Timeout), Err(Error::AlreadyCalled)));
    assert!(matches!(result.cancel(), Err(Error::AlreadyCalled)));
    assert_eq!(result.result(None).await.unwrap(), 1);
}

#[tokio::test]
async fn callbacks_thread_values_in_attachment_order() {
    let result: AsyncResult<i64> = AsyncResult::new();
    result.add_callback(|v| Ok(v + 1)).add_callback(|v| Ok(v * 10));
    result.set_result(1).unwrap();
    assert_eq!(result.result(None).await.unwrap(), 20);
}

#[tokio::test]
async fn errors_skip_callbacks_until_an_errback() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let result: AsyncResult<i64> = AsyncResult::new();
    let raises = seen.clone();
    let skipped = seen.clone();
    let handles = seen.clone();
    result
        .add_callback(move |_| {
            raises.lock().unwrap().push("raise");
            Err(Error::Remote { kind: "Boom".to_string(), message: "raised".to_string() })
        })
        .add_callback(move |v| {
            skipped.lock().unwrap().push("skipped");
            Ok(v)
        })
        .add_errback(move |e| {
            assert_eq!(e.kind_name(), "Boom");
            handles.lock().unwrap().push("handled");
            Ok(7)
        });
    result.set_result(1).unwrap();
    assert_eq!(result.result(None).await.unwrap(), 7);
    assert_eq!(*seen.lock().unwrap(), vec!["raise", "handled"]);
}

#[tokio::test]
async fn errback_recovers_the_chain() {
    let result: AsyncResult<i64> = AsyncResult::new();
    result.add_errback(|_| Ok(0)).add_callback(|v| Ok(v + 5));
    result.set_exception(Error::Timeout).unwrap();
    assert_eq!(result.result(None).await.unwrap(), 5);
}

#[tokio::test]
async fn unresolved_result_times_out() {
    let result: AsyncResult<i64> = AsyncResult::new();
    let started = Instant::now();
    let err = result.result(Some(Duration::from_millis(100))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn cancel_blocks_resolution_and_runs_the_cancel_callback() {
    let cancelled = Arc::new(Mutex::new(false));
    let flag = cancelled.clone();
    let result: AsyncResult<i64> =
        AsyncResult::with_cancel_callback(move || *flag.lock().unwrap() = true);
    result.cancel().unwrap();
    assert!(*cancelled.lock().unwrap());
    assert!(result.is_cancelled());
    assert!(matches!(result.set_result(1), Err(Error::Cancelled)));
    assert!(matches!(result.result(None).await, Err(Error::Cancelled)));
    // second cancel is a no-op
    result.cancel().unwrap();
}

#[tokio::test]
async fn late_callbacks_run_immediately() {
    let result: AsyncResult<i64> = AsyncResult::new();
    result.set_result(4).unwrap();
    let seen = Arc::new(Mutex::new(0));
    let sink = seen.clone();
    result.add_callback(move |v| {
        *sink.lock().unwrap() = v;
        Ok(v)
    });
    assert_eq!(*seen.lock().unwrap(), 4);
}

#[tokio::test]
async fn other_tasks_progress_while_a_caller_waits() {
    let result: AsyncResult<i64> = AsyncResult::new();
    let resolver = result.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.set_result(9).unwrap();
    });
    assert_eq!(result.result(Some(Duration::from_secs(1))).await.unwrap(), 9);
}

#[tokio::test]
async fn into_result_moves_the_outcome_out() {
    let result: AsyncResult<i64> = AsyncResult::new();
    let consumer = result.clone();
    result.set_result(3).unwrap();
    assert_eq!(consumer.into_result(None).await.unwrap(), 3);
    assert!(matches!(result.into_result(None).await, Err(Error::AlreadyCalled)));
}
