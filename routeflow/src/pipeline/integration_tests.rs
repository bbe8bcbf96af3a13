//! Tests combining executors, collectors, the await manager and redelivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::bridge::AwaitManager;
use crate::context::CORRELATION_ID;
use crate::core::UnitOfWork;
use crate::executor::{BoundedScheduler, Executor, ScheduledThreadPool, ThreadPoolExecutor};
use crate::pipeline::{GroupedBodies, Multicast};
use crate::redelivery::{DeadLetterQueue, RedeliveryErrorHandler, RedeliveryPolicy};
use crate::stages::{OffloadStage, ProcessorStage};
use crate::testing::{AlwaysFailingStage, FlakyStage};

fn pool(name: &str, size: usize) -> Arc<dyn Executor> {
    Arc::new(ThreadPoolExecutor::builder(name).pool_size(size).build().unwrap())
}

fn read_correlation_id() -> ProcessorStage {
    ProcessorStage::from_fn("read-correlation", |uow| {
        uow.body = CORRELATION_ID.get().map_or(serde_json::Value::Null, serde_json::Value::String);
        Ok(())
    })
}

#[test]
fn test_redelivery_retries_the_whole_multicast() {
    let flaky = Arc::new(FlakyStage::new("inventory", 2));
    let multicast = Multicast::new("fan-out", pool("branches", 2))
        .branch(Arc::clone(&flaky))
        .branch(ProcessorStage::from_fn("pricing", |uow| {
            uow.set_header("priced", serde_json::json!(true));
            Ok(())
        }));

    let handler = RedeliveryErrorHandler::builder("retry", multicast)
        .policy(RedeliveryPolicy::new(3))
        .build()
        .unwrap();

    let manager = AwaitManager::new();
    let uow = manager.await_stage(&handler, UnitOfWork::new(serde_json::json!("order"))).unwrap();

    assert!(!uow.is_failed());
    assert_eq!(flaky.attempts(), 3);
    assert_eq!(uow.redelivery_counter(), 2);
    assert_eq!(uow.body, serde_json::json!("order"));
    assert_eq!(uow.header("priced"), Some(&serde_json::json!(true)));
}

#[test]
fn test_async_redelivery_exhausts_into_dead_letter_queue() {
    let scheduled = Arc::new(ScheduledThreadPool::builder("redelivery").pool_size(1).build().unwrap());
    let dlq = Arc::new(DeadLetterQueue::new("orders.dlq"));
    let stage = Arc::new(AlwaysFailingStage::new("charge", "card declined"));

    let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
        .policy(
            RedeliveryPolicy::new(2)
                .with_redelivery_delay(Duration::from_millis(5))
                .with_async_delayed_redelivery(true),
        )
        .scheduler(BoundedScheduler::new(scheduled, 10))
        .failure_sink(dlq.clone())
        .build()
        .unwrap();

    let manager = AwaitManager::new();
    let uow = manager
        .await_stage(&handler, UnitOfWork::new(serde_json::json!({"amount": 42})).with_route_id("payments"))
        .unwrap();

    assert_eq!(stage.attempts(), 3);
    assert!(uow.is_exhausted());
    assert!(uow.is_handled());
    assert!(!uow.is_failed());
    assert_eq!(manager.statistics().threads_blocked, 1);

    let letters = dlq.drain();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].unit_of_work_id, uow.id());
    assert_eq!(letters[0].route_id.as_deref(), Some("payments"));
    assert_eq!(letters[0].redelivery_counter, 2);
    assert_eq!(letters[0].failure.as_deref(), Some("card declined"));
}

#[test]
fn test_context_follows_every_branch() {
    let multicast = Multicast::new("fan-out", pool("ctx", 2))
        .branch(read_correlation_id())
        .branch(read_correlation_id())
        .with_aggregation(GroupedBodies);

    let uow = CORRELATION_ID.bind("corr-7".to_string(), || {
        AwaitManager::new().await_stage(&multicast, UnitOfWork::new(serde_json::Value::Null))
    })
    .unwrap();

    assert_eq!(uow.body, serde_json::json!(["corr-7", "corr-7"]));
}

#[test]
fn test_context_stays_behind_when_propagation_is_off() {
    let multicast = Multicast::new("fan-out", pool("no-ctx", 1))
        .branch(read_correlation_id())
        .with_context_propagation(false);

    let uow = CORRELATION_ID.bind("corr-8".to_string(), || {
        AwaitManager::new().await_stage(&multicast, UnitOfWork::new(serde_json::json!("unset")))
    })
    .unwrap();

    assert_eq!(uow.body, serde_json::Value::Null);
}

#[test]
fn test_offloaded_branches_share_one_executor() {
    let executor = pool("shared", 4);
    let calls = Arc::new(AtomicUsize::new(0));
    let offload = |name: &'static str| {
        let calls = Arc::clone(&calls);
        OffloadStage::from_fn(
            name,
            move |uow: &mut UnitOfWork| {
                calls.fetch_add(1, Ordering::SeqCst);
                uow.body = serde_json::json!(name);
                Ok(())
            },
            Arc::clone(&executor),
        )
    };

    let manager = Arc::new(AwaitManager::new());
    let multicast = Multicast::new("fan-out", Arc::clone(&executor))
        .branch(offload("a"))
        .branch(offload("b"))
        .with_await_manager(Arc::clone(&manager))
        .with_aggregation(GroupedBodies);

    let uow = manager.await_stage(&multicast, UnitOfWork::new(serde_json::Value::Null)).unwrap();

    assert_eq!(uow.body, serde_json::json!(["a", "b"]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(manager.size(), 0);
}
