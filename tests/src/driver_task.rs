//! Driver task integration tests
//!
//! The tokio task polls the coordinator's timers against a manual clock,
//! so virtual time moves only when a test advances it.

use std::time::Duration;

use hivemind_common::ModelType;
use hivemind_fl::{HiveMindCommand, HiveMindTask, TaskMessage};
use integration_tests::{
    experience_batch, init_test_logging, test_config, wait_for_condition, TestHive,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT,
};

fn stealth() -> ModelType {
    ModelType::new("stealth-detection")
}

#[tokio::test]
async fn test_task_drives_sync_and_aggregation() {
    init_test_logging();

    let t = TestHive::new(test_config());
    let workers = t.register_workers(3);
    for worker in &workers {
        for exp in experience_batch(worker, "bot-detection", 20, 0.75) {
            t.hive.record_experience(exp).unwrap();
        }
    }

    let (handle, join) = HiveMindTask::new(t.hive.clone(), Duration::from_millis(2)).spawn();

    t.clock.advance(t.hive.config().sync_interval_ms);
    let hive = t.hive.clone();
    wait_for_condition(
        || {
            let hive = hive.clone();
            async move { hive.queued_updates(&stealth()).unwrap() == 3 }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .expect("sync timer fired");

    t.clock.advance(t.hive.config().sync_interval_ms);
    let hive = t.hive.clone();
    wait_for_condition(
        || {
            let hive = hive.clone();
            async move { hive.model_version(&stealth()).unwrap() == 2 }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .expect("aggregation check fired");

    assert_eq!(t.transport.deliveries().len(), 3);

    handle.shutdown().await.unwrap();
    join.await.unwrap();
    assert!(!t.hive.is_running());
    assert_eq!(t.hive.next_deadline(), None);
}

#[tokio::test]
async fn test_commands_bypass_timers() {
    init_test_logging();

    let t = TestHive::new(test_config());
    let workers = t.register_workers(3);
    for worker in &workers {
        for exp in experience_batch(worker, "waf", 10, 1.0) {
            t.hive.record_experience(exp).unwrap();
        }
    }

    let (handle, join) = HiveMindTask::new(t.hive.clone(), Duration::from_millis(50)).spawn();

    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.updates_generated, 3);
    assert_eq!(report.queued, 3);

    let started = handle.check_aggregation().await.unwrap();
    assert_eq!(started, vec!["bypass-strategy-r000001".to_string()]);
    assert_eq!(t.hive.model_version(&ModelType::new("bypass-strategy")).unwrap(), 2);

    // Fire-and-forget form
    handle
        .send(HiveMindCommand::StartRound {
            model_type: stealth(),
            reply: None,
        })
        .await
        .unwrap();
    let hive = t.hive.clone();
    wait_for_condition(
        || {
            let hive = hive.clone();
            async move { hive.active_round(&stealth()).unwrap().is_some() }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .expect("round started");

    handle.shutdown().await.unwrap();
    join.await.unwrap();
    assert!(handle.is_closed());
    assert!(handle.check_aggregation().await.is_none());
}

#[tokio::test]
async fn test_stopped_coordinator_ignores_due_timers() {
    init_test_logging();

    let t = TestHive::new(test_config());
    let workers = t.register_workers(1);
    for exp in experience_batch(&workers[0], "bot-detection", 10, 1.0) {
        t.hive.record_experience(exp).unwrap();
    }

    let (handle, join) = HiveMindTask::new(t.hive.clone(), Duration::from_millis(2)).spawn();
    handle.send(HiveMindCommand::SyncNow { reply: None }).await.unwrap();
    handle.shutdown().await.unwrap();
    join.await.unwrap();

    t.clock.advance(t.hive.config().sync_interval_ms * 10);
    assert_eq!(t.hive.run_due(), 0);
    assert_eq!(t.hive.queued_updates(&stealth()).unwrap(), 1);
}

#[test]
fn test_task_message_constructors() {
    let msg: TaskMessage<u8> = TaskMessage::message(1);
    assert!(matches!(msg, TaskMessage::Message(1)));
    assert!(matches!(TaskMessage::<u8>::shutdown(), TaskMessage::Shutdown));
}
