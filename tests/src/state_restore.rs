//! State export and restore integration tests

use hivemind_common::{HiveMindConfig, ModelArchitecture, ModelConfig, ModelType};
use hivemind_fl::{
    FlError, HiveMind, HiveMindEvent, HiveMindState, RejectReason, RoundStatus, SubmitOutcome,
};
use integration_tests::{experience_batch, init_test_logging, test_config, TestHive};

fn stealth() -> ModelType {
    ModelType::new("stealth-detection")
}

fn bypass() -> ModelType {
    ModelType::new("bypass-strategy")
}

fn feed(t: &TestHive, workers: &[String], label: &str) {
    for worker in workers {
        for exp in experience_batch(worker, label, 10, 0.7) {
            t.hive.record_experience(exp).unwrap();
        }
    }
    t.hive.sync();
}

/// Coordinator with one finished round, one in-flight round and one
/// queued update
fn busy_hive() -> TestHive {
    let t = TestHive::new(test_config());
    let workers = t.register_workers(3);

    feed(&t, &workers, "bot-detection");
    assert_eq!(t.hive.check_aggregation().len(), 1);
    assert_eq!(t.hive.model_version(&stealth()).unwrap(), 2);

    t.hive.start_federated_round(&stealth()).unwrap();
    feed(&t, &workers[..1], "bot-detection");
    feed(&t, &workers[..1], "captcha");

    assert_eq!(t.hive.active_round(&stealth()).unwrap().unwrap().pending.len(), 1);
    assert_eq!(t.hive.queued_updates(&bypass()).unwrap(), 1);
    t
}

#[test]
fn test_restore_preserves_models_and_workers() {
    init_test_logging();

    let original = busy_hive();
    let json = original.hive.export_state().to_json().unwrap();
    let state = HiveMindState::from_json(&json).unwrap();
    let restored = TestHive::restored(test_config(), state);

    for model_type in original.hive.model_types() {
        let before = original.hive.model(&model_type).unwrap();
        let after = restored.hive.model(&model_type).unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.rounds_completed, before.rounds_completed);
        assert_eq!(after.samples_processed, before.samples_processed);
        assert_eq!(after.accuracy, before.accuracy);
        assert_eq!(after.snapshot(), before.snapshot());
    }

    assert_eq!(restored.hive.worker_count(), 3);
    for id in ["worker-00", "worker-01", "worker-02"] {
        let before = original.hive.worker(id).unwrap();
        let after = restored.hive.worker(id).unwrap();
        assert_eq!(after.region, before.region);
        assert_eq!(after.model_versions, before.model_versions);
        assert_eq!(after.updates_received, before.updates_received);
        assert_eq!(after.rounds_participated, before.rounds_participated);
        assert_eq!(after.trust_score, before.trust_score);
    }

    let spent_before = original.hive.privacy_accountant().total;
    let spent_after = restored.hive.privacy_accountant().total;
    assert!((spent_after - spent_before).abs() < 1e-9);
}

#[test]
fn test_in_flight_round_is_recorded_as_interrupted() {
    init_test_logging();

    let original = busy_hive();
    let in_flight = original.hive.active_round(&stealth()).unwrap().unwrap();
    let mut restored = TestHive::restored(test_config(), original.hive.export_state());

    assert!(restored.hive.active_round(&stealth()).unwrap().is_none());
    let history = restored.hive.round_history(&stealth()).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, RoundStatus::Completed);
    assert_eq!(history[1].round_id, in_flight.round_id);
    assert_eq!(history[1].status, RoundStatus::Failed);
    assert_eq!(history[1].failure_reason.as_deref(), Some("interrupted"));

    // Interrupted updates are not applied
    assert_eq!(restored.hive.model_version(&stealth()).unwrap(), 2);

    // Sequence numbers continue after the interrupted round
    let next = restored.hive.start_federated_round(&stealth()).unwrap();
    assert_eq!(next, "stealth-detection-r000003");

    assert!(restored.events().iter().any(|e| matches!(
        e,
        HiveMindEvent::RoundFailed { reason, .. } if reason == "interrupted"
    )));
}

#[test]
fn test_queued_updates_survive_restore() {
    init_test_logging();

    let original = busy_hive();
    let restored = TestHive::restored(test_config(), original.hive.export_state());
    assert_eq!(restored.hive.queued_updates(&bypass()).unwrap(), 1);

    let round_id = restored.hive.start_federated_round(&bypass()).unwrap();
    let active = restored.hive.active_round(&bypass()).unwrap().unwrap();
    assert_eq!(active.round_id, round_id);
    assert_eq!(active.pending.len(), 1);
    assert_eq!(restored.hive.queued_updates(&bypass()).unwrap(), 0);

    // A restored worker keeps contributing
    for exp in experience_batch("worker-01", "captcha", 10, 0.5) {
        restored.hive.record_experience(exp).unwrap();
    }
    let report = restored.hive.sync();
    assert_eq!(report.accepted, 1);
    let active = restored.hive.active_round(&bypass()).unwrap().unwrap();
    assert_eq!(active.participants, vec!["worker-00".to_string(), "worker-01".to_string()]);
}

#[test]
fn test_restore_rejects_unconfigured_model() {
    init_test_logging();

    let original = busy_hive();
    let state = original.hive.export_state();

    let config = HiveMindConfig {
        models: vec![ModelConfig::new("stealth-detection", ModelArchitecture::dense(&[32, 16, 4]))],
        label_routes: Default::default(),
        default_model: stealth(),
        ..test_config()
    };
    let result = HiveMind::builder(config).restore(state).build();
    assert!(matches!(result, Err(FlError::StateMismatch { .. })));
}

#[test]
fn test_restore_rejects_changed_architecture() {
    init_test_logging();

    let original = busy_hive();
    let mut config = test_config();
    config.models[0].architecture = ModelArchitecture::dense(&[8, 4]);

    let result = HiveMind::builder(config)
        .restore(original.hive.export_state())
        .build();
    assert!(matches!(result, Err(FlError::StateMismatch { .. })));
}

#[test]
fn test_exported_update_is_resubmittable() {
    init_test_logging();

    let original = busy_hive();
    let exported = original.hive.export_state();
    let state = HiveMindState::from_json(&exported.to_json().unwrap()).unwrap();
    assert_eq!(state.queued.len(), 1);
    assert_eq!(state.in_flight.len(), 1);
    assert_eq!(state.queued[0].gradients, exported.queued[0].gradients);

    let fresh = TestHive::new(test_config());
    fresh.register_workers(3);
    let outcome = fresh.hive.submit_update(state.queued[0].clone()).unwrap();
    assert_eq!(outcome, SubmitOutcome::Queued);
}

#[test]
fn test_queued_update_survives_json_restore() {
    init_test_logging();

    let original = busy_hive();
    let json = original.hive.export_state().to_json().unwrap();
    let mut restored = TestHive::restored(test_config(), HiveMindState::from_json(&json).unwrap());

    assert_eq!(restored.hive.queued_updates(&bypass()).unwrap(), 1);
    assert!(!restored
        .events()
        .iter()
        .any(|e| matches!(e, HiveMindEvent::UpdateRejected { .. })));

    restored.hive.start_federated_round(&bypass()).unwrap();
    let active = restored.hive.active_round(&bypass()).unwrap().unwrap();
    assert_eq!(active.pending.len(), 1);
    assert_eq!(active.pending[0].worker_id, "worker-00");
}

#[test]
fn test_tampered_queued_update_is_dropped_on_restore() {
    init_test_logging();

    let original = busy_hive();
    let mut state = original.hive.export_state();
    let tampered_id = state.queued[0].update_id.clone();
    state.queued[0].gradients[0] += 0.5;

    let mut restored = TestHive::restored(test_config(), state);
    assert_eq!(restored.hive.queued_updates(&bypass()).unwrap(), 0);
    assert!(restored.events().iter().any(|e| matches!(
        e,
        HiveMindEvent::UpdateRejected { update_id, reason: RejectReason::InvalidSignature, .. }
            if *update_id == tampered_id
    )));

    // The rest of the state is still restored
    assert_eq!(restored.hive.worker_count(), 3);
    assert_eq!(restored.hive.model_version(&stealth()).unwrap(), 2);
}
