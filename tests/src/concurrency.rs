//! Concurrent access integration tests
//!
//! Many threads share one coordinator; per-model state must stay
//! consistent whatever the interleaving.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use hivemind_fl::{FlError, RoundStatus};
use integration_tests::{experience_batch, init_test_logging, test_config, TestHive};

const THREADS: usize = 8;
const PASSES: usize = 5;

#[test]
fn test_parallel_workers_keep_models_consistent() {
    init_test_logging();

    let mut config = test_config();
    config.min_workers_per_round = 2;
    let t = TestHive::new(config);
    let workers = t.register_workers(THREADS);
    let labels = ["bot-detection", "captcha", "rate-limit"];

    thread::scope(|s| {
        for (i, worker) in workers.iter().enumerate() {
            let hive = Arc::clone(&t.hive);
            let label = labels[i % labels.len()];
            s.spawn(move || {
                for _ in 0..PASSES {
                    for exp in experience_batch(worker, label, 10, 0.7) {
                        hive.record_experience(exp).unwrap();
                    }
                    hive.sync();
                    hive.check_aggregation();
                    for model_type in hive.model_types() {
                        match hive.start_federated_round(&model_type) {
                            Ok(_) | Err(FlError::RoundInProgress { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            });
        }
    });

    for model_type in t.hive.model_types() {
        let model = t.hive.model(&model_type).unwrap();
        let history = t.hive.round_history(&model_type).unwrap();
        let completed = history
            .iter()
            .filter(|r| r.status == RoundStatus::Completed)
            .count() as u64;

        assert_eq!(model.rounds_completed, completed, "{model_type}");
        assert_eq!(model.version, 1 + completed, "{model_type}");

        let ids: HashSet<&str> = history.iter().map(|r| r.round_id.as_str()).collect();
        assert_eq!(ids.len(), history.len(), "round IDs reused for {model_type}");

        let versions: Vec<u64> = history
            .iter()
            .filter_map(|r| r.aggregated.as_ref().map(|a| a.new_version))
            .collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{model_type}: {versions:?}");

        if let Some(active) = t.hive.active_round(&model_type).unwrap() {
            assert_eq!(active.status, RoundStatus::Training);
            assert!(!ids.contains(active.round_id.as_str()));
        }
    }

    let spent: f64 = t
        .hive
        .model_types()
        .iter()
        .map(|m| t.hive.model(m).unwrap().privacy_budget_used)
        .sum();
    assert!(spent <= t.hive.privacy_accountant().total + 1e-9);
}

#[test]
fn test_concurrent_registration_and_metrics() {
    init_test_logging();

    let t = TestHive::new(test_config());

    thread::scope(|s| {
        for i in 0..THREADS {
            let hive = Arc::clone(&t.hive);
            s.spawn(move || {
                let id = format!("worker-{i:02}");
                hive.register_worker(id.clone(), "eu");
                for _ in 0..20 {
                    hive.update_worker_metrics(&id, hivemind_fl::MetricsReport::full(0.9, 0.1, 0.8));
                }
            });
        }
    });

    assert_eq!(t.hive.worker_count(), THREADS);
    for i in 0..THREADS {
        let worker = t.hive.worker(&format!("worker-{i:02}")).unwrap();
        assert_eq!(worker.reputation_history.len(), 20);
        assert!(worker.trust_score > 0.5);
    }
}
