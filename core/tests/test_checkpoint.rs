/// Checkpoint round-trips through the trainer: byte-identical restore,
/// "latest" sentinel addressing, and loud failure on configuration
/// mismatch with nothing partially applied.

use metis_core::backbone::LinearBackbone;
use metis_core::learner::{MetaLearner, Task, TaskBatch};
use metis_core::model::MetaConfig;

fn batch() -> TaskBatch {
    TaskBatch {
        tasks: vec![Task {
            support_x: vec![1.0, 0.1, -0.2, 0.8],
            support_y: vec![0, 1],
            target_x: vec![0.9, 0.0, 0.1, 0.7],
            target_y: vec![0, 1],
        }],
    }
}

fn trained_learner(cfg: MetaConfig) -> MetaLearner<LinearBackbone> {
    let mut learner = MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap();
    for epoch in 0..3 {
        learner.run_train_iter(&batch(), epoch).unwrap();
    }
    learner
}

#[test]
fn test_save_load_reproduces_outputs() {
    let cfg = MetaConfig::alfa_test_config();
    let mut trained = trained_learner(cfg.clone());
    let dir = tempfile::tempdir().unwrap();

    let mut state = serde_json::Map::new();
    state.insert("current_epoch".to_string(), serde_json::json!(3));
    state.insert("best_val_accuracy".to_string(), serde_json::json!(0.62));
    trained.save_model(dir.path(), "train_model", "3", state).unwrap();

    // A fresh learner with the same configuration but different weights.
    let mut restored = MetaLearner::new(
        MetaConfig { seed: 777, ..cfg },
        LinearBackbone::new(2, 2),
    )
    .unwrap();
    assert_ne!(restored.params, trained.params);

    let state = restored.load_model(dir.path(), "train_model", "3").unwrap();
    assert_eq!(state.get("current_epoch"), Some(&serde_json::json!(3)));
    assert_eq!(restored.params, trained.params, "loaded values must be byte-identical");

    // Identical parameters imply identical forward behavior.
    let a = trained.training_batch_loss(&batch(), 5).unwrap();
    let b = restored.training_batch_loss(&batch(), 5).unwrap();
    assert_eq!(a.to_bits(), b.to_bits(), "restored model must reproduce outputs exactly");
}

#[test]
fn test_latest_sentinel_addresses_newest_save() {
    let cfg = MetaConfig::test_config();
    let mut trained = trained_learner(cfg.clone());
    let dir = tempfile::tempdir().unwrap();

    trained.save_model(dir.path(), "train_model", "1", serde_json::Map::new()).unwrap();
    trained.run_train_iter(&batch(), 4).unwrap();
    trained.save_model(dir.path(), "train_model", "2", serde_json::Map::new()).unwrap();

    let mut restored = MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap();
    restored.load_model(dir.path(), "train_model", "latest").unwrap();
    assert_eq!(restored.params, trained.params, "latest must point at the newest snapshot");
}

#[test]
fn test_config_mismatch_fails_loudly_without_partial_apply() {
    // A checkpoint from an ALFA run has generator and beta-table groups a
    // plain configuration does not; loading must fail and leave the
    // current parameters untouched.
    let mut alfa = trained_learner(MetaConfig::alfa_test_config());
    let dir = tempfile::tempdir().unwrap();
    alfa.save_model(dir.path(), "train_model", "latest", serde_json::Map::new()).unwrap();

    let mut plain = MetaLearner::new(MetaConfig::test_config(), LinearBackbone::new(2, 2)).unwrap();
    let before = plain.params.clone();
    let err = plain.load_model(dir.path(), "train_model", "latest").unwrap_err();
    assert!(matches!(err, metis_core::params::MetaError::CheckpointMismatch { .. }));
    assert_eq!(plain.params, before, "a failed load must not be partially applied");
}

#[test]
fn test_backbone_shape_mismatch_fails() {
    let mut small = trained_learner(MetaConfig::test_config());
    let dir = tempfile::tempdir().unwrap();
    small.save_model(dir.path(), "train_model", "latest", serde_json::Map::new()).unwrap();

    // Same parameter names, different feature dimensionality.
    let mut wide =
        MetaLearner::new(MetaConfig::test_config(), LinearBackbone::new(3, 2)).unwrap();
    let err = wide.load_model(dir.path(), "train_model", "latest").unwrap_err();
    assert!(matches!(err, metis_core::params::MetaError::CheckpointMismatch { .. }));
}
