/// The full trainer over the stateful reference backbone: running
/// statistics, per-step slots, backup/restore across evaluation.

use metis_core::backbone::{BackboneConfig, NormReluClassifier};
use metis_core::learner::{MetaLearner, Task, TaskBatch};
use metis_core::model::MetaConfig;

const FEATURES: usize = 4;

fn backbone(cfg: &MetaConfig) -> NormReluClassifier {
    NormReluClassifier::new(BackboneConfig::new(FEATURES, 3, 2, cfg.max_inner_steps() + 1))
}

fn batch() -> TaskBatch {
    TaskBatch {
        tasks: vec![
            Task {
                support_x: vec![0.9, -0.1, 0.3, 0.2, -0.4, 0.8, 0.1, -0.2],
                support_y: vec![0, 1],
                target_x: vec![1.0, 0.0, 0.2, 0.3, -0.5, 0.7, 0.0, -0.1],
                target_y: vec![0, 1],
            },
            Task {
                support_x: vec![0.2, 0.6, -0.7, 0.1, 0.5, -0.3, 0.4, 0.9],
                support_y: vec![1, 0],
                target_x: vec![0.1, 0.7, -0.6, 0.2, 0.6, -0.2, 0.3, 0.8],
                target_y: vec![1, 0],
            },
        ],
    }
}

#[test]
fn test_train_iter_with_norm_backbone() {
    let cfg = MetaConfig::test_config();
    let net = backbone(&cfg);
    let mut learner = MetaLearner::new(cfg, net).unwrap();
    let before = learner.params.network.clone();
    let metrics = learner.run_train_iter(&batch(), 0).unwrap();
    assert!(metrics.loss.is_finite());
    assert!(metrics.accuracy >= 0.0 && metrics.accuracy <= 1.0);
    assert_ne!(learner.params.network, before);
    // Normalisation parameters are meta-learned even when excluded from
    // the inner loop.
    assert!(learner.params.network.contains("norm.gamma"));
}

#[test]
fn test_validation_restores_running_statistics() {
    let cfg = MetaConfig::test_config();
    let net = backbone(&cfg);
    let mut learner = MetaLearner::new(cfg, net).unwrap();

    // Prime the running statistics with one training iteration.
    learner.run_train_iter(&batch(), 0).unwrap();

    // Evaluation adapts with batch statistics but must leave the stored
    // running statistics exactly as it found them.
    let probe = |l: &mut MetaLearner<NormReluClassifier>| {
        l.run_validation_iter(&batch()).unwrap().loss
    };
    let first = probe(&mut learner);
    let second = probe(&mut learner);
    assert_eq!(
        first.to_bits(),
        second.to_bits(),
        "with restored statistics, repeated evaluation is bit-identical"
    );
}

#[test]
fn test_norm_params_in_inner_loop_toggle() {
    let mut cfg = MetaConfig::test_config();
    cfg.inner_loop_norm_params = true;
    let net = backbone(&cfg);
    let mut learner = MetaLearner::new(cfg, net).unwrap();
    // With the toggle on, the tables carry entries for the norm parameters.
    assert!(learner.params.tables.alpha.contains("norm.gamma"));
    let metrics = learner.run_train_iter(&batch(), 0).unwrap();
    assert!(metrics.loss.is_finite());
}

#[test]
fn test_metal_with_norm_backbone_smoke() {
    let cfg = MetaConfig::metal_test_config();
    let net = backbone(&cfg);
    let mut learner = MetaLearner::new(cfg, net).unwrap();
    for epoch in 0..2 {
        let metrics = learner.run_train_iter(&batch(), epoch).unwrap();
        assert!(metrics.loss.is_finite(), "epoch {epoch} loss must stay finite");
    }
    let eval = learner.run_validation_iter(&batch()).unwrap();
    assert!(eval.loss.is_finite());
}
