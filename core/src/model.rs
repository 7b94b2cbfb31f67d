/// Meta-learning configuration, meta-parameters, and checkpoint
/// serialization.
///
/// Meta-parameters persist across the whole training run and are mutated
/// only by the outer optimizer step; every per-task copy is transient.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::alfa;
use crate::backbone::FunctionalBackbone;
use crate::lslr::{self, LslrConfig, LslrTables};
use crate::meta_loss;
use crate::params::{MetaError, ParamDict};
use crate::tensor::SimpleRng;

// ── Configuration ────────────────────────────────────────────────────

/// Full configuration surface of the bi-level trainer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Tasks per outer iteration.
    pub batch_size: usize,
    /// Inner-loop steps during meta-training.
    pub num_train_steps: usize,
    /// Inner-loop steps during evaluation.
    pub num_eval_steps: usize,
    pub init_inner_loop_learning_rate: f32,
    pub init_inner_loop_weight_decay: f32,

    /// Meta-learn the per-layer per-step learning rates.
    pub learnable_per_step_rates: bool,
    /// Task-conditioned alpha/beta generation.
    pub alfa: bool,
    /// ALFA random-init mode: per-parameter-shaped decay tensors.
    pub random_init: bool,
    /// Learned adaptive loss networks.
    pub meta_loss: bool,
    /// Multi-step loss blending over the first epochs of training.
    pub use_multi_step_loss: bool,
    pub multi_step_loss_num_epochs: usize,
    /// Retain the inner-loop graph for gradient-of-gradient…
    pub second_order: bool,
    /// …but only after this epoch (first-order before, to save compute).
    pub first_to_second_order_epoch: usize,
    /// Include normalisation parameters in inner-loop adaptation.
    pub inner_loop_norm_params: bool,

    pub meta_learning_rate: f32,
    pub min_meta_learning_rate: f32,
    /// Cosine-annealing horizon for the outer learning rate.
    pub total_epochs: usize,
    pub seed: u64,
}

impl MetaConfig {
    /// Tiny plain-MAML configuration for tests: fixed SGD inner loop, no
    /// generated modulation, no learned loss.
    pub fn test_config() -> Self {
        MetaConfig {
            batch_size: 2,
            num_train_steps: 2,
            num_eval_steps: 2,
            init_inner_loop_learning_rate: 0.1,
            init_inner_loop_weight_decay: 5e-4,
            learnable_per_step_rates: true,
            alfa: false,
            random_init: false,
            meta_loss: false,
            use_multi_step_loss: true,
            multi_step_loss_num_epochs: 10,
            second_order: false,
            first_to_second_order_epoch: 40,
            inner_loop_norm_params: false,
            meta_learning_rate: 1e-3,
            min_meta_learning_rate: 1e-5,
            total_epochs: 100,
            seed: 42,
        }
    }

    /// ALFA configuration: generated per-task alpha/beta modulation.
    pub fn alfa_test_config() -> Self {
        MetaConfig { alfa: true, ..Self::test_config() }
    }

    /// ALFA + random-init per-parameter decay.
    pub fn alfa_random_init_test_config() -> Self {
        MetaConfig { alfa: true, random_init: true, ..Self::test_config() }
    }

    /// Learned adaptive loss on top of ALFA.
    pub fn metal_test_config() -> Self {
        MetaConfig { alfa: true, meta_loss: true, ..Self::test_config() }
    }

    /// Table length driver: tables must cover both phases.
    pub fn max_inner_steps(&self) -> usize {
        self.num_train_steps.max(self.num_eval_steps)
    }

    pub fn validate(&self) -> Result<(), MetaError> {
        if self.num_train_steps == 0 || self.num_eval_steps == 0 {
            return Err(MetaError::InvalidConfig {
                detail: "inner-loop step counts must be positive".to_string(),
            });
        }
        if self.init_inner_loop_learning_rate <= 0.0 {
            return Err(MetaError::InvalidConfig {
                detail: "init_inner_loop_learning_rate must be positive".to_string(),
            });
        }
        if self.meta_learning_rate <= 0.0 {
            return Err(MetaError::InvalidConfig {
                detail: "meta_learning_rate must be positive".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(MetaError::InvalidConfig { detail: "batch_size must be positive".to_string() });
        }
        if self.random_init && !self.alfa {
            return Err(MetaError::InvalidConfig {
                detail: "random_init requires alfa mode".to_string(),
            });
        }
        Ok(())
    }

    pub fn lslr_config(&self) -> LslrConfig {
        LslrConfig {
            num_steps: self.max_inner_steps(),
            init_learning_rate: self.init_inner_loop_learning_rate,
            init_weight_decay: self.init_inner_loop_weight_decay,
            alfa: self.alfa,
            random_init: self.random_init,
        }
    }
}

/// Parameters eligible for inner-loop adaptation: everything trainable,
/// with normalisation parameters excluded unless the toggle is set.
pub fn inner_loop_parameter_dict(network: &ParamDict, include_norm_params: bool) -> ParamDict {
    let mut out = ParamDict::new();
    for (name, tensor) in network.iter() {
        if include_norm_params || !name.contains("norm") {
            out.insert(name, tensor.clone());
        }
    }
    out
}

// ── Meta-parameters ──────────────────────────────────────────────────

/// Everything the outer loop learns: backbone initialisation, learning-rate
/// and decay tables, the update-rule generator, and the per-step loss
/// networks with their adapters. Unused groups stay empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaParams {
    pub network: ParamDict,
    pub tables: LslrTables,
    pub generator: ParamDict,
    pub support_loss: ParamDict,
    pub query_loss: ParamDict,
    pub support_adapter: ParamDict,
    pub query_adapter: ParamDict,
}

/// Stable iteration order over the parameter groups. The outer optimizer
/// and gradient accumulators both rely on it.
pub const META_PARAM_GROUPS: [&str; 9] = [
    "network",
    "alpha",
    "beta",
    "beta_per_param",
    "generator",
    "support_loss",
    "query_loss",
    "support_adapter",
    "query_adapter",
];

impl MetaParams {
    /// Initialise all meta-parameters for a configuration and backbone.
    pub fn init(cfg: &MetaConfig, backbone: &impl FunctionalBackbone, rng: &mut SimpleRng) -> Self {
        let network = backbone.init_params(rng);
        let inner = inner_loop_parameter_dict(&network, cfg.inner_loop_norm_params);
        let tables = lslr::initialise(&cfg.lslr_config(), &inner);

        let num_layers = inner.len();
        let generator =
            if cfg.alfa { alfa::init_params(num_layers, rng) } else { ParamDict::new() };

        let (support_loss, query_loss, support_adapter, query_adapter) = if cfg.meta_loss {
            let n = backbone.num_classes();
            let steps = cfg.max_inner_steps();
            (
                meta_loss::loss_net_init(meta_loss::support_state_dim(num_layers, n), steps, rng),
                meta_loss::loss_net_init(meta_loss::query_state_dim(num_layers, n), steps, rng),
                meta_loss::adapter_init(meta_loss::support_adapter_dim(num_layers), steps, rng),
                meta_loss::adapter_init(meta_loss::query_state_dim(num_layers, n), steps, rng),
            )
        } else {
            (ParamDict::new(), ParamDict::new(), ParamDict::new(), ParamDict::new())
        };

        MetaParams {
            network,
            tables,
            generator,
            support_loss,
            query_loss,
            support_adapter,
            query_adapter,
        }
    }

    pub fn group(&self, name: &str) -> &ParamDict {
        match name {
            "network" => &self.network,
            "alpha" => &self.tables.alpha,
            "beta" => &self.tables.beta,
            "beta_per_param" => &self.tables.beta_per_param,
            "generator" => &self.generator,
            "support_loss" => &self.support_loss,
            "query_loss" => &self.query_loss,
            "support_adapter" => &self.support_adapter,
            "query_adapter" => &self.query_adapter,
            other => panic!("unknown meta-parameter group {other}"),
        }
    }

    pub fn group_mut(&mut self, name: &str) -> &mut ParamDict {
        match name {
            "network" => &mut self.network,
            "alpha" => &mut self.tables.alpha,
            "beta" => &mut self.tables.beta,
            "beta_per_param" => &mut self.tables.beta_per_param,
            "generator" => &mut self.generator,
            "support_loss" => &mut self.support_loss,
            "query_loss" => &mut self.query_loss,
            "support_adapter" => &mut self.support_adapter,
            "query_adapter" => &mut self.query_adapter,
            other => panic!("unknown meta-parameter group {other}"),
        }
    }

    /// Zero-filled shadow for gradient accumulation.
    pub fn zeros_like(&self) -> Self {
        let mut out = MetaParams::default();
        for g in META_PARAM_GROUPS {
            *out.group_mut(g) = self.group(g).zeros_like();
        }
        out
    }

    /// Element-wise accumulate: self += other. Group key sets must match.
    pub fn accumulate(&mut self, other: &MetaParams) -> Result<(), MetaError> {
        for g in META_PARAM_GROUPS {
            self.group_mut(g).accumulate(other.group(g))?;
        }
        Ok(())
    }

    /// In-place scalar multiply of everything.
    pub fn scale(&mut self, scalar: f32) {
        for g in META_PARAM_GROUPS {
            self.group_mut(g).scale(scalar);
        }
    }

    /// Total number of scalar meta-parameters.
    pub fn num_params(&self) -> usize {
        META_PARAM_GROUPS.iter().map(|g| self.group(g).num_params()).sum()
    }

    /// Verify another instance has the identical structure (names and
    /// shapes in every group). Used by checkpoint loading.
    pub fn check_same_structure(&self, other: &MetaParams) -> Result<(), MetaError> {
        for g in META_PARAM_GROUPS {
            self.group(g).check_same_keys(other.group(g), "MetaParams::check_same_structure").map_err(
                |e| MetaError::CheckpointMismatch { detail: format!("group {g}: {e}") },
            )?;
        }
        Ok(())
    }
}

// ── Checkpoint serialization ─────────────────────────────────────────

/// A persisted training snapshot: an arbitrary experiment-state mapping
/// plus the full meta-parameter state under the `network` key.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: serde_json::Map<String, serde_json::Value>,
    pub network: MetaParams,
}

/// Checkpoint file addressed by directory + name + index. The index may be
/// a literal "latest".
pub fn checkpoint_path(dir: &Path, name: &str, idx: &str) -> PathBuf {
    dir.join(format!("{name}_{idx}.json"))
}

/// Save a checkpoint under `{name}_{idx}.json` and refresh the
/// `{name}_latest.json` sentinel.
pub fn save_checkpoint(
    dir: &Path,
    name: &str,
    idx: &str,
    state: serde_json::Map<String, serde_json::Value>,
    params: &MetaParams,
) -> Result<PathBuf, MetaError> {
    let checkpoint = Checkpoint { state, network: params.clone() };
    let json = serde_json::to_string(&checkpoint)?;
    let path = checkpoint_path(dir, name, idx);
    std::fs::write(&path, &json)?;
    if idx != "latest" {
        std::fs::write(checkpoint_path(dir, name, "latest"), &json)?;
    }
    Ok(path)
}

/// Load a checkpoint. Structural validation against the current model
/// happens in `MetaLearner::load_model`, before anything is applied.
pub fn load_checkpoint(dir: &Path, name: &str, idx: &str) -> Result<Checkpoint, MetaError> {
    let json = std::fs::read_to_string(checkpoint_path(dir, name, idx))?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{BackboneConfig, NormReluClassifier};

    fn backbone() -> NormReluClassifier {
        NormReluClassifier::new(BackboneConfig::new(4, 3, 2, 3))
    }

    #[test]
    fn test_config_validate() {
        assert!(MetaConfig::test_config().validate().is_ok());
        let mut bad = MetaConfig::test_config();
        bad.num_train_steps = 0;
        assert!(bad.validate().is_err());
        let mut bad = MetaConfig::test_config();
        bad.random_init = true;
        assert!(bad.validate().is_err(), "random_init without alfa is rejected");
    }

    #[test]
    fn test_inner_dict_excludes_norm_params() {
        let mut rng = SimpleRng::new(42);
        let net = backbone().init_params(&mut rng);
        let inner = inner_loop_parameter_dict(&net, false);
        assert!(!inner.contains("norm.gamma"));
        assert!(!inner.contains("norm.beta"));
        assert_eq!(inner.len(), net.len() - 2);

        let all = inner_loop_parameter_dict(&net, true);
        assert_eq!(all.len(), net.len());
    }

    #[test]
    fn test_init_deterministic() {
        let cfg = MetaConfig::metal_test_config();
        let mut r1 = SimpleRng::new(cfg.seed);
        let mut r2 = SimpleRng::new(cfg.seed);
        let p1 = MetaParams::init(&cfg, &backbone(), &mut r1);
        let p2 = MetaParams::init(&cfg, &backbone(), &mut r2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_plain_config_has_no_optional_groups() {
        let cfg = MetaConfig::test_config();
        let mut rng = SimpleRng::new(cfg.seed);
        let p = MetaParams::init(&cfg, &backbone(), &mut rng);
        assert!(p.generator.is_empty());
        assert!(p.tables.beta.is_empty());
        assert!(p.support_loss.is_empty());
        // One lr table per adapted layer, num_steps + 1 entries each.
        assert_eq!(p.tables.alpha.len(), 4);
        for (_, t) in p.tables.alpha.iter() {
            assert_eq!(t.shape, vec![cfg.max_inner_steps() + 1]);
        }
    }

    #[test]
    fn test_metal_config_groups_populated() {
        let cfg = MetaConfig::metal_test_config();
        let mut rng = SimpleRng::new(cfg.seed);
        let p = MetaParams::init(&cfg, &backbone(), &mut rng);
        assert!(!p.generator.is_empty());
        assert!(!p.tables.beta.is_empty());
        assert!(!p.support_loss.is_empty());
        assert!(!p.query_loss.is_empty());
        assert!(!p.support_adapter.is_empty());
        assert!(!p.query_adapter.is_empty());
    }

    #[test]
    fn test_zeros_like_and_accumulate() {
        let cfg = MetaConfig::alfa_test_config();
        let mut rng = SimpleRng::new(cfg.seed);
        let p = MetaParams::init(&cfg, &backbone(), &mut rng);
        let mut acc = p.zeros_like();
        assert_eq!(acc.num_params(), p.num_params());
        acc.accumulate(&p).unwrap();
        acc.accumulate(&p).unwrap();
        acc.scale(0.5);
        let w = acc.network.get("layer1.weight").unwrap();
        let orig = p.network.get("layer1.weight").unwrap();
        for (a, b) in w.data.iter().zip(orig.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_structure_check_catches_mismatch() {
        let cfg = MetaConfig::test_config();
        let mut rng = SimpleRng::new(cfg.seed);
        let p = MetaParams::init(&cfg, &backbone(), &mut rng);
        let mut other = p.clone();
        other.network.insert("rogue.weight", crate::tensor::Tensor::zeros(&[1]));
        let err = p.check_same_structure(&other).unwrap_err();
        assert!(matches!(err, MetaError::CheckpointMismatch { .. }));
    }

    #[test]
    fn test_checkpoint_roundtrip_bit_identical() {
        let cfg = MetaConfig::metal_test_config();
        let mut rng = SimpleRng::new(cfg.seed);
        let p = MetaParams::init(&cfg, &backbone(), &mut rng);

        let dir = tempfile::tempdir().unwrap();
        let mut state = serde_json::Map::new();
        state.insert("current_epoch".to_string(), serde_json::json!(7));
        save_checkpoint(dir.path(), "train_model", "7", state, &p).unwrap();

        let loaded = load_checkpoint(dir.path(), "train_model", "7").unwrap();
        assert_eq!(loaded.network, p, "parameter values must round-trip bit-identically");
        assert_eq!(loaded.state.get("current_epoch"), Some(&serde_json::json!(7)));

        // The "latest" sentinel points at the same snapshot.
        let latest = load_checkpoint(dir.path(), "train_model", "latest").unwrap();
        assert_eq!(latest.network, p);
    }

    #[test]
    fn test_checkpoint_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint(dir.path(), "train_model", "latest").unwrap_err();
        assert!(matches!(err, MetaError::Io(_)));
    }

    #[test]
    fn test_checkpoint_malformed_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(checkpoint_path(dir.path(), "m", "latest"), "{\"state\": {}}").unwrap();
        let err = load_checkpoint(dir.path(), "m", "latest").unwrap_err();
        assert!(matches!(err, MetaError::Json(_)));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = MetaConfig::metal_test_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MetaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.alfa, cfg.alfa);
        assert_eq!(back.num_train_steps, cfg.num_train_steps);
        assert_eq!(back.seed, cfg.seed);
    }
}
