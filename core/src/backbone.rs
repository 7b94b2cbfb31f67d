/// Base-network contract and reference classifiers.
///
/// The bi-level trainer treats the feature extractor as an opaque
/// differentiable function: a parameter-functional forward pass that
/// records onto the tape, taking an explicit named-parameter dict override
/// instead of owned module state. Per-step running statistics are the only
/// mutable state, with checkpoint/restore for evaluation.

use crate::params::{MetaError, ParamDict};
use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};
use crate::traced::{self, TapeParams};

/// Parameter-functional base network.
///
/// Gradients are produced fresh per `Tape::grad` call, so the usual
/// zero-grad operation has no equivalent here.
pub trait FunctionalBackbone {
    /// Build the trainable parameter dict. Fixes the parameter name set
    /// for the lifetime of the configuration.
    fn init_params(&self, rng: &mut SimpleRng) -> ParamDict;

    /// Forward pass on `x` ([rows, input_dim] flat) with an explicit
    /// parameter override. Returns logits [rows, num_classes].
    ///
    /// `training` selects batch vs running statistics; `num_step` selects
    /// the per-step statistics slot; `backup_running_statistics` snapshots
    /// the running statistics so evaluation can restore them afterwards.
    fn forward(
        &mut self,
        tape: &mut Tape,
        x: &[f32],
        rows: usize,
        params: &TapeParams,
        training: bool,
        num_step: usize,
        backup_running_statistics: bool,
    ) -> Result<BufId, MetaError>;

    /// Restore running statistics from the backup taken at adaptation
    /// start. No-op for stateless backbones.
    fn restore_backup_stats(&mut self);

    fn input_dim(&self) -> usize;
    fn num_classes(&self) -> usize;
}

// ── NormReluClassifier ───────────────────────────────────────────────

/// Configuration for the reference backbone.
#[derive(Clone, Debug)]
pub struct BackboneConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    /// Number of per-step running-statistics slots (inner steps + 1).
    pub num_step_stats: usize,
    /// Running-statistics update momentum.
    pub momentum: f32,
    /// Variance floor added before the square root.
    pub eps: f32,
}

impl BackboneConfig {
    pub fn new(input_dim: usize, hidden_dim: usize, num_classes: usize, num_step_stats: usize) -> Self {
        BackboneConfig { input_dim, hidden_dim, num_classes, num_step_stats, momentum: 0.1, eps: 1e-5 }
    }
}

/// Reference backbone: linear → per-feature normalisation (per-step running
/// statistics, learnable gamma/beta) → ReLU → linear head.
///
/// Normalisation parameters carry the `norm.` prefix so the orchestrator
/// can exclude them from inner-loop adaptation.
pub struct NormReluClassifier {
    pub cfg: BackboneConfig,
    running_mean: Vec<Vec<f32>>,
    running_var: Vec<Vec<f32>>,
    backup: Option<(Vec<Vec<f32>>, Vec<Vec<f32>>)>,
}

impl NormReluClassifier {
    pub fn new(cfg: BackboneConfig) -> Self {
        let h = cfg.hidden_dim;
        let slots = cfg.num_step_stats.max(1);
        NormReluClassifier {
            cfg,
            running_mean: vec![vec![0.0; h]; slots],
            running_var: vec![vec![1.0; h]; slots],
            backup: None,
        }
    }

    fn lookup(params: &TapeParams, name: &str) -> Result<BufId, MetaError> {
        params.get(name).ok_or(MetaError::KeyMismatch {
            context: "backbone.forward",
            key: name.to_string(),
        })
    }
}

impl FunctionalBackbone for NormReluClassifier {
    fn init_params(&self, rng: &mut SimpleRng) -> ParamDict {
        let (i, h, c) = (self.cfg.input_dim, self.cfg.hidden_dim, self.cfg.num_classes);
        let mut dict = ParamDict::new();

        let w1_scale = (2.0 / (i + h) as f32).sqrt();
        let mut w1 = Tensor::zeros(&[h, i]);
        rng.fill_uniform(&mut w1.data, w1_scale);
        dict.insert("layer1.weight", w1);
        dict.insert("layer1.bias", Tensor::zeros(&[h]));

        dict.insert("norm.gamma", Tensor::full(&[h], 1.0));
        dict.insert("norm.beta", Tensor::zeros(&[h]));

        let w2_scale = (2.0 / (h + c) as f32).sqrt();
        let mut w2 = Tensor::zeros(&[c, h]);
        rng.fill_uniform(&mut w2.data, w2_scale);
        dict.insert("out.weight", w2);
        dict.insert("out.bias", Tensor::zeros(&[c]));

        dict
    }

    fn forward(
        &mut self,
        tape: &mut Tape,
        x: &[f32],
        rows: usize,
        params: &TapeParams,
        training: bool,
        num_step: usize,
        backup_running_statistics: bool,
    ) -> Result<BufId, MetaError> {
        let (i, h, c) = (self.cfg.input_dim, self.cfg.hidden_dim, self.cfg.num_classes);
        debug_assert_eq!(x.len(), rows * i);
        if num_step >= self.running_mean.len() {
            return Err(MetaError::StepOutOfRange { step: num_step, max: self.running_mean.len() - 1 });
        }

        let w1 = Self::lookup(params, "layer1.weight")?;
        let b1 = Self::lookup(params, "layer1.bias")?;
        let gamma = Self::lookup(params, "norm.gamma")?;
        let beta = Self::lookup(params, "norm.beta")?;
        let w2 = Self::lookup(params, "out.weight")?;
        let b2 = Self::lookup(params, "out.bias")?;

        if backup_running_statistics {
            self.backup = Some((self.running_mean.clone(), self.running_var.clone()));
        }

        let x_id = tape.constant(x.to_vec(), vec![rows, i]);
        let pre = traced::linear(tape, x_id, w1, b1, rows, i, h);

        // Normalisation: batch statistics while training (differentiable
        // through the activations), running statistics at evaluation.
        let (centered, inv_std) = if training {
            let mean = {
                let cs = traced::col_sum(tape, pre, rows, h);
                traced::scale(tape, cs, 1.0 / rows as f32)
            };
            let mean_b = traced::broadcast_rows(tape, mean, rows, h);
            let centered = traced::sub(tape, pre, mean_b);
            let var = {
                let sq = traced::mul(tape, centered, centered);
                let cs = traced::col_sum(tape, sq, rows, h);
                traced::scale(tape, cs, 1.0 / rows as f32)
            };

            // Running-statistics bookkeeping happens on plain values.
            let m = self.cfg.momentum;
            let batch_mean = tape.buf_data(mean).to_vec();
            let batch_var = tape.buf_data(var).to_vec();
            for (r, b) in self.running_mean[num_step].iter_mut().zip(batch_mean.iter()) {
                *r = (1.0 - m) * *r + m * b;
            }
            for (r, b) in self.running_var[num_step].iter_mut().zip(batch_var.iter()) {
                *r = (1.0 - m) * *r + m * b;
            }

            let eps_id = tape.constant(vec![self.cfg.eps; h], vec![h]);
            let var_eps = traced::add(tape, var, eps_id);
            let std = traced::sqrt(tape, var_eps);
            let inv = traced::recip(tape, std);
            (centered, inv)
        } else {
            let mean_id = tape.constant(self.running_mean[num_step].clone(), vec![h]);
            let var_id = tape.constant(self.running_var[num_step].clone(), vec![h]);
            let mean_b = traced::broadcast_rows(tape, mean_id, rows, h);
            let centered = traced::sub(tape, pre, mean_b);
            let eps_id = tape.constant(vec![self.cfg.eps; h], vec![h]);
            let var_eps = traced::add(tape, var_id, eps_id);
            let std = traced::sqrt(tape, var_eps);
            let inv = traced::recip(tape, std);
            (centered, inv)
        };

        let inv_b = traced::broadcast_rows(tape, inv_std, rows, h);
        let xhat = traced::mul(tape, centered, inv_b);
        let gamma_b = traced::broadcast_rows(tape, gamma, rows, h);
        let beta_b = traced::broadcast_rows(tape, beta, rows, h);
        let scaled = traced::mul(tape, xhat, gamma_b);
        let shifted = traced::add(tape, scaled, beta_b);
        let act = traced::relu(tape, shifted);

        Ok(traced::linear(tape, act, w2, b2, rows, h, c))
    }

    fn restore_backup_stats(&mut self) {
        if let Some((mean, var)) = self.backup.take() {
            self.running_mean = mean;
            self.running_var = var;
        }
    }

    fn input_dim(&self) -> usize {
        self.cfg.input_dim
    }

    fn num_classes(&self) -> usize {
        self.cfg.num_classes
    }
}

// ── LinearBackbone ───────────────────────────────────────────────────

/// Single linear layer, no statistics. Small enough that the whole
/// bi-level computation can be verified by hand; used heavily in tests.
pub struct LinearBackbone {
    pub input_dim: usize,
    pub num_classes: usize,
}

impl LinearBackbone {
    pub fn new(input_dim: usize, num_classes: usize) -> Self {
        LinearBackbone { input_dim, num_classes }
    }
}

impl FunctionalBackbone for LinearBackbone {
    fn init_params(&self, rng: &mut SimpleRng) -> ParamDict {
        let (i, c) = (self.input_dim, self.num_classes);
        let mut dict = ParamDict::new();
        let scale = (2.0 / (i + c) as f32).sqrt();
        let mut w = Tensor::zeros(&[c, i]);
        rng.fill_uniform(&mut w.data, scale);
        dict.insert("out.weight", w);
        dict.insert("out.bias", Tensor::zeros(&[c]));
        dict
    }

    fn forward(
        &mut self,
        tape: &mut Tape,
        x: &[f32],
        rows: usize,
        params: &TapeParams,
        _training: bool,
        _num_step: usize,
        _backup_running_statistics: bool,
    ) -> Result<BufId, MetaError> {
        let (i, c) = (self.input_dim, self.num_classes);
        debug_assert_eq!(x.len(), rows * i);
        let w = params.get("out.weight").ok_or(MetaError::KeyMismatch {
            context: "backbone.forward",
            key: "out.weight".to_string(),
        })?;
        let b = params.get("out.bias").ok_or(MetaError::KeyMismatch {
            context: "backbone.forward",
            key: "out.bias".to_string(),
        })?;
        let x_id = tape.constant(x.to_vec(), vec![rows, i]);
        Ok(traced::linear(tape, x_id, w, b, rows, i, c))
    }

    fn restore_backup_stats(&mut self) {}

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
