/// Adam optimizer for the outer loop.
///
/// Maintains one pair of moment buffers per meta-parameter tensor, in the
/// stable group order of `MetaParams`. Gradients from all tasks in a batch
/// are accumulated before `step` is called — exactly one optimizer step
/// per outer iteration, gated on the last task having contributed.

use crate::model::{MetaParams, META_PARAM_GROUPS};

/// Adam hyperparameters.
#[derive(Clone, Debug)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig { beta1: 0.9, beta2: 0.999, eps: 1e-8 }
    }
}

/// Moment buffers for a single parameter tensor.
#[derive(Clone)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

/// Core Adam step on a single (params, grads, m, v) group.
///
/// Modifies params, m, v in place. Uses pre-computed bias correction inverses.
#[inline]
fn adam_step_buf(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    bc1_inv: f32,
    bc2_inv: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
        let m_hat = m[i] * bc1_inv;
        let v_hat = v[i] * bc2_inv;
        params[i] -= lr * m_hat / (v_hat.sqrt() + eps);
    }
}

/// Adam state over the whole meta-parameter collection.
pub struct MetaAdam {
    pub config: AdamConfig,
    bufs: Vec<MomentBuf>,
    step: u32,
}

impl MetaAdam {
    /// Create optimizer state from the MetaParams shapes.
    pub fn new(params: &MetaParams, config: AdamConfig) -> Self {
        let mut bufs = Vec::new();
        for g in META_PARAM_GROUPS {
            for (_, t) in params.group(g).iter() {
                bufs.push(MomentBuf::zeros(t.numel()));
            }
        }
        MetaAdam { config, bufs, step: 0 }
    }

    /// One Adam step over every tensor. `grads` must share the params'
    /// structure (it is always built by `MetaParams::zeros_like`).
    pub fn step(&mut self, params: &mut MetaParams, grads: &MetaParams, lr: f32) {
        let c = self.config.clone();
        self.step += 1;
        let t = self.step as f32;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));

        let mut idx = 0;
        for g in META_PARAM_GROUPS {
            let grads_dict = grads.group(g);
            for ((_, p), (_, gr)) in params.group_mut(g).iter_mut().zip(grads_dict.iter()) {
                let buf = &mut self.bufs[idx];
                adam_step_buf(
                    &mut p.data, &gr.data, &mut buf.m, &mut buf.v,
                    lr, c.beta1, c.beta2, c.eps, bc1_inv, bc2_inv,
                );
                idx += 1;
            }
        }
    }

    pub fn step_count(&self) -> u32 {
        self.step
    }
}

/// Cosine annealing with linear warmup.
///
/// Returns the learning rate for the given step (the trainer passes the
/// epoch index with no warmup, matching cosine annealing over epochs).
pub fn cosine_lr(step: u32, warmup_steps: u32, total_steps: u32, lr_peak: f32, lr_min: f32) -> f32 {
    if step < warmup_steps {
        return lr_peak * step as f32 / warmup_steps.max(1) as f32;
    }
    let progress =
        (step - warmup_steps) as f32 / total_steps.saturating_sub(warmup_steps).max(1) as f32;
    let progress = progress.min(1.0);
    lr_min + 0.5 * (lr_peak - lr_min) * (1.0 + (std::f32::consts::PI * progress).cos())
}
