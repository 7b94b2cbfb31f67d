/// Layer-wise, step-wise learned gradient descent — the inner-loop update
/// rule.
///
/// For every adapted parameter the store holds one learnable scalar per
/// inner step (indices 0..=num_steps). Two modes:
///
///   plain:  w' = w − lr[s]·g
///   ALFA:   w' = (1 − β_gen·β[s])·w − α_gen·α[s]·g
///           (+ a per-parameter-shaped decay tensor in random-init mode:
///            w' = (1 − β_pp·β_gen·β[s])·w − α_gen·α[s]·g)
///
/// Updates are recorded on the tape and never mutate their inputs, so the
/// outer loss can differentiate through an arbitrary number of steps.

use tracing::warn;

use crate::params::{MetaError, ParamDict};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;
use crate::traced::{self, TapeParams};

/// Inner-loop update-rule configuration.
#[derive(Clone, Debug)]
pub struct LslrConfig {
    /// Tables carry `num_steps + 1` entries, indexed by step 0..=num_steps.
    pub num_steps: usize,
    pub init_learning_rate: f32,
    pub init_weight_decay: f32,
    /// ALFA mode: per-task generated alpha/beta modulation.
    pub alfa: bool,
    /// ALFA random-init mode: adds a per-parameter-shaped decay tensor.
    pub random_init: bool,
}

/// Learnable per-step tables, one entry per adapted parameter name.
/// Persist across tasks and outer iterations; mutated only by the outer
/// optimizer.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LslrTables {
    /// Per-step learning rates (the plain-mode lr table, or ALFA alpha).
    pub alpha: ParamDict,
    /// Per-step weight-decay coefficients (ALFA only, empty otherwise).
    pub beta: ParamDict,
    /// Per-parameter-shaped decay tensors (ALFA random-init only).
    pub beta_per_param: ParamDict,
}

/// Per-task alpha/beta modulation produced by the update-rule generator.
/// One scalar buffer per parameter name; consumed once, then discarded.
#[derive(Clone, Debug, Default)]
pub struct Generated {
    pub alpha: TapeParams,
    pub beta: TapeParams,
}

/// Create the tables for every parameter in `names_weights`.
pub fn initialise(cfg: &LslrConfig, names_weights: &ParamDict) -> LslrTables {
    let steps = cfg.num_steps + 1;
    let mut tables = LslrTables::default();

    for (name, param) in names_weights.iter() {
        tables.alpha.insert(name, Tensor::full(&[steps], cfg.init_learning_rate));
        if cfg.alfa {
            if cfg.random_init {
                tables
                    .beta_per_param
                    .insert(name, Tensor::full(&param.shape, cfg.init_weight_decay * cfg.init_learning_rate));
                tables.beta.insert(name, Tensor::full(&[steps], 1.0));
            } else {
                tables
                    .beta
                    .insert(name, Tensor::full(&[steps], cfg.init_weight_decay * cfg.init_learning_rate));
            }
        }
    }
    tables
}

/// Tape-registered view of the tables.
#[derive(Clone, Debug, Default)]
pub struct LslrTableIds {
    pub alpha: TapeParams,
    pub beta: TapeParams,
    pub beta_per_param: TapeParams,
}

impl LslrTableIds {
    pub fn register(tape: &mut Tape, tables: &LslrTables) -> Self {
        LslrTableIds {
            alpha: TapeParams::register(tape, &tables.alpha),
            beta: TapeParams::register(tape, &tables.beta),
            beta_per_param: TapeParams::register(tape, &tables.beta_per_param),
        }
    }
}

/// Apply one differentiable inner-loop step to every parameter.
///
/// `grads` is aligned with `weights` iteration order; a `None` entry is the
/// recoverable missing-gradient condition — logged, and that parameter is
/// carried through unchanged for this step only. Step indices outside the
/// table range and key-set mismatches are contract violations.
pub fn update_params(
    tape: &mut Tape,
    cfg: &LslrConfig,
    weights: &TapeParams,
    grads: &[Option<BufId>],
    tables: &LslrTableIds,
    generated: Option<&Generated>,
    step: usize,
) -> Result<TapeParams, MetaError> {
    if step > cfg.num_steps {
        return Err(MetaError::StepOutOfRange { step, max: cfg.num_steps });
    }
    if grads.len() != weights.len() {
        return Err(MetaError::KeyMismatch {
            context: "lslr.update_params",
            key: format!("{} weights vs {} gradients", weights.len(), grads.len()),
        });
    }
    if cfg.alfa && generated.is_none() {
        return Err(MetaError::InvalidConfig {
            detail: "ALFA mode requires generated alpha/beta modulation".to_string(),
        });
    }

    let table_len = cfg.num_steps + 1;
    let mut updated = TapeParams::new();

    for ((name, w), grad) in weights.iter().zip(grads.iter()) {
        let g = match grad {
            Some(g) => *g,
            None => {
                warn!(parameter = name, step, "no gradient for inner-loop parameter; update skipped");
                updated.insert(name, w);
                continue;
            }
        };

        let alpha_table = tables.alpha.get(name).ok_or(MetaError::KeyMismatch {
            context: "lslr.update_params",
            key: name.to_string(),
        })?;
        let n = tape.buf_numel(w);

        let next = if cfg.alfa {
            let generated = generated.expect("checked above");
            let a_gen = generated.alpha.get(name).ok_or(MetaError::KeyMismatch {
                context: "lslr.update_params (generated alpha)",
                key: name.to_string(),
            })?;
            let b_gen = generated.beta.get(name).ok_or(MetaError::KeyMismatch {
                context: "lslr.update_params (generated beta)",
                key: name.to_string(),
            })?;
            let beta_table = tables.beta.get(name).ok_or(MetaError::KeyMismatch {
                context: "lslr.update_params (beta table)",
                key: name.to_string(),
            })?;

            // α_gen·α[s]·g
            let alpha_s = traced::slice(tape, alpha_table, step, 1, table_len);
            let eff_alpha = traced::mul(tape, a_gen, alpha_s);
            let alpha_b = traced::broadcast_all(tape, eff_alpha, n);
            let lr_term = traced::mul(tape, alpha_b, g);

            // β_gen·β[s]
            let beta_s = traced::slice(tape, beta_table, step, 1, table_len);
            let eff_beta = traced::mul(tape, b_gen, beta_s);

            let retained = if cfg.random_init {
                // (1 − β_pp·β_gen·β[s])·w
                let beta_pp = tables.beta_per_param.get(name).ok_or(MetaError::KeyMismatch {
                    context: "lslr.update_params (per-param decay)",
                    key: name.to_string(),
                })?;
                let beta_b = traced::broadcast_all(tape, eff_beta, n);
                let decay = traced::mul(tape, beta_pp, beta_b);
                let ones = tape.constant(vec![1.0; n], tape.buf_shape(w).to_vec());
                let retain = traced::sub(tape, ones, decay);
                traced::mul(tape, retain, w)
            } else {
                // (1 − β_gen·β[s])·w
                let one = tape.constant(vec![1.0], vec![1]);
                let retain = traced::sub(tape, one, eff_beta);
                let retain_b = traced::broadcast_all(tape, retain, n);
                traced::mul(tape, retain_b, w)
            };

            traced::sub(tape, retained, lr_term)
        } else {
            // w − lr[s]·g
            let lr_s = traced::slice(tape, alpha_table, step, 1, table_len);
            let lr_b = traced::broadcast_all(tape, lr_s, n);
            let lr_term = traced::mul(tape, lr_b, g);
            traced::sub(tape, w, lr_term)
        };
        updated.insert(name, next);
    }

    Ok(updated)
}
