/// Gradient verification utilities.
///
/// Central finite differences of the training batch loss over individual
/// meta-parameter scalars, used by tests to verify the analytic outer
/// gradients in both first-order and second-order modes.

use crate::backbone::FunctionalBackbone;
use crate::learner::{MetaLearner, TaskBatch};
use crate::params::MetaError;

/// Central-difference gradient of the mean batch loss with respect to one
/// scalar meta-parameter: (f(x+eps) - f(x-eps)) / (2*eps).
///
/// The learner's parameters are restored exactly before returning.
pub fn finite_diff_meta_grad<B: FunctionalBackbone>(
    learner: &mut MetaLearner<B>,
    batch: &TaskBatch,
    epoch: usize,
    group: &str,
    name: &str,
    idx: usize,
    eps: f32,
) -> Result<f32, MetaError> {
    let orig = read_scalar(learner, group, name, idx)?;

    write_scalar(learner, group, name, idx, orig + eps)?;
    let loss_plus = learner.training_batch_loss(batch, epoch)?;

    write_scalar(learner, group, name, idx, orig - eps)?;
    let loss_minus = learner.training_batch_loss(batch, epoch)?;

    write_scalar(learner, group, name, idx, orig)?;
    Ok((loss_plus - loss_minus) / (2.0 * eps))
}

fn read_scalar<B: FunctionalBackbone>(
    learner: &MetaLearner<B>,
    group: &str,
    name: &str,
    idx: usize,
) -> Result<f32, MetaError> {
    let tensor = learner.params.group(group).get(name).ok_or(MetaError::KeyMismatch {
        context: "finite_diff_meta_grad",
        key: format!("{group}/{name}"),
    })?;
    tensor.data.get(idx).copied().ok_or(MetaError::KeyMismatch {
        context: "finite_diff_meta_grad",
        key: format!("{group}/{name}[{idx}]"),
    })
}

fn write_scalar<B: FunctionalBackbone>(
    learner: &mut MetaLearner<B>,
    group: &str,
    name: &str,
    idx: usize,
    value: f32,
) -> Result<(), MetaError> {
    let tensor = learner.params.group_mut(group).get_mut(name).ok_or(MetaError::KeyMismatch {
        context: "finite_diff_meta_grad",
        key: format!("{group}/{name}"),
    })?;
    tensor.data[idx] = value;
    Ok(())
}
