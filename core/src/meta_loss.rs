/// Adaptive loss network and its per-step parameter adapter.
///
/// The loss network is a small per-step MLP (`in → in → 1`, ReLU) scoring a
/// normalized per-instance task-state matrix; the mean over instances is
/// its scalar loss. The adapter remaps the loss network's parameters for
/// the current step from a normalized task-state vector: one gating scalar
/// per loss-network tensor, applied as the residual transform
/// `t' = (1 + g)·t`.
///
/// Two independent instances exist: one on the support set (labels known,
/// one-hot in the state) and one on the query set (labels unknown,
/// predictive entropy in the state). Every state vector or matrix is
/// standardized immediately before use, fresh per step per task.

use crate::params::{MetaError, ParamDict};
use crate::tape::{BufId, Tape};
use crate::tensor::{self, SimpleRng, Tensor};
use crate::traced::{self, TapeParams};

/// Epsilon for task-state standardization.
pub const STATE_EPS: f32 = 1e-12;

/// Per-step tensors of one loss network, in adaptation order.
pub const LOSS_NET_TENSORS: [&str; 4] = ["w1", "b1", "w2", "b2"];

/// State dimensionality of the support-set loss network:
/// task state (L + 1) broadcast, predictions (N), one-hot label (N).
pub fn support_state_dim(num_layers: usize, num_classes: usize) -> usize {
    num_layers + 2 * num_classes + 1
}

/// State dimensionality of the support-set adapter: support loss + L means.
pub fn support_adapter_dim(num_layers: usize) -> usize {
    num_layers + 1
}

/// State dimensionality of the query-set loss network and adapter:
/// parameter means (L), predictions (N), entropy (1).
pub fn query_state_dim(num_layers: usize, num_classes: usize) -> usize {
    num_layers + num_classes + 1
}

/// Build per-step loss-network parameters: `step{s}.w1` … for s in 0..steps.
pub fn loss_net_init(input_dim: usize, num_steps: usize, rng: &mut SimpleRng) -> ParamDict {
    let scale = (1.0 / input_dim.max(1) as f32).sqrt();
    let mut dict = ParamDict::new();
    for s in 0..num_steps {
        let mut w1 = Tensor::zeros(&[input_dim, input_dim]);
        rng.fill_uniform(&mut w1.data, scale);
        dict.insert(format!("step{s}.w1"), w1);
        dict.insert(format!("step{s}.b1"), Tensor::zeros(&[input_dim]));

        let mut w2 = Tensor::zeros(&[1, input_dim]);
        rng.fill_uniform(&mut w2.data, scale);
        dict.insert(format!("step{s}.w2"), w2);
        dict.insert(format!("step{s}.b2"), Tensor::zeros(&[1]));
    }
    dict
}

/// Build per-step adapter parameters. The adapter maps its state vector to
/// one gating scalar per loss-network tensor.
pub fn adapter_init(input_dim: usize, num_steps: usize, rng: &mut SimpleRng) -> ParamDict {
    let targets = LOSS_NET_TENSORS.len();
    let scale = (1.0 / input_dim.max(1) as f32).sqrt();
    let mut dict = ParamDict::new();
    for s in 0..num_steps {
        let mut w1 = Tensor::zeros(&[input_dim, input_dim]);
        rng.fill_uniform(&mut w1.data, scale);
        dict.insert(format!("step{s}.w1"), w1);
        dict.insert(format!("step{s}.b1"), Tensor::zeros(&[input_dim]));

        // Zero-init head: the adapter starts as the identity transform.
        dict.insert(format!("step{s}.w2"), Tensor::zeros(&[targets, input_dim]));
        dict.insert(format!("step{s}.b2"), Tensor::zeros(&[targets]));
    }
    dict
}

/// Select the `step{s}.` slice of a per-step dict, stripping the prefix.
pub fn step_view(params: &TapeParams, step: usize) -> Result<TapeParams, MetaError> {
    let prefix = format!("step{step}.");
    let mut out = TapeParams::new();
    for (name, id) in params.iter() {
        if let Some(rest) = name.strip_prefix(&prefix) {
            out.insert(rest, id);
        }
    }
    if out.is_empty() {
        let steps = params.len() / LOSS_NET_TENSORS.len();
        return Err(MetaError::StepOutOfRange { step, max: steps.saturating_sub(1) });
    }
    Ok(out)
}

fn lookup(params: &TapeParams, name: &str, context: &'static str) -> Result<BufId, MetaError> {
    params.get(name).ok_or(MetaError::KeyMismatch { context, key: name.to_string() })
}

/// Adapter forward: gating scalars from the normalized state vector, then
/// `t' = (1 + g)·t` over the step's loss-network tensors.
pub fn adapt_loss_params(
    tape: &mut Tape,
    adapter_step: &TapeParams,
    state: BufId,
    state_dim: usize,
    loss_step: &TapeParams,
) -> Result<TapeParams, MetaError> {
    let w1 = lookup(adapter_step, "w1", "meta_loss.adapt")?;
    let b1 = lookup(adapter_step, "b1", "meta_loss.adapt")?;
    let w2 = lookup(adapter_step, "w2", "meta_loss.adapt")?;
    let b2 = lookup(adapter_step, "b2", "meta_loss.adapt")?;
    let targets = LOSS_NET_TENSORS.len();

    let hidden = traced::linear(tape, state, w1, b1, 1, state_dim, state_dim);
    let hidden = traced::relu(tape, hidden);
    let gates = traced::linear(tape, hidden, w2, b2, 1, state_dim, targets);

    let mut adapted = TapeParams::new();
    for (idx, tensor_name) in LOSS_NET_TENSORS.iter().enumerate() {
        let t = lookup(loss_step, tensor_name, "meta_loss.adapt (loss tensor)")?;
        let n = tape.buf_numel(t);
        let g = traced::slice(tape, gates, idx, 1, targets);
        let one = tape.constant(vec![1.0], vec![1]);
        let gain = traced::add(tape, one, g);
        let gain_b = traced::broadcast_all(tape, gain, n);
        adapted.insert(*tensor_name, traced::mul(tape, gain_b, t));
    }
    Ok(adapted)
}

/// Loss-network forward on a [rows, dim] state matrix → scalar [1].
pub fn loss_net_forward(
    tape: &mut Tape,
    loss_step: &TapeParams,
    state_matrix: BufId,
    rows: usize,
    dim: usize,
) -> Result<BufId, MetaError> {
    let w1 = lookup(loss_step, "w1", "meta_loss.forward")?;
    let b1 = lookup(loss_step, "b1", "meta_loss.forward")?;
    let w2 = lookup(loss_step, "w2", "meta_loss.forward")?;
    let b2 = lookup(loss_step, "b2", "meta_loss.forward")?;

    let hidden = traced::linear(tape, state_matrix, w1, b1, rows, dim, dim);
    let hidden = traced::relu(tape, hidden);
    let scores = traced::linear(tape, hidden, w2, b2, rows, dim, 1);
    Ok(traced::mean_all(tape, scores))
}

/// Support-side meta-loss for one inner step.
///
/// Task state = [support CE loss | per-layer parameter means], standardized
/// for the adapter; the per-instance matrix appends predictions and the
/// one-hot label before its own standardization.
#[allow(clippy::too_many_arguments)]
pub fn support_meta_loss(
    tape: &mut Tape,
    loss_params: &TapeParams,
    adapter_params: &TapeParams,
    step: usize,
    weights: &TapeParams,
    support_loss: BufId,
    support_preds: BufId,
    support_y: &[usize],
    num_classes: usize,
) -> Result<BufId, MetaError> {
    let rows = support_y.len();
    let num_layers = weights.len();
    let state_dim = support_state_dim(num_layers, num_classes);
    let adapter_dim = support_adapter_dim(num_layers);

    // Task-state vector: support loss, then per-layer means.
    let mut parts = vec![support_loss];
    for (_, w) in weights.iter() {
        parts.push(traced::mean_all(tape, w));
    }
    let task_state = traced::concat(tape, &parts);

    let adapter_state = traced::standardize(tape, task_state, STATE_EPS);
    let loss_step = step_view(loss_params, step)?;
    let adapter_step = step_view(adapter_params, step)?;
    let adapted = adapt_loss_params(tape, &adapter_step, adapter_state, adapter_dim, &loss_step)?;

    // Per-instance state matrix: [task state | predictions | one-hot y].
    let state_rows = traced::broadcast_rows(tape, task_state, rows, adapter_dim);
    let mut onehot = vec![0.0f32; rows * num_classes];
    tensor::one_hot_f32(support_y, num_classes, &mut onehot);
    let onehot_id = tape.constant(onehot, vec![rows, num_classes]);
    let matrix = traced::concat_cols(
        tape,
        &[state_rows, support_preds, onehot_id],
        rows,
        &[adapter_dim, num_classes, num_classes],
    );
    let matrix = traced::standardize(tape, matrix, STATE_EPS);

    loss_net_forward(tape, &adapted, matrix, rows, state_dim)
}

/// Query-side meta-loss for one inner step.
///
/// Labels are unknown here: the per-instance statistic is the predictive
/// entropy term Σ p·log p. The adapter consumes the standardized matrix's
/// column means.
pub fn query_meta_loss(
    tape: &mut Tape,
    loss_params: &TapeParams,
    adapter_params: &TapeParams,
    step: usize,
    weights: &TapeParams,
    query_preds: BufId,
    num_query: usize,
    num_classes: usize,
) -> Result<BufId, MetaError> {
    let num_layers = weights.len();
    let state_dim = query_state_dim(num_layers, num_classes);

    let mut parts = Vec::with_capacity(num_layers);
    for (_, w) in weights.iter() {
        parts.push(traced::mean_all(tape, w));
    }
    let task_state = traced::concat(tape, &parts);

    let entropy = traced::row_neg_entropy(tape, query_preds, num_query, num_classes);
    let state_rows = traced::broadcast_rows(tape, task_state, num_query, num_layers);
    let matrix = traced::concat_cols(
        tape,
        &[state_rows, query_preds, entropy],
        num_query,
        &[num_layers, num_classes, 1],
    );
    let matrix = traced::standardize(tape, matrix, STATE_EPS);

    // Adapter state: column means of the standardized matrix.
    let col_means = {
        let cs = traced::col_sum(tape, matrix, num_query, state_dim);
        traced::scale(tape, cs, 1.0 / num_query.max(1) as f32)
    };

    let loss_step = step_view(loss_params, step)?;
    let adapter_step = step_view(adapter_params, step)?;
    let adapted = adapt_loss_params(tape, &adapter_step, col_means, state_dim, &loss_step)?;

    loss_net_forward(tape, &adapted, matrix, num_query, state_dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::Tape;

    const L: usize = 2;
    const N: usize = 2;

    fn weight_view(tape: &mut Tape) -> TapeParams {
        let mut dict = ParamDict::new();
        dict.insert("out.weight", Tensor::full(&[N, 3], 0.2));
        dict.insert("out.bias", Tensor::zeros(&[N]));
        TapeParams::register(tape, &dict)
    }

    fn support_setup(tape: &mut Tape) -> (TapeParams, TapeParams) {
        let mut rng = SimpleRng::new(11);
        let ml = loss_net_init(support_state_dim(L, N), 3, &mut rng);
        let ad = adapter_init(support_adapter_dim(L), 3, &mut rng);
        (TapeParams::register(tape, &ml), TapeParams::register(tape, &ad))
    }

    fn query_setup(tape: &mut Tape) -> (TapeParams, TapeParams) {
        let mut rng = SimpleRng::new(13);
        let dim = query_state_dim(L, N);
        let ml = loss_net_init(dim, 3, &mut rng);
        let ad = adapter_init(dim, 3, &mut rng);
        (TapeParams::register(tape, &ml), TapeParams::register(tape, &ad))
    }

    #[test]
    fn test_state_dims() {
        assert_eq!(support_state_dim(4, 5), 4 + 10 + 1);
        assert_eq!(support_adapter_dim(4), 5);
        assert_eq!(query_state_dim(4, 5), 4 + 5 + 1);
    }

    #[test]
    fn test_loss_net_per_step_names() {
        let mut rng = SimpleRng::new(1);
        let dict = loss_net_init(3, 2, &mut rng);
        assert_eq!(dict.len(), 8);
        assert!(dict.contains("step0.w1"));
        assert!(dict.contains("step1.b2"));
        assert_eq!(dict.get("step0.w2").unwrap().shape, vec![1, 3]);
    }

    #[test]
    fn test_step_view_strips_prefix_and_bounds() {
        let mut tape = Tape::new();
        let mut rng = SimpleRng::new(1);
        let dict = loss_net_init(3, 2, &mut rng);
        let ids = TapeParams::register(&mut tape, &dict);
        let view = step_view(&ids, 1).unwrap();
        assert_eq!(view.len(), 4);
        assert!(view.get("w1").is_some());
        let err = step_view(&ids, 7).unwrap_err();
        assert!(matches!(err, MetaError::StepOutOfRange { .. }));
    }

    #[test]
    fn test_zero_adapter_head_is_identity() {
        // adapter w2/b2 start at zero, so gains are 1 and t' == t.
        let mut tape = Tape::new();
        let mut rng = SimpleRng::new(3);
        let dim = support_adapter_dim(L);
        let loss_dict = loss_net_init(support_state_dim(L, N), 1, &mut rng);
        let adapter_dict = adapter_init(dim, 1, &mut rng);
        let loss_ids = TapeParams::register(&mut tape, &loss_dict);
        let adapter_ids = TapeParams::register(&mut tape, &adapter_dict);

        let state = tape.constant(vec![0.3; dim], vec![dim]);
        let loss_step = step_view(&loss_ids, 0).unwrap();
        let adapter_step = step_view(&adapter_ids, 0).unwrap();
        let adapted = adapt_loss_params(&mut tape, &adapter_step, state, dim, &loss_step).unwrap();
        for name in LOSS_NET_TENSORS {
            let orig = tape.buf_data(loss_step.get(name).unwrap()).to_vec();
            let new = tape.buf_data(adapted.get(name).unwrap()).to_vec();
            for (o, n) in orig.iter().zip(new.iter()) {
                assert!((o - n).abs() < 1e-6, "zero-init adapter must be the identity");
            }
        }
    }

    #[test]
    fn test_support_meta_loss_finite() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let (ml, ad) = support_setup(&mut tape);
        let support_loss = tape.constant(vec![0.7], vec![1]);
        let preds = tape.constant(vec![0.2, -0.4, 0.9, 0.1], vec![2, N]);
        let loss =
            support_meta_loss(&mut tape, &ml, &ad, 0, &weights, support_loss, preds, &[0, 1], N)
                .unwrap();
        assert_eq!(tape.buf_numel(loss), 1);
        assert!(tape.buf_data(loss)[0].is_finite());
    }

    #[test]
    fn test_query_meta_loss_finite_per_step() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let (ml, ad) = query_setup(&mut tape);
        let preds = tape.constant(vec![0.2, -0.4, 0.9, 0.1, 0.0, 0.3], vec![3, N]);
        let l0 = query_meta_loss(&mut tape, &ml, &ad, 0, &weights, preds, 3, N).unwrap();
        let l1 = query_meta_loss(&mut tape, &ml, &ad, 1, &weights, preds, 3, N).unwrap();
        assert!(tape.buf_data(l0)[0].is_finite());
        assert!(tape.buf_data(l1)[0].is_finite());
        // Each step evaluates with its own parameter set.
        let w0 = tape.buf_data(ml.get("step0.w1").unwrap()).to_vec();
        let w1 = tape.buf_data(ml.get("step1.w1").unwrap()).to_vec();
        assert_ne!(w0, w1, "per-step loss-net parameters are independent");
    }

    #[test]
    fn test_constant_state_stays_bounded() {
        // Zero-variance task state must not produce NaN/Inf anywhere.
        let mut tape = Tape::new();
        let mut dict = ParamDict::new();
        dict.insert("a", Tensor::full(&[2], 0.5));
        dict.insert("b", Tensor::full(&[2], 0.5));
        let weights = TapeParams::register(&mut tape, &dict);
        let (ml, ad) = support_setup(&mut tape);
        let support_loss = tape.constant(vec![0.5], vec![1]);
        let preds = tape.constant(vec![0.5; 2 * N], vec![2, N]);
        let loss =
            support_meta_loss(&mut tape, &ml, &ad, 0, &weights, support_loss, preds, &[0, 0], N)
                .unwrap();
        assert!(tape.buf_data(loss)[0].is_finite());
    }

    #[test]
    fn test_loss_params_receive_gradients() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let (ml, ad) = support_setup(&mut tape);
        let support_loss = tape.constant(vec![0.7], vec![1]);
        let preds = tape.constant(vec![0.2, -0.4, 0.9, 0.1], vec![2, N]);
        let loss =
            support_meta_loss(&mut tape, &ml, &ad, 0, &weights, support_loss, preds, &[0, 1], N)
                .unwrap();
        let w1 = ml.get("step0.w1").unwrap();
        let aw1 = ad.get("step0.w1").unwrap();
        let grads = tape.grad(loss, &[w1, aw1], false);
        assert!(grads[0].is_some(), "loss-net weights must receive gradients");
        assert!(grads[1].is_some(), "adapter weights must receive gradients");
    }
}
