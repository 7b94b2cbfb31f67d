/// Task-conditioned update-rule generator.
///
/// A two-layer feed-forward map from the per-step task embedding — the
/// per-layer mean weight values followed by the per-layer mean gradients,
/// concatenated in parameter order (length 2L) — to per-layer alpha and
/// beta modulation scalars (length 2L, split in halves). Recomputed every
/// inner step; no state beyond its own meta-learned weights.

use crate::params::{MetaError, ParamDict};
use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};
use crate::traced::{self, TapeParams};
use crate::lslr::Generated;

/// Build the generator's parameter dict for `num_layers` adapted layers.
pub fn init_params(num_layers: usize, rng: &mut SimpleRng) -> ParamDict {
    let d = 2 * num_layers;
    let scale = (1.0 / d as f32).sqrt();
    let mut dict = ParamDict::new();

    let mut w1 = Tensor::zeros(&[d, d]);
    rng.fill_uniform(&mut w1.data, scale);
    dict.insert("w1", w1);
    dict.insert("b1", Tensor::zeros(&[d]));

    let mut w2 = Tensor::zeros(&[d, d]);
    rng.fill_uniform(&mut w2.data, scale);
    dict.insert("w2", w2);
    dict.insert("b2", Tensor::zeros(&[d]));

    dict
}

/// Run the generator for one inner step.
///
/// `grads` is aligned with `weights` iteration order; a missing gradient
/// contributes a zero mean to the embedding (its update is skipped by the
/// update rule anyway).
pub fn generate(
    tape: &mut Tape,
    gen_params: &TapeParams,
    weights: &TapeParams,
    grads: &[Option<BufId>],
) -> Result<Generated, MetaError> {
    let num_layers = weights.len();
    if grads.len() != num_layers {
        return Err(MetaError::KeyMismatch {
            context: "alfa.generate",
            key: format!("{} weights vs {} gradients", num_layers, grads.len()),
        });
    }
    let d = 2 * num_layers;

    let w1 = lookup(gen_params, "w1")?;
    let b1 = lookup(gen_params, "b1")?;
    let w2 = lookup(gen_params, "w2")?;
    let b2 = lookup(gen_params, "b2")?;

    // Task embedding: per-layer mean weight, then per-layer mean gradient.
    let mut parts: Vec<BufId> = Vec::with_capacity(d);
    for (_, w) in weights.iter() {
        parts.push(traced::mean_all(tape, w));
    }
    for g in grads.iter() {
        match g {
            Some(g) => parts.push(traced::mean_all(tape, *g)),
            None => parts.push(tape.constant(vec![0.0], vec![1])),
        }
    }
    let embedding = traced::concat(tape, &parts);

    // linear → ReLU → linear on the [1, 2L] embedding row.
    let hidden = traced::linear(tape, embedding, w1, b1, 1, d, d);
    let hidden = traced::relu(tape, hidden);
    let out = traced::linear(tape, hidden, w2, b2, 1, d, d);

    // Split halves: per-layer alpha, then per-layer beta.
    let mut generated = Generated::default();
    for (idx, (name, _)) in weights.iter().enumerate() {
        let alpha = traced::slice(tape, out, idx, 1, d);
        let beta = traced::slice(tape, out, num_layers + idx, 1, d);
        generated.alpha.insert(name, alpha);
        generated.beta.insert(name, beta);
    }
    Ok(generated)
}

fn lookup(params: &TapeParams, name: &str) -> Result<BufId, MetaError> {
    params.get(name).ok_or(MetaError::KeyMismatch {
        context: "alfa.generate",
        key: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::Tape;

    fn weight_view(tape: &mut Tape) -> TapeParams {
        let mut dict = ParamDict::new();
        dict.insert("layer1.weight", Tensor::full(&[2, 2], 0.5));
        dict.insert("out.weight", Tensor::full(&[2], -1.0));
        TapeParams::register(tape, &dict)
    }

    fn const_grads(tape: &mut Tape, weights: &TapeParams, value: f32) -> Vec<Option<BufId>> {
        weights
            .iter()
            .map(|(_, id)| {
                let n = tape.buf_numel(id);
                Some(tape.constant(vec![value; n], tape.buf_shape(id).to_vec()))
            })
            .collect()
    }

    #[test]
    fn test_init_param_shapes() {
        let mut rng = SimpleRng::new(5);
        let p = init_params(3, &mut rng);
        assert_eq!(p.get("w1").unwrap().shape, vec![6, 6]);
        assert_eq!(p.get("b1").unwrap().shape, vec![6]);
        assert_eq!(p.get("w2").unwrap().shape, vec![6, 6]);
        assert_eq!(p.get("b2").unwrap().shape, vec![6]);
    }

    #[test]
    fn test_generate_one_scalar_per_layer() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let grads = const_grads(&mut tape, &weights, 0.1);
        let mut rng = SimpleRng::new(5);
        let gen_dict = init_params(weights.len(), &mut rng);
        let gen_ids = TapeParams::register(&mut tape, &gen_dict);

        let generated = generate(&mut tape, &gen_ids, &weights, &grads).unwrap();
        assert_eq!(generated.alpha.len(), 2);
        assert_eq!(generated.beta.len(), 2);
        for (_, id) in generated.alpha.iter().chain(generated.beta.iter()) {
            assert_eq!(tape.buf_numel(id), 1);
            assert!(tape.buf_data(id)[0].is_finite());
        }
    }

    #[test]
    fn test_generate_deterministic_and_input_sensitive() {
        // Hand-built generator: identity layers with a +1 hidden bias, so the
        // output is relu(embedding + 1) and every entry is easy to predict.
        let identity4 = Tensor::from_vec(
            vec![
                1.0, 0.0, 0.0, 0.0,
                0.0, 1.0, 0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
            &[4, 4],
        );
        let run = |gval: f32| {
            let mut tape = Tape::new();
            let weights = weight_view(&mut tape);
            let grads = const_grads(&mut tape, &weights, gval);
            let mut gen_dict = ParamDict::new();
            gen_dict.insert("w1", identity4.clone());
            gen_dict.insert("b1", Tensor::full(&[4], 1.0));
            gen_dict.insert("w2", identity4.clone());
            gen_dict.insert("b2", Tensor::zeros(&[4]));
            let gen_ids = TapeParams::register(&mut tape, &gen_dict);
            let generated = generate(&mut tape, &gen_ids, &weights, &grads).unwrap();
            // beta of the first layer sits at embedding index L+0 = the
            // first gradient mean.
            let id = generated.beta.get("layer1.weight").unwrap();
            tape.buf_data(id)[0]
        };
        assert_eq!(run(0.1), run(0.1));
        // Embedding index 2 is layer1's gradient mean: relu(g + 1) = g + 1.
        assert!((run(0.1) - 1.1).abs() < 1e-6);
        assert!((run(0.9) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_generator_weights_receive_gradients() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let grads = const_grads(&mut tape, &weights, 0.2);
        let mut rng = SimpleRng::new(5);
        let gen_dict = init_params(weights.len(), &mut rng);
        let gen_ids = TapeParams::register(&mut tape, &gen_dict);
        let generated = generate(&mut tape, &gen_ids, &weights, &grads).unwrap();

        let ids: Vec<BufId> = generated
            .alpha
            .iter()
            .chain(generated.beta.iter())
            .map(|(_, id)| id)
            .collect();
        let total = traced::concat(&mut tape, &ids);
        let loss = traced::sum_all(&mut tape, total);
        let w1 = gen_ids.get("w1").unwrap();
        let g = tape.grad(loss, &[w1], false);
        assert!(g[0].is_some(), "generator weights must receive gradients");
    }

    #[test]
    fn test_gradient_count_mismatch_is_error() {
        let mut tape = Tape::new();
        let weights = weight_view(&mut tape);
        let mut rng = SimpleRng::new(5);
        let gen_dict = init_params(weights.len(), &mut rng);
        let gen_ids = TapeParams::register(&mut tape, &gen_dict);
        let err = generate(&mut tape, &gen_ids, &weights, &[None]).unwrap_err();
        assert!(matches!(err, MetaError::KeyMismatch { .. }));
    }
}
