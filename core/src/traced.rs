/// Traced op wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena (clones to release the borrow)
///   2. Computes the forward value
///   3. Allocates the output in the arena and records the TapeOp
///   4. Returns the output BufId
///
/// These are also the vocabulary the tape's record-mode VJPs are written
/// in, which is why the set must stay closed under differentiation.

use crate::params::ParamDict;
use crate::tape::{BufId, Tape, TapeOp, MIN_DENOM};
use crate::tensor;

// ── TapeParams: a named-parameter view into the tape arena ──────────

/// Insertion-ordered mapping from canonical parameter name to the BufId
/// holding its current value on the tape. Per-task adapted copies are just
/// new `TapeParams` pointing at freshly recorded buffers; the registered
/// meta-parameter buffers are never mutated.
#[derive(Clone, Debug, Default)]
pub struct TapeParams {
    entries: Vec<(String, BufId)>,
}

impl TapeParams {
    pub fn new() -> Self {
        TapeParams { entries: Vec::new() }
    }

    /// Register every tensor of a dict as a tape parameter.
    pub fn register(tape: &mut Tape, dict: &ParamDict) -> Self {
        let mut out = TapeParams::new();
        for (name, tensor) in dict.iter() {
            let id = tape.register_param(&tensor.data, tensor.shape.clone());
            out.insert(name, id);
        }
        out
    }

    pub fn insert(&mut self, name: impl Into<String>, id: BufId) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = id;
        } else {
            self.entries.push((name, id));
        }
    }

    pub fn get(&self, name: &str) -> Option<BufId> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, BufId)> {
        self.entries.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn ids(&self) -> Vec<BufId> {
        self.entries.iter().map(|(_, id)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into (matching, rest) by a name predicate, preserving order.
    pub fn partition(&self, mut pred: impl FnMut(&str) -> bool) -> (TapeParams, TapeParams) {
        let mut yes = TapeParams::new();
        let mut no = TapeParams::new();
        for (name, id) in self.iter() {
            if pred(name) {
                yes.insert(name, id);
            } else {
                no.insert(name, id);
            }
        }
        (yes, no)
    }

    /// Union of two disjoint views (self's entries first).
    pub fn merged(&self, other: &TapeParams) -> TapeParams {
        let mut out = self.clone();
        for (name, id) in other.iter() {
            out.insert(name, id);
        }
        out
    }
}

/// Matrix multiply: out = A @ B, A: [m, k], B: [k, n].
pub fn matmul(tape: &mut Tape, a: BufId, b: BufId, m: usize, k: usize, n: usize) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let mut out = vec![0.0f32; m * n];
    tensor::matmul_f32(&a_data, &b_data, &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| TapeOp::Matmul { a, b, out: out_id, m, k, n })
}

/// Transpose: out = A^T, A: [rows, cols].
pub fn transpose(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; rows * cols];
    tensor::transpose_f32(&data, &mut out, rows, cols);
    tape.record_with_output(out, vec![cols, rows], |out_id| TapeOp::Transpose {
        input,
        out: out_id,
        rows,
        cols,
    })
}

/// Element-wise add: out = a + b.
pub fn add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    debug_assert_eq!(a_data.len(), b_data.len());
    let out: Vec<f32> = a_data.iter().zip(b_data.iter()).map(|(&x, &y)| x + y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Add { a, b, out: out_id })
}

/// Element-wise subtract: out = a - b.
pub fn sub(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    debug_assert_eq!(a_data.len(), b_data.len());
    let out: Vec<f32> = a_data.iter().zip(b_data.iter()).map(|(&x, &y)| x - y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sub { a, b, out: out_id })
}

/// Element-wise multiply: out = a * b.
pub fn mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    debug_assert_eq!(a_data.len(), b_data.len());
    let out: Vec<f32> = a_data.iter().zip(b_data.iter()).map(|(&x, &y)| x * y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Mul { a, b, out: out_id })
}

/// Scalar multiply: out = scalar * input.
pub fn scale(tape: &mut Tape, input: BufId, scalar: f32) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| scalar * x).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Scale { input, scalar, out: out_id })
}

/// Negate: out = -input.
pub fn negate(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| -x).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Negate { input, out: out_id })
}

/// ReLU: out = max(input, 0).
pub fn relu(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| x.max(0.0)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Relu { input, out: out_id })
}

/// Element-wise exp.
pub fn exp(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| x.exp()).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Exp { input, out: out_id })
}

/// Positive-domain reciprocal: out = 1 / max(input, MIN_DENOM).
pub fn recip(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| 1.0 / x.max(MIN_DENOM)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Recip { input, out: out_id })
}

/// Element-wise sqrt of a non-negative input.
pub fn sqrt(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out: Vec<f32> = data.iter().map(|&x| x.max(0.0).sqrt()).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sqrt { input, out: out_id })
}

/// Row sum: [rows, cols] → [rows].
pub fn row_sum(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), rows * cols);
    let mut out = vec![0.0f32; rows];
    for r in 0..rows {
        out[r] = data[r * cols..(r + 1) * cols].iter().sum();
    }
    tape.record_with_output(out, vec![rows], |out_id| TapeOp::RowSum { input, out: out_id, rows, cols })
}

/// Column sum: [rows, cols] → [cols].
pub fn col_sum(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), rows * cols);
    let mut out = vec![0.0f32; cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c] += data[r * cols + c];
        }
    }
    tape.record_with_output(out, vec![cols], |out_id| TapeOp::ColSum { input, out: out_id, rows, cols })
}

/// Broadcast a [cols] vector across rows: → [rows, cols].
pub fn broadcast_rows(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), cols);
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        out[r * cols..(r + 1) * cols].copy_from_slice(&data);
    }
    tape.record_with_output(out, vec![rows, cols], |out_id| TapeOp::BroadcastRows {
        input,
        out: out_id,
        rows,
        cols,
    })
}

/// Broadcast a [rows] vector across columns: → [rows, cols].
pub fn broadcast_cols(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), rows);
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] = data[r];
        }
    }
    tape.record_with_output(out, vec![rows, cols], |out_id| TapeOp::BroadcastCols {
        input,
        out: out_id,
        rows,
        cols,
    })
}

/// Sum of all elements: → [1].
pub fn sum_all(tape: &mut Tape, input: BufId) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let out = vec![data.iter().sum::<f32>()];
    tape.record_with_output(out, vec![1], |out_id| TapeOp::SumAll { input, out: out_id })
}

/// Broadcast a scalar [1] to [n].
pub fn broadcast_all(tape: &mut Tape, input: BufId, n: usize) -> BufId {
    let v = tape.buf_data(input)[0];
    tape.record_with_output(vec![v; n], vec![n], |out_id| TapeOp::BroadcastAll {
        input,
        out: out_id,
        n,
    })
}

/// Mean of all elements: → [1].
pub fn mean_all(tape: &mut Tape, input: BufId) -> BufId {
    let n = tape.buf_numel(input);
    let s = sum_all(tape, input);
    scale(tape, s, 1.0 / n.max(1) as f32)
}

/// Row-wise softmax over [rows, cols].
pub fn softmax(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; rows * cols];
    tensor::softmax_f32(&data, &mut out, rows, cols);
    tape.record_with_output(out, vec![rows, cols], |out_id| TapeOp::Softmax {
        input,
        out: out_id,
        rows,
        cols,
    })
}

/// Row-wise log-softmax over [rows, cols].
pub fn log_softmax(tape: &mut Tape, input: BufId, rows: usize, cols: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    let mut out = vec![0.0f32; rows * cols];
    tensor::log_softmax_f32(&data, &mut out, rows, cols);
    tape.record_with_output(out, vec![rows, cols], |out_id| TapeOp::LogSoftmax {
        input,
        out: out_id,
        rows,
        cols,
    })
}

/// Mean cross-entropy over [rows, classes] logits: → [1].
pub fn cross_entropy(tape: &mut Tape, logits: BufId, targets: &[usize], classes: usize) -> BufId {
    let data = tape.buf_data(logits).to_vec();
    let rows = targets.len();
    let loss = tensor::cross_entropy_f32(&data, targets, rows, classes);
    let targets = targets.to_vec();
    tape.record_with_output(vec![loss], vec![1], |out_id| TapeOp::CrossEntropyMean {
        logits,
        targets,
        out: out_id,
        classes,
    })
}

/// Flat slice: out = input[offset..offset+len].
pub fn slice(tape: &mut Tape, input: BufId, offset: usize, len: usize, input_len: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), input_len);
    let out = data[offset..offset + len].to_vec();
    tape.record_with_output(out, vec![len], |out_id| TapeOp::Slice {
        input,
        out: out_id,
        offset,
        len,
        input_len,
    })
}

/// Flat pad: embed input at `offset` into a zero vector of length `total`.
pub fn pad(tape: &mut Tape, input: BufId, offset: usize, len: usize, total: usize) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), len);
    let mut out = vec![0.0f32; total];
    out[offset..offset + len].copy_from_slice(&data);
    tape.record_with_output(out, vec![total], |out_id| TapeOp::Pad {
        input,
        out: out_id,
        offset,
        len,
        total,
    })
}

/// Column-block slice: out[r, :] = input[r, offset..offset+width].
pub fn slice_cols(
    tape: &mut Tape,
    input: BufId,
    rows: usize,
    total_cols: usize,
    offset: usize,
    width: usize,
) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), rows * total_cols);
    let mut out = vec![0.0f32; rows * width];
    for r in 0..rows {
        out[r * width..(r + 1) * width]
            .copy_from_slice(&data[r * total_cols + offset..r * total_cols + offset + width]);
    }
    tape.record_with_output(out, vec![rows, width], |out_id| TapeOp::SliceCols {
        input,
        out: out_id,
        rows,
        total_cols,
        offset,
        width,
    })
}

/// Column-block embed: out[r, offset..offset+width] = input[r, :].
pub fn pad_cols(
    tape: &mut Tape,
    input: BufId,
    rows: usize,
    total_cols: usize,
    offset: usize,
    width: usize,
) -> BufId {
    let data = tape.buf_data(input).to_vec();
    debug_assert_eq!(data.len(), rows * width);
    let mut out = vec![0.0f32; rows * total_cols];
    for r in 0..rows {
        out[r * total_cols + offset..r * total_cols + offset + width]
            .copy_from_slice(&data[r * width..(r + 1) * width]);
    }
    tape.record_with_output(out, vec![rows, total_cols], |out_id| TapeOp::PadCols {
        input,
        out: out_id,
        rows,
        total_cols,
        offset,
        width,
    })
}

// ── Composites ───────────────────────────────────────────────────────

/// Concatenate flat vectors: sum of pads.
pub fn concat(tape: &mut Tape, inputs: &[BufId]) -> BufId {
    debug_assert!(!inputs.is_empty());
    let total: usize = inputs.iter().map(|&id| tape.buf_numel(id)).sum();
    let mut offset = 0usize;
    let mut acc: Option<BufId> = None;
    for &id in inputs {
        let len = tape.buf_numel(id);
        let padded = pad(tape, id, offset, len, total);
        acc = Some(match acc {
            Some(prev) => add(tape, prev, padded),
            None => padded,
        });
        offset += len;
    }
    acc.expect("concat of at least one input")
}

/// Concatenate matrices along columns: [rows, w_i] blocks → [rows, Σw_i].
pub fn concat_cols(tape: &mut Tape, inputs: &[BufId], rows: usize, widths: &[usize]) -> BufId {
    debug_assert_eq!(inputs.len(), widths.len());
    let total_cols: usize = widths.iter().sum();
    let mut offset = 0usize;
    let mut acc: Option<BufId> = None;
    for (&id, &w) in inputs.iter().zip(widths.iter()) {
        let padded = pad_cols(tape, id, rows, total_cols, offset, w);
        acc = Some(match acc {
            Some(prev) => add(tape, prev, padded),
            None => padded,
        });
        offset += w;
    }
    acc.expect("concat_cols of at least one input")
}

/// Linear layer: out = x @ W^T + b, x: [rows, in], W: [out_dim, in], b: [out_dim].
pub fn linear(
    tape: &mut Tape,
    x: BufId,
    w: BufId,
    b: BufId,
    rows: usize,
    in_dim: usize,
    out_dim: usize,
) -> BufId {
    let w_t = transpose(tape, w, out_dim, in_dim);
    let xw = matmul(tape, x, w_t, rows, in_dim, out_dim);
    let b_rows = broadcast_rows(tape, b, rows, out_dim);
    add(tape, xw, b_rows)
}

/// Standardize a flat vector: (x - mean) / (std + eps), unbiased std.
/// Computed fresh per call; the epsilon keeps a zero-variance input bounded.
pub fn standardize(tape: &mut Tape, x: BufId, eps: f32) -> BufId {
    let n = tape.buf_numel(x);
    let mean = mean_all(tape, x);
    let mean_b = broadcast_all(tape, mean, n);
    let centered = sub(tape, x, mean_b);
    let sq = mul(tape, centered, centered);
    let ss = sum_all(tape, sq);
    let var = scale(tape, ss, 1.0 / (n.saturating_sub(1).max(1)) as f32);
    let std = sqrt(tape, var);
    let eps_id = tape.constant(vec![eps], vec![1]);
    let denom = add(tape, std, eps_id);
    let inv = recip(tape, denom);
    let inv_b = broadcast_all(tape, inv, n);
    mul(tape, centered, inv_b)
}

/// Per-instance predictive entropy term: rowsum(p * log p) over [rows, cols]
/// (the negative entropy of each row's predictive distribution).
pub fn row_neg_entropy(tape: &mut Tape, logits: BufId, rows: usize, cols: usize) -> BufId {
    let logp = log_softmax(tape, logits, rows, cols);
    let p = exp(tape, logp);
    let plogp = mul(tape, p, logp);
    row_sum(tape, plogp, rows, cols)
}
