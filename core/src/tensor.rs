/// Minimal tensor utilities for the meta-learning core.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions. No generics, no traits on Tensor — every differentiable
/// path goes through the tape (tape.rs), which composes these kernels.
/// Row-major layout throughout.

use serde::{Deserialize, Serialize};

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor { data: vec![0.0; n], shape: shape.to_vec() }
    }

    /// Constant-filled tensor, used for learning-rate / decay tables.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let n: usize = shape.iter().product();
        Tensor { data: vec![value; n], shape: shape.to_vec() }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor { data, shape: shape.to_vec() }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Row-wise log-softmax into `out`.
pub fn log_softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            sum_exp += (row[c] - max_val).exp();
        }
        let log_z = max_val + sum_exp.ln();
        for c in 0..cols {
            out[base + c] = row[c] - log_z;
        }
    }
}

/// Cross-entropy classification loss over [rows, classes] logits.
/// `targets`: [rows] class indices. Returns mean -log(softmax(logit)[target])
/// over rows whose target index is valid.
pub fn cross_entropy_f32(logits: &[f32], targets: &[usize], rows: usize, classes: usize) -> f32 {
    debug_assert_eq!(logits.len(), rows * classes);
    debug_assert_eq!(targets.len(), rows);

    let mut total_loss = 0.0f32;
    let mut count = 0usize;

    for r in 0..rows {
        let target = targets[r];
        if target >= classes {
            continue;
        }
        let base = r * classes;
        let row = &logits[base..base + classes];
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..classes {
            sum_exp += (row[c] - max_val).exp();
        }
        let log_softmax = (row[target] - max_val) - sum_exp.ln();
        total_loss -= log_softmax;
        count += 1;
    }

    if count > 0 { total_loss / count as f32 } else { 0.0 }
}

/// ReLU: out[i] = max(a[i], 0).
pub fn relu_f32(a: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i].max(0.0);
    }
}

/// Element-wise add: out[i] = a[i] + b[i].
pub fn add_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// Scale: out[i] = a[i] * scalar.
pub fn scale_f32(a: &[f32], scalar: f32, out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] * scalar;
    }
}

/// One-hot encode: out[[r, targets[r]]] = 1.0, everything else 0.
pub fn one_hot_f32(targets: &[usize], classes: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), targets.len() * classes);
    for v in out.iter_mut() {
        *v = 0.0;
    }
    for (r, &t) in targets.iter().enumerate() {
        if t < classes {
            out[r * classes + t] = 1.0;
        }
    }
}

/// Per-row argmax over [rows, cols].
pub fn argmax_rows(x: &[f32], rows: usize, cols: usize, out: &mut Vec<usize>) {
    debug_assert_eq!(x.len(), rows * cols);
    out.clear();
    for r in 0..rows {
        let base = r * cols;
        let mut best = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for c in 0..cols {
            if x[base + c] > best_val {
                best_val = x[base + c];
                best = c;
            }
        }
        out.push(best);
    }
}

/// Mean of a slice. Zero for empty input.
pub fn mean_f32(a: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().sum::<f32>() / a.len() as f32
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = [1.0, 0.0, 0.0, 1.0f32];
        let b = [1.0, 2.0, 3.0, 4.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 2, 2);
        assert_eq!(out, b);
    }

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 3, 2);
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_transpose() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let mut out = [0.0f32; 6];
        transpose_f32(&a, &mut out, 2, 3);
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_softmax_single_row() {
        let scores = [1.0, 2.0, 3.0f32];
        let mut out = [0.0f32; 3];
        softmax_f32(&scores, &mut out, 1, 3);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[0] < out[1]);
        assert!(out[1] < out[2]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let scores = [0.3, -1.2, 2.0, 0.0f32];
        let mut sm = [0.0f32; 4];
        let mut lsm = [0.0f32; 4];
        softmax_f32(&scores, &mut sm, 1, 4);
        log_softmax_f32(&scores, &mut lsm, 1, 4);
        for i in 0..4 {
            assert!((lsm[i].exp() - sm[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cross_entropy_perfect_prediction() {
        let mut logits = vec![0.0f32; 4];
        logits[0] = 10.0; logits[1] = -10.0;
        logits[2] = -10.0; logits[3] = 10.0;
        let targets = [0usize, 1];
        let loss = cross_entropy_f32(&logits, &targets, 2, 2);
        assert!(loss < 0.001, "Perfect prediction should have near-zero loss, got {}", loss);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let logits = vec![0.0f32; 8];
        let targets = [0usize, 2];
        let loss = cross_entropy_f32(&logits, &targets, 2, 4);
        let expected = (4.0f32).ln();
        assert!((loss - expected).abs() < 0.01,
            "Uniform logits should give loss ≈ ln(C)={}, got {}", expected, loss);
    }

    #[test]
    fn test_one_hot() {
        let mut out = [0.0f32; 6];
        one_hot_f32(&[2, 0], 3, &mut out);
        assert_eq!(out, [0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_argmax_rows() {
        let x = [0.1, 0.9, 0.5, 3.0, -1.0, 2.0f32];
        let mut out = Vec::new();
        argmax_rows(&x, 2, 3, &mut out);
        assert_eq!(out, vec![1, 0]);
    }

    #[test]
    fn test_relu() {
        let a = [-1.0, 0.0, 2.5f32];
        let mut out = [0.0f32; 3];
        relu_f32(&a, &mut out);
        assert_eq!(out, [0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_fill_range() {
        let mut rng = SimpleRng::new(123);
        let mut buf = vec![0.0f32; 1000];
        rng.fill_uniform(&mut buf, 0.1);
        for &v in &buf {
            assert!(v >= -0.1 && v <= 0.1, "Value {} out of range", v);
        }
    }

    #[test]
    fn test_tensor_full() {
        let t = Tensor::full(&[3, 2], 0.5);
        assert_eq!(t.numel(), 6);
        assert!(t.data.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn test_mean() {
        assert!((mean_f32(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-6);
        assert_eq!(mean_f32(&[]), 0.0);
    }
}
