// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape, then
// replays them in reverse to compute gradients via the chain rule.
//
// The bi-level trainer needs gradients *of* gradients: the inner loop
// consumes ∇θ L_support while the outer loss is differentiated through the
// resulting update. `grad(loss, wrt, create_graph)` therefore supports two
// modes, mirroring `torch.autograd.grad`:
//
//   create_graph = false — one value-only reverse sweep; the returned
//     gradients are constants (first-order mode).
//   create_graph = true — every VJP is recorded as ordinary tape ops, so a
//     later backward pass differentiates through the gradient computation
//     itself (exact second-order mode).
//
// The record-mode VJP of every op is closed under the op vocabulary below;
// that closure is what makes gradient-of-gradient exact rather than
// approximated.
//
// Parameters are snapshotted at registration — immune to later mutation.

use crate::traced;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// Denominator floor for Recip / Sqrt backward. Both ops are only applied
/// to non-negative quantities (standard deviations, std + epsilon).
pub const MIN_DENOM: f32 = 1e-12;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g., [rows, classes].
    pub shape: Vec<usize>,
    /// True for meta-parameters — these get gradient output.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: false }
    }

    pub fn param(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n], out: [m, n]
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = A^T where A: [rows, cols], out: [cols, rows]
    Transpose { input: BufId, out: BufId, rows: usize, cols: usize },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },
    /// out = -A
    Negate { input: BufId, out: BufId },
    /// out = max(A, 0)
    Relu { input: BufId, out: BufId },
    /// out = exp(A)
    Exp { input: BufId, out: BufId },
    /// out = 1 / max(A, MIN_DENOM) — positive-domain reciprocal
    Recip { input: BufId, out: BufId },
    /// out = sqrt(max(A, 0))
    Sqrt { input: BufId, out: BufId },

    // ── Reductions / broadcasts ─────────────────────────────────
    /// out[r] = sum_c A[r, c]
    RowSum { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out[c] = sum_r A[r, c]
    ColSum { input: BufId, out: BufId, rows: usize, cols: usize },
    /// [cols] → [rows, cols]: every row is a copy of the input
    BroadcastRows { input: BufId, out: BufId, rows: usize, cols: usize },
    /// [rows] → [rows, cols]: every column is a copy of the input
    BroadcastCols { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out = sum of all elements (scalar [1])
    SumAll { input: BufId, out: BufId },
    /// [1] → [n]
    BroadcastAll { input: BufId, out: BufId, n: usize },

    // ── Structured ──────────────────────────────────────────────
    /// out = softmax(A) per-row; A: [rows, cols]
    Softmax { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out = log-softmax(A) per-row
    LogSoftmax { input: BufId, out: BufId, rows: usize, cols: usize },
    /// out = mean_r -log(softmax(logits)[r, targets[r]])  (scalar [1])
    CrossEntropyMean { logits: BufId, targets: Vec<usize>, out: BufId, classes: usize },

    // ── Slicing / padding ───────────────────────────────────────
    /// out = input[offset..offset+len] (flat)
    Slice { input: BufId, out: BufId, offset: usize, len: usize, input_len: usize },
    /// out[offset..offset+len] = input, zeros elsewhere (flat, length `total`)
    Pad { input: BufId, out: BufId, offset: usize, len: usize, total: usize },
    /// Column block: out[r, :] = input[r, offset..offset+width]
    SliceCols { input: BufId, out: BufId, rows: usize, total_cols: usize, offset: usize, width: usize },
    /// Column embed: out[r, offset..offset+width] = input[r, :], zeros elsewhere
    PadCols { input: BufId, out: BufId, rows: usize, total_cols: usize, offset: usize, width: usize },
}

impl TapeOp {
    /// Output buffer of this op.
    fn out_id(&self) -> BufId {
        match *self {
            TapeOp::Matmul { out, .. }
            | TapeOp::Transpose { out, .. }
            | TapeOp::Add { out, .. }
            | TapeOp::Sub { out, .. }
            | TapeOp::Mul { out, .. }
            | TapeOp::Scale { out, .. }
            | TapeOp::Negate { out, .. }
            | TapeOp::Relu { out, .. }
            | TapeOp::Exp { out, .. }
            | TapeOp::Recip { out, .. }
            | TapeOp::Sqrt { out, .. }
            | TapeOp::RowSum { out, .. }
            | TapeOp::ColSum { out, .. }
            | TapeOp::BroadcastRows { out, .. }
            | TapeOp::BroadcastCols { out, .. }
            | TapeOp::SumAll { out, .. }
            | TapeOp::BroadcastAll { out, .. }
            | TapeOp::Softmax { out, .. }
            | TapeOp::LogSoftmax { out, .. }
            | TapeOp::CrossEntropyMean { out, .. }
            | TapeOp::Slice { out, .. }
            | TapeOp::Pad { out, .. }
            | TapeOp::SliceCols { out, .. }
            | TapeOp::PadCols { out, .. } => out,
        }
    }
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD with recordable VJPs.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators for `backward()`, indexed by BufId.
    grad_accum: Vec<Option<Vec<f32>>>,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape { ops: Vec::new(), bufs: Vec::new(), grad_accum: Vec::new() }
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        self.grad_accum.push(None);
        id
    }

    /// Allocate a constant (non-parameter) buffer. Gradients may flow *to*
    /// it during a sweep but it is never reported as a parameter gradient.
    pub fn constant(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        self.alloc(data, shape)
    }

    /// Register a meta-parameter. CLONES the data — the tape holds its own
    /// snapshot, immune to later mutation of the original.
    pub fn register_param(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::param(data.to_vec(), shape));
        self.grad_accum.push(None);
        id
    }

    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].is_param
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn record(&mut self, op: TapeOp) {
        self.ops.push(op);
    }

    /// Record an operation and allocate its output buffer in one step.
    /// Returns the output BufId.
    pub fn record_with_output(
        &mut self,
        data: Vec<f32>,
        shape: Vec<usize>,
        op_fn: impl FnOnce(BufId) -> TapeOp,
    ) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    // ── Gradient computation ─────────────────────────────────────

    /// Gradients of a scalar `loss` with respect to each buffer in `wrt`.
    ///
    /// Returns one entry per `wrt` buffer: `None` when no gradient flowed
    /// to it (the recoverable missing-gradient condition — callers log and
    /// skip), otherwise a BufId holding the gradient.
    ///
    /// With `create_graph = false` the results are constant buffers: later
    /// differentiation treats them as detached values. With
    /// `create_graph = true` the reverse sweep records its VJPs as tape
    /// ops, so the returned gradients are themselves differentiable.
    pub fn grad(&mut self, loss: BufId, wrt: &[BufId], create_graph: bool) -> Vec<Option<BufId>> {
        assert_eq!(self.buf_numel(loss), 1, "grad() requires a scalar loss");
        let upto = self.ops.len();

        if create_graph {
            let grads = self.sweep_record(loss, upto);
            wrt.iter().map(|&w| grads[w]).collect()
        } else {
            let grads = self.sweep_values(loss, upto);
            wrt.iter()
                .map(|&w| {
                    grads[w].as_ref().map(|g| {
                        let shape = self.bufs[w].shape.clone();
                        self.constant(g.clone(), shape)
                    })
                })
                .collect()
        }
    }

    /// Full backward pass from a scalar loss. Populates the persistent
    /// gradient accumulators read by `get_param_grad`. Run once per task,
    /// after the task's total loss has been assembled.
    pub fn backward(&mut self, loss: BufId) {
        assert_eq!(self.buf_numel(loss), 1, "backward() requires a scalar loss");
        let upto = self.ops.len();
        let grads = self.sweep_values(loss, upto);
        self.grad_accum = grads;
    }

    /// Accumulated gradient for a buffer after `backward()`.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grad_accum.get(id).and_then(|g| g.as_deref())
    }

    /// Gradient for a parameter buffer, zeros if no gradient flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f32> {
        assert!(self.bufs[id].is_param, "get_param_grad called on non-param buffer {id}");
        match self.grad_accum.get(id).and_then(|g| g.as_ref()) {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    // ── Value-mode reverse sweep ─────────────────────────────────

    fn sweep_values(&self, loss: BufId, upto: usize) -> Vec<Option<Vec<f32>>> {
        let mut grads: Vec<Option<Vec<f32>>> = vec![None; self.bufs.len()];
        grads[loss] = Some(vec![1.0]);

        for idx in (0..upto).rev() {
            let op = &self.ops[idx];
            if grads[op.out_id()].is_none() {
                continue;
            }
            self.vjp_values(op, &mut grads);
        }
        grads
    }

    fn acc_values(grads: &mut [Option<Vec<f32>>], id: BufId, g: Vec<f32>) {
        match &mut grads[id] {
            Some(existing) => {
                debug_assert_eq!(existing.len(), g.len());
                for (e, v) in existing.iter_mut().zip(g.iter()) {
                    *e += v;
                }
            }
            None => grads[id] = Some(g),
        }
    }

    fn vjp_values(&self, op: &TapeOp, grads: &mut Vec<Option<Vec<f32>>>) {
        use crate::tensor;

        // Caller guarantees the output gradient exists.
        let d_out = grads[op.out_id()].clone().unwrap_or_default();

        match op {
            TapeOp::Matmul { a, b, m, k, n, .. } => {
                let (m, k, n) = (*m, *k, *n);
                // d_A = d_out @ B^T
                let mut b_t = vec![0.0f32; n * k];
                tensor::transpose_f32(&self.bufs[*b].data, &mut b_t, k, n);
                let mut d_a = vec![0.0f32; m * k];
                tensor::matmul_f32(&d_out, &b_t, &mut d_a, m, n, k);
                Self::acc_values(grads, *a, d_a);
                // d_B = A^T @ d_out
                let mut a_t = vec![0.0f32; k * m];
                tensor::transpose_f32(&self.bufs[*a].data, &mut a_t, m, k);
                let mut d_b = vec![0.0f32; k * n];
                tensor::matmul_f32(&a_t, &d_out, &mut d_b, k, m, n);
                Self::acc_values(grads, *b, d_b);
            }

            TapeOp::Transpose { input, rows, cols, .. } => {
                let mut d_input = vec![0.0f32; rows * cols];
                tensor::transpose_f32(&d_out, &mut d_input, *cols, *rows);
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::Add { a, b, .. } => {
                Self::acc_values(grads, *a, d_out.clone());
                Self::acc_values(grads, *b, d_out);
            }

            TapeOp::Sub { a, b, .. } => {
                Self::acc_values(grads, *a, d_out.clone());
                Self::acc_values(grads, *b, d_out.iter().map(|x| -x).collect());
            }

            TapeOp::Mul { a, b, .. } => {
                let d_a: Vec<f32> = d_out.iter().zip(self.bufs[*b].data.iter()).map(|(d, v)| d * v).collect();
                let d_b: Vec<f32> = d_out.iter().zip(self.bufs[*a].data.iter()).map(|(d, v)| d * v).collect();
                Self::acc_values(grads, *a, d_a);
                Self::acc_values(grads, *b, d_b);
            }

            TapeOp::Scale { input, scalar, .. } => {
                Self::acc_values(grads, *input, d_out.iter().map(|d| scalar * d).collect());
            }

            TapeOp::Negate { input, .. } => {
                Self::acc_values(grads, *input, d_out.iter().map(|d| -d).collect());
            }

            TapeOp::Relu { input, .. } => {
                let x = &self.bufs[*input].data;
                let d_input: Vec<f32> = d_out
                    .iter()
                    .zip(x.iter())
                    .map(|(d, &xi)| if xi > 0.0 { *d } else { 0.0 })
                    .collect();
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::Exp { input, out } => {
                let y = &self.bufs[*out].data;
                let d_input: Vec<f32> = d_out.iter().zip(y.iter()).map(|(d, y)| d * y).collect();
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::Recip { input, out } => {
                // d_x = -d * out^2
                let y = &self.bufs[*out].data;
                let d_input: Vec<f32> = d_out.iter().zip(y.iter()).map(|(d, y)| -d * y * y).collect();
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::Sqrt { input, out } => {
                // d_x = d * 0.5 / out
                let y = &self.bufs[*out].data;
                let d_input: Vec<f32> = d_out
                    .iter()
                    .zip(y.iter())
                    .map(|(d, y)| d * 0.5 / y.max(MIN_DENOM))
                    .collect();
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::RowSum { input, rows, cols, .. } => {
                let mut d_input = vec![0.0f32; rows * cols];
                for r in 0..*rows {
                    for c in 0..*cols {
                        d_input[r * cols + c] = d_out[r];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::ColSum { input, rows, cols, .. } => {
                let mut d_input = vec![0.0f32; rows * cols];
                for r in 0..*rows {
                    for c in 0..*cols {
                        d_input[r * cols + c] = d_out[c];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::BroadcastRows { input, rows, cols, .. } => {
                let mut d_input = vec![0.0f32; *cols];
                for r in 0..*rows {
                    for c in 0..*cols {
                        d_input[c] += d_out[r * cols + c];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::BroadcastCols { input, rows, cols, .. } => {
                let mut d_input = vec![0.0f32; *rows];
                for r in 0..*rows {
                    for c in 0..*cols {
                        d_input[r] += d_out[r * cols + c];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::SumAll { input, .. } => {
                let n = self.bufs[*input].numel();
                Self::acc_values(grads, *input, vec![d_out[0]; n]);
            }

            TapeOp::BroadcastAll { input, .. } => {
                Self::acc_values(grads, *input, vec![d_out.iter().sum()]);
            }

            TapeOp::Softmax { input, out, rows, cols } => {
                let s = &self.bufs[*out].data;
                let mut d_input = vec![0.0f32; rows * cols];
                for r in 0..*rows {
                    let base = r * cols;
                    let mut dot = 0.0f32;
                    for c in 0..*cols {
                        dot += d_out[base + c] * s[base + c];
                    }
                    for c in 0..*cols {
                        d_input[base + c] = s[base + c] * (d_out[base + c] - dot);
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::LogSoftmax { input, out, rows, cols } => {
                // d_x = d - softmax(x) * rowsum(d),  softmax = exp(out)
                let y = &self.bufs[*out].data;
                let mut d_input = vec![0.0f32; rows * cols];
                for r in 0..*rows {
                    let base = r * cols;
                    let row_sum: f32 = d_out[base..base + cols].iter().sum();
                    for c in 0..*cols {
                        d_input[base + c] = d_out[base + c] - y[base + c].exp() * row_sum;
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::CrossEntropyMean { logits, targets, classes, .. } => {
                let logit_data = &self.bufs[*logits].data;
                let rows = targets.len();
                let c = *classes;
                let scalar = d_out[0];
                let n_valid = targets.iter().filter(|&&t| t < c).count() as f32;
                if n_valid == 0.0 {
                    return;
                }
                let mut d_logits = vec![0.0f32; rows * c];
                crate::tensor::softmax_f32(logit_data, &mut d_logits, rows, c);
                for (r, &target) in targets.iter().enumerate() {
                    let base = r * c;
                    if target >= c {
                        for j in 0..c {
                            d_logits[base + j] = 0.0;
                        }
                        continue;
                    }
                    d_logits[base + target] -= 1.0;
                    for j in 0..c {
                        d_logits[base + j] *= scalar / n_valid;
                    }
                }
                Self::acc_values(grads, *logits, d_logits);
            }

            TapeOp::Slice { input, offset, len, input_len, .. } => {
                let mut d_input = vec![0.0f32; *input_len];
                d_input[*offset..offset + len].copy_from_slice(&d_out);
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::Pad { input, offset, len, .. } => {
                Self::acc_values(grads, *input, d_out[*offset..offset + len].to_vec());
            }

            TapeOp::SliceCols { input, rows, total_cols, offset, width, .. } => {
                let mut d_input = vec![0.0f32; rows * total_cols];
                for r in 0..*rows {
                    for w in 0..*width {
                        d_input[r * total_cols + offset + w] = d_out[r * width + w];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }

            TapeOp::PadCols { input, rows, total_cols, offset, width, .. } => {
                let mut d_input = vec![0.0f32; rows * width];
                for r in 0..*rows {
                    for w in 0..*width {
                        d_input[r * width + w] = d_out[r * total_cols + offset + w];
                    }
                }
                Self::acc_values(grads, *input, d_input);
            }
        }
    }

    // ── Record-mode reverse sweep ────────────────────────────────

    fn sweep_record(&mut self, loss: BufId, upto: usize) -> Vec<Option<BufId>> {
        let n_bufs = self.bufs.len();
        let mut grads: Vec<Option<BufId>> = vec![None; n_bufs];
        let seed = self.constant(vec![1.0], vec![1]);
        grads[loss] = Some(seed);

        for idx in (0..upto).rev() {
            let op = self.ops[idx].clone();
            if grads[op.out_id()].is_none() {
                continue;
            }
            self.vjp_record(&op, &mut grads);
        }
        grads
    }

    fn acc_record(&mut self, grads: &mut [Option<BufId>], id: BufId, g: BufId) {
        match grads[id] {
            Some(existing) => {
                let summed = traced::add(self, existing, g);
                grads[id] = Some(summed);
            }
            None => grads[id] = Some(g),
        }
    }

    fn vjp_record(&mut self, op: &TapeOp, grads: &mut Vec<Option<BufId>>) {
        let d = grads[op.out_id()].expect("vjp_record requires an output gradient");

        match *op {
            TapeOp::Matmul { a, b, m, k, n, .. } => {
                // d_A = d_out @ B^T, d_B = A^T @ d_out
                let b_t = traced::transpose(self, b, k, n);
                let d_a = traced::matmul(self, d, b_t, m, n, k);
                self.acc_record(grads, a, d_a);
                let a_t = traced::transpose(self, a, m, k);
                let d_b = traced::matmul(self, a_t, d, k, m, n);
                self.acc_record(grads, b, d_b);
            }

            TapeOp::Transpose { input, rows, cols, .. } => {
                let d_input = traced::transpose(self, d, cols, rows);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Add { a, b, .. } => {
                self.acc_record(grads, a, d);
                self.acc_record(grads, b, d);
            }

            TapeOp::Sub { a, b, .. } => {
                self.acc_record(grads, a, d);
                let neg = traced::negate(self, d);
                self.acc_record(grads, b, neg);
            }

            TapeOp::Mul { a, b, .. } => {
                let d_a = traced::mul(self, d, b);
                self.acc_record(grads, a, d_a);
                let d_b = traced::mul(self, d, a);
                self.acc_record(grads, b, d_b);
            }

            TapeOp::Scale { input, scalar, .. } => {
                let d_input = traced::scale(self, d, scalar);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Negate { input, .. } => {
                let d_input = traced::negate(self, d);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Relu { input, .. } => {
                // The 0/1 mask is piecewise constant: a constant buffer is
                // the exact derivative almost everywhere.
                let mask: Vec<f32> =
                    self.bufs[input].data.iter().map(|&x| if x > 0.0 { 1.0 } else { 0.0 }).collect();
                let shape = self.bufs[input].shape.clone();
                let mask_id = self.constant(mask, shape);
                let d_input = traced::mul(self, d, mask_id);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Exp { input, out } => {
                let d_input = traced::mul(self, d, out);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Recip { input, out } => {
                // d_x = -d * out^2
                let sq = traced::mul(self, out, out);
                let prod = traced::mul(self, d, sq);
                let d_input = traced::negate(self, prod);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Sqrt { input, out } => {
                // d_x = d * 0.5 / out
                let inv = traced::recip(self, out);
                let half = traced::scale(self, inv, 0.5);
                let d_input = traced::mul(self, d, half);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::RowSum { input, rows, cols, .. } => {
                let d_input = traced::broadcast_cols(self, d, rows, cols);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::ColSum { input, rows, cols, .. } => {
                let d_input = traced::broadcast_rows(self, d, rows, cols);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::BroadcastRows { input, rows, cols, .. } => {
                let d_input = traced::col_sum(self, d, rows, cols);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::BroadcastCols { input, rows, cols, .. } => {
                let d_input = traced::row_sum(self, d, rows, cols);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::SumAll { input, .. } => {
                let n = self.bufs[input].numel();
                let d_input = traced::broadcast_all(self, d, n);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::BroadcastAll { input, .. } => {
                let d_input = traced::sum_all(self, d);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Softmax { input, out, rows, cols } => {
                // d_x = s * (d - rowsum(d * s))
                let ds = traced::mul(self, d, out);
                let row = traced::row_sum(self, ds, rows, cols);
                let row_b = traced::broadcast_cols(self, row, rows, cols);
                let centered = traced::sub(self, d, row_b);
                let d_input = traced::mul(self, out, centered);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::LogSoftmax { input, out, rows, cols } => {
                // d_x = d - exp(out) * rowsum(d)
                let p = traced::exp(self, out);
                let row = traced::row_sum(self, d, rows, cols);
                let row_b = traced::broadcast_cols(self, row, rows, cols);
                let corr = traced::mul(self, p, row_b);
                let d_input = traced::sub(self, d, corr);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::CrossEntropyMean { logits, ref targets, classes, .. } => {
                let rows = targets.len();
                let n_valid = targets.iter().filter(|&&t| t < classes).count();
                if n_valid == 0 {
                    return;
                }
                // d_logits = (softmax(logits) - onehot) * d / n_valid
                let sm = traced::softmax(self, logits, rows, classes);
                let mut onehot = vec![0.0f32; rows * classes];
                crate::tensor::one_hot_f32(targets, classes, &mut onehot);
                let onehot_id = self.constant(onehot, vec![rows, classes]);
                let mut diff = traced::sub(self, sm, onehot_id);
                if n_valid < rows {
                    // Rows with out-of-range targets were skipped forward.
                    let mut mask = vec![1.0f32; rows * classes];
                    for (r, &t) in targets.iter().enumerate() {
                        if t >= classes {
                            mask[r * classes..(r + 1) * classes].fill(0.0);
                        }
                    }
                    let mask_id = self.constant(mask, vec![rows, classes]);
                    diff = traced::mul(self, diff, mask_id);
                }
                let coeff = traced::scale(self, d, 1.0 / n_valid as f32);
                let coeff_b = traced::broadcast_all(self, coeff, rows * classes);
                let d_logits = traced::mul(self, diff, coeff_b);
                self.acc_record(grads, logits, d_logits);
            }

            TapeOp::Slice { input, offset, len, input_len, .. } => {
                let d_input = traced::pad(self, d, offset, len, input_len);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::Pad { input, offset, len, total, .. } => {
                let d_input = traced::slice(self, d, offset, len, total);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::SliceCols { input, rows, total_cols, offset, width, .. } => {
                let d_input = traced::pad_cols(self, d, rows, total_cols, offset, width);
                self.acc_record(grads, input, d_input);
            }

            TapeOp::PadCols { input, rows, total_cols, offset, width, .. } => {
                let d_input = traced::slice_cols(self, d, rows, total_cols, offset, width);
                self.acc_record(grads, input, d_input);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
