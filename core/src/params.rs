/// Named parameter dictionaries and the error taxonomy.
///
/// Parameters are addressed by their canonical dotted name (e.g.
/// "layer1.weight") with no name mangling. Insertion order is preserved and
/// significant: the task embedding and the generated alpha/beta split both
/// depend on a stable per-layer ordering.

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

// ── Error taxonomy ───────────────────────────────────────────────────

/// Errors surfaced by the meta-learning core.
///
/// Contract violations (key mismatch, step out of range, checkpoint
/// mismatch) fail fast and propagate to the orchestrator, which does not
/// catch them — a single malformed task aborts the whole outer iteration.
/// A missing per-parameter gradient is NOT an error: it is logged and the
/// update for that parameter is skipped for that step only.
#[derive(Debug)]
pub enum MetaError {
    /// Weight/gradient/table dictionaries disagree on their key sets.
    KeyMismatch { context: &'static str, key: String },
    /// Inner-loop step index outside the initialised table range.
    StepOutOfRange { step: usize, max: usize },
    /// Checkpoint state disagrees with the current model configuration.
    CheckpointMismatch { detail: String },
    /// Configuration rejected at construction time.
    InvalidConfig { detail: String },
    /// Checkpoint I/O failure.
    Io(std::io::Error),
    /// Checkpoint (de)serialization failure.
    Json(serde_json::Error),
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaError::KeyMismatch { context, key } => {
                write!(f, "parameter key mismatch in {context}: {key}")
            }
            MetaError::StepOutOfRange { step, max } => {
                write!(f, "inner-loop step {step} outside table range 0..={max}")
            }
            MetaError::CheckpointMismatch { detail } => {
                write!(f, "checkpoint does not match model configuration: {detail}")
            }
            MetaError::InvalidConfig { detail } => {
                write!(f, "invalid configuration: {detail}")
            }
            MetaError::Io(e) => write!(f, "checkpoint io error: {e}"),
            MetaError::Json(e) => write!(f, "checkpoint serialization error: {e}"),
        }
    }
}

impl std::error::Error for MetaError {}

impl From<std::io::Error> for MetaError {
    fn from(e: std::io::Error) -> Self {
        MetaError::Io(e)
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Json(e)
    }
}

// ── ParamDict ────────────────────────────────────────────────────────

/// Insertion-ordered mapping from canonical parameter name to tensor.
///
/// Owned per-task copies are derived from the meta-parameters at the start
/// of every task and discarded after the task's target loss is computed;
/// the key set is fixed for the lifetime of a configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDict {
    entries: Vec<(String, Tensor)>,
}

impl ParamDict {
    pub fn new() -> Self {
        ParamDict { entries: Vec::new() }
    }

    /// Insert a parameter. Last insert wins on duplicate names (callers
    /// construct dicts once, at init time, with unique names).
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = tensor;
        } else {
            self.entries.push((name, tensor));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries.iter_mut().map(|(n, t)| (n.as_str(), t))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.numel()).sum()
    }

    /// Zero-filled shadow with the same names and shapes.
    pub fn zeros_like(&self) -> Self {
        ParamDict {
            entries: self
                .entries
                .iter()
                .map(|(n, t)| (n.clone(), Tensor::zeros(&t.shape)))
                .collect(),
        }
    }

    /// Element-wise accumulate: self += other. Key sets must match.
    pub fn accumulate(&mut self, other: &ParamDict) -> Result<(), MetaError> {
        self.check_same_keys(other, "ParamDict::accumulate")?;
        for ((_, dst), (_, src)) in self.entries.iter_mut().zip(other.entries.iter()) {
            debug_assert_eq!(dst.numel(), src.numel());
            for (d, s) in dst.data.iter_mut().zip(src.data.iter()) {
                *d += s;
            }
        }
        Ok(())
    }

    /// In-place scalar multiply of every tensor.
    pub fn scale(&mut self, scalar: f32) {
        for (_, t) in self.entries.iter_mut() {
            for v in t.data.iter_mut() {
                *v *= scalar;
            }
        }
    }

    /// Verify `other` has exactly the same ordered key set and shapes.
    pub fn check_same_keys(&self, other: &ParamDict, context: &'static str) -> Result<(), MetaError> {
        if self.len() != other.len() {
            return Err(MetaError::KeyMismatch {
                context,
                key: format!("{} keys vs {} keys", self.len(), other.len()),
            });
        }
        for ((na, ta), (nb, tb)) in self.entries.iter().zip(other.entries.iter()) {
            if na != nb {
                return Err(MetaError::KeyMismatch { context, key: format!("{na} vs {nb}") });
            }
            if ta.shape != tb.shape {
                return Err(MetaError::KeyMismatch {
                    context,
                    key: format!("{na}: shape {:?} vs {:?}", ta.shape, tb.shape),
                });
            }
        }
        Ok(())
    }

    /// Frobenius norm across all tensors.
    pub fn norm(&self) -> f32 {
        let mut sum = 0.0f32;
        for (_, t) in &self.entries {
            for &x in &t.data {
                sum += x * x;
            }
        }
        sum.sqrt()
    }
}
