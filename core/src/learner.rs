/// Outer-loop orchestrator: the bi-level trainer.
///
/// One outer iteration runs every task of a batch through the inner loop —
/// fresh per-task parameter copies adapted with the learned update rule —
/// computes the (optionally multi-step-weighted) target-set loss, and
/// accumulates outer gradients across tasks before a single Adam step.
/// The whole per-task computation is recorded on one tape, so the outer
/// backward pass differentiates through every inner update; with the
/// second-order flag the inner gradients themselves stay on the graph.

use tracing::debug;

use crate::adam::{cosine_lr, AdamConfig, MetaAdam};
use crate::alfa;
use crate::backbone::FunctionalBackbone;
use crate::lslr::{self, LslrTableIds};
use crate::meta_loss;
use crate::model::{
    load_checkpoint, save_checkpoint, MetaConfig, MetaParams,
};
use crate::params::{MetaError, ParamDict};
use crate::tape::Tape;
use crate::tensor::{self, SimpleRng};
use crate::traced::{self, TapeParams};

// ── Task data ────────────────────────────────────────────────────────

/// One few-shot task: support (adaptation) and target (evaluation) sets,
/// already flattened to [rows, features] feature matrices.
#[derive(Clone, Debug)]
pub struct Task {
    pub support_x: Vec<f32>,
    pub support_y: Vec<usize>,
    pub target_x: Vec<f32>,
    pub target_y: Vec<usize>,
}

/// Episode tensor dimensions of the external data layout:
/// inputs (batch, classes·samples, channels, height, width),
/// labels (batch, classes, samples).
#[derive(Clone, Copy, Debug)]
pub struct EpisodeShape {
    pub batch: usize,
    pub num_classes: usize,
    pub support_samples_per_class: usize,
    pub target_samples_per_class: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl EpisodeShape {
    pub fn features(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// A batch of tasks for one outer iteration.
#[derive(Clone, Debug, Default)]
pub struct TaskBatch {
    pub tasks: Vec<Task>,
}

impl TaskBatch {
    /// Build from the external episode layout, flattening the class/sample
    /// dimensions into per-task [rows, features] matrices.
    pub fn from_episode_layout(
        support_x: &[f32],
        target_x: &[f32],
        support_y: &[usize],
        target_y: &[usize],
        shape: &EpisodeShape,
    ) -> Result<TaskBatch, MetaError> {
        let f = shape.features();
        let s_rows = shape.num_classes * shape.support_samples_per_class;
        let t_rows = shape.num_classes * shape.target_samples_per_class;
        let check = |name: &str, got: usize, want: usize| {
            if got == want {
                Ok(())
            } else {
                Err(MetaError::InvalidConfig {
                    detail: format!("episode layout: {name} has {got} elements, expected {want}"),
                })
            }
        };
        check("support inputs", support_x.len(), shape.batch * s_rows * f)?;
        check("target inputs", target_x.len(), shape.batch * t_rows * f)?;
        check("support labels", support_y.len(), shape.batch * s_rows)?;
        check("target labels", target_y.len(), shape.batch * t_rows)?;

        let mut tasks = Vec::with_capacity(shape.batch);
        for b in 0..shape.batch {
            tasks.push(Task {
                support_x: support_x[b * s_rows * f..(b + 1) * s_rows * f].to_vec(),
                support_y: support_y[b * s_rows..(b + 1) * s_rows].to_vec(),
                target_x: target_x[b * t_rows * f..(b + 1) * t_rows * f].to_vec(),
                target_y: target_y[b * t_rows..(b + 1) * t_rows].to_vec(),
            });
        }
        Ok(TaskBatch { tasks })
    }
}

/// Metrics of one outer iteration.
#[derive(Clone, Debug)]
pub struct IterMetrics {
    /// Mean per-task total loss.
    pub loss: f32,
    /// Mean per-instance target accuracy.
    pub accuracy: f32,
    pub per_task_losses: Vec<f32>,
    /// Per-instance accuracies, concatenated across the batch.
    pub accuracies: Vec<f32>,
    pub learning_rate: f32,
}

struct TaskOutcome {
    loss: f32,
    accuracies: Vec<f32>,
    grads: Option<MetaParams>,
}

/// All meta-parameter groups registered on one task's tape.
struct RegisteredParams {
    network: TapeParams,
    tables: LslrTableIds,
    generator: TapeParams,
    support_loss: TapeParams,
    query_loss: TapeParams,
    support_adapter: TapeParams,
    query_adapter: TapeParams,
}

impl RegisteredParams {
    fn register(tape: &mut Tape, params: &MetaParams) -> Self {
        RegisteredParams {
            network: TapeParams::register(tape, &params.network),
            tables: LslrTableIds::register(tape, &params.tables),
            generator: TapeParams::register(tape, &params.generator),
            support_loss: TapeParams::register(tape, &params.support_loss),
            query_loss: TapeParams::register(tape, &params.query_loss),
            support_adapter: TapeParams::register(tape, &params.support_adapter),
            query_adapter: TapeParams::register(tape, &params.query_adapter),
        }
    }
}

// ── MetaLearner ──────────────────────────────────────────────────────

/// The bi-level trainer over a parameter-functional backbone.
pub struct MetaLearner<B: FunctionalBackbone> {
    pub cfg: MetaConfig,
    pub backbone: B,
    pub params: MetaParams,
    optimizer: MetaAdam,
    current_epoch: usize,
}

impl<B: FunctionalBackbone> MetaLearner<B> {
    pub fn new(cfg: MetaConfig, backbone: B) -> Result<Self, MetaError> {
        cfg.validate()?;
        let mut rng = SimpleRng::new(cfg.seed);
        let params = MetaParams::init(&cfg, &backbone, &mut rng);
        let optimizer = MetaAdam::new(&params, AdamConfig::default());
        Ok(MetaLearner { cfg, backbone, params, optimizer, current_epoch: 0 })
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Outer learning rate for an epoch (cosine annealing, no warmup).
    pub fn outer_lr(&self, epoch: usize) -> f32 {
        cosine_lr(
            epoch as u32,
            0,
            self.cfg.total_epochs as u32,
            self.cfg.meta_learning_rate,
            self.cfg.min_meta_learning_rate,
        )
    }

    /// Per-step target-loss weights for multi-step-loss blending.
    ///
    /// Starts uniform at 1/S; with each epoch the non-final weights decay
    /// toward 0.03/S while the final step's weight grows by the same total
    /// mass, saturating at the configured epoch horizon. Sums to 1 for
    /// every epoch. Recomputed every outer forward pass.
    pub fn per_step_loss_importance_vector(&self, epoch: usize) -> Vec<f32> {
        let s = self.cfg.num_train_steps;
        let s_f = s as f32;
        let mut weights = vec![1.0 / s_f; s];
        let decay_rate = 1.0 / s_f / self.cfg.multi_step_loss_num_epochs.max(1) as f32;
        let min_non_final = 0.03 / s_f;
        let e = epoch as f32;
        for w in weights.iter_mut().take(s - 1) {
            *w = (*w - e * decay_rate).max(min_non_final);
        }
        weights[s - 1] =
            (weights[s - 1] + e * (s_f - 1.0) * decay_rate).min(1.0 - (s_f - 1.0) * min_non_final);
        weights
    }

    /// One meta-training iteration over a task batch: inner-loop adaptation
    /// per task, gradient accumulation across tasks, one Adam step.
    pub fn run_train_iter(&mut self, batch: &TaskBatch, epoch: usize) -> Result<IterMetrics, MetaError> {
        self.current_epoch = epoch;
        let use_second_order =
            self.cfg.second_order && epoch > self.cfg.first_to_second_order_epoch;
        let metrics = self.forward_batch(batch, epoch, self.cfg.num_train_steps, use_second_order, true)?;
        debug!(
            epoch,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            lr = metrics.learning_rate,
            "meta-train iteration"
        );
        Ok(metrics)
    }

    /// One evaluation iteration: first-order, evaluation step count, no
    /// optimizer step, running statistics restored per task.
    pub fn run_validation_iter(&mut self, batch: &TaskBatch) -> Result<IterMetrics, MetaError> {
        let epoch = self.current_epoch;
        let metrics = self.forward_batch(batch, epoch, self.cfg.num_eval_steps, false, false)?;
        debug!(loss = metrics.loss, accuracy = metrics.accuracy, "evaluation iteration");
        Ok(metrics)
    }

    fn forward_batch(
        &mut self,
        batch: &TaskBatch,
        epoch: usize,
        num_steps: usize,
        use_second_order: bool,
        training: bool,
    ) -> Result<IterMetrics, MetaError> {
        if batch.tasks.is_empty() {
            return Err(MetaError::InvalidConfig { detail: "empty task batch".to_string() });
        }
        let importance = self.per_step_loss_importance_vector(epoch);
        let n_tasks = batch.tasks.len();

        let mut acc_grads = if training { Some(self.params.zeros_like()) } else { None };
        let mut per_task_losses = Vec::with_capacity(n_tasks);
        let mut accuracies = Vec::new();

        // Tasks run strictly in sequence: every task's gradient contribution
        // is accumulated before the single optimizer step below.
        for task in &batch.tasks {
            let outcome = self
                .forward_task(task, epoch, num_steps, use_second_order, training, training, &importance)?;
            per_task_losses.push(outcome.loss);
            accuracies.extend(outcome.accuracies);
            if let Some(acc) = acc_grads.as_mut() {
                let mut g = outcome.grads.expect("training task computes gradients");
                g.scale(1.0 / n_tasks as f32);
                acc.accumulate(&g)?;
            }
        }

        let lr = self.outer_lr(epoch);
        if let Some(mut grads) = acc_grads {
            // Fixed (non-learnable) tables stay at their initial values.
            if !(self.cfg.learnable_per_step_rates || self.cfg.alfa) {
                grads.tables.alpha.scale(0.0);
                grads.tables.beta.scale(0.0);
                grads.tables.beta_per_param.scale(0.0);
            }
            self.optimizer.step(&mut self.params, &grads, lr);
        }

        let loss = tensor::mean_f32(&per_task_losses);
        let accuracy = tensor::mean_f32(&accuracies);
        Ok(IterMetrics { loss, accuracy, per_task_losses, accuracies, learning_rate: lr })
    }

    /// Mean batch loss under training-phase semantics, with no gradient
    /// computation and no optimizer step. Drives finite-difference checks.
    pub fn training_batch_loss(&mut self, batch: &TaskBatch, epoch: usize) -> Result<f32, MetaError> {
        if batch.tasks.is_empty() {
            return Err(MetaError::InvalidConfig { detail: "empty task batch".to_string() });
        }
        let importance = self.per_step_loss_importance_vector(epoch);
        let mut losses = Vec::with_capacity(batch.tasks.len());
        for task in &batch.tasks {
            let outcome = self
                .forward_task(task, epoch, self.cfg.num_train_steps, false, true, false, &importance)?;
            losses.push(outcome.loss);
        }
        Ok(tensor::mean_f32(&losses))
    }

    /// Gradients of the mean batch loss with respect to every
    /// meta-parameter, without applying an optimizer step. Returns the
    /// mean loss and the accumulated gradients.
    pub fn compute_meta_gradients(
        &mut self,
        batch: &TaskBatch,
        epoch: usize,
        use_second_order: bool,
    ) -> Result<(f32, MetaParams), MetaError> {
        if batch.tasks.is_empty() {
            return Err(MetaError::InvalidConfig { detail: "empty task batch".to_string() });
        }
        let importance = self.per_step_loss_importance_vector(epoch);
        let n_tasks = batch.tasks.len();
        let mut acc = self.params.zeros_like();
        let mut losses = Vec::with_capacity(n_tasks);
        for task in &batch.tasks {
            let outcome = self
                .forward_task(task, epoch, self.cfg.num_train_steps, use_second_order, true, true, &importance)?;
            losses.push(outcome.loss);
            let mut g = outcome.grads.expect("gradients requested");
            g.scale(1.0 / n_tasks as f32);
            acc.accumulate(&g)?;
        }
        Ok((tensor::mean_f32(&losses), acc))
    }

    /// Run the inner loop for one task and, when requested, the outer
    /// backward pass for its contribution.
    #[allow(clippy::too_many_arguments)]
    fn forward_task(
        &mut self,
        task: &Task,
        epoch: usize,
        num_steps: usize,
        use_second_order: bool,
        training: bool,
        compute_grads: bool,
        importance: &[f32],
    ) -> Result<TaskOutcome, MetaError> {
        let classes = self.backbone.num_classes();
        let n_support = task.support_y.len();
        let n_target = task.target_y.len();
        let rows = n_support + n_target;

        let mut x_cat = Vec::with_capacity(task.support_x.len() + task.target_x.len());
        x_cat.extend_from_slice(&task.support_x);
        x_cat.extend_from_slice(&task.target_x);
        let mut y_cat = Vec::with_capacity(rows);
        y_cat.extend_from_slice(&task.support_y);
        y_cat.extend_from_slice(&task.target_y);

        let mut tape = Tape::new();
        let reg = RegisteredParams::register(&mut tape, &self.params);

        // Fresh per-task copy: the adapted set starts at the registered
        // meta-parameters; normalisation parameters stay frozen unless
        // configured into the inner loop.
        let include_norm = self.cfg.inner_loop_norm_params;
        let (frozen, mut inner) =
            reg.network.partition(|name| !include_norm && name.contains("norm"));

        let lslr_cfg = self.cfg.lslr_config();
        let use_multi_step =
            self.cfg.use_multi_step_loss && training && epoch < self.cfg.multi_step_loss_num_epochs;

        let mut step_losses = Vec::new();
        let mut final_query_logits: Vec<f32> = Vec::new();

        for step in 0..num_steps {
            let full = inner.merged(&frozen);
            let logits =
                self.backbone.forward(&mut tape, &x_cat, rows, &full, true, step, step == 0)?;
            let support_preds =
                traced::slice(&mut tape, logits, 0, n_support * classes, rows * classes);
            let query_preds = traced::slice(
                &mut tape,
                logits,
                n_support * classes,
                n_target * classes,
                rows * classes,
            );

            // Step loss: support CE, plus the learned support- and
            // query-side losses when enabled.
            let step_loss = if self.cfg.meta_loss {
                let support_ce =
                    traced::cross_entropy(&mut tape, support_preds, &task.support_y, classes);
                let support_ml = meta_loss::support_meta_loss(
                    &mut tape,
                    &reg.support_loss,
                    &reg.support_adapter,
                    step,
                    &inner,
                    support_ce,
                    support_preds,
                    &task.support_y,
                    classes,
                )?;
                let query_ml = meta_loss::query_meta_loss(
                    &mut tape,
                    &reg.query_loss,
                    &reg.query_adapter,
                    step,
                    &inner,
                    query_preds,
                    n_target,
                    classes,
                )?;
                let partial = traced::add(&mut tape, support_ce, support_ml);
                traced::add(&mut tape, partial, query_ml)
            } else {
                traced::cross_entropy(&mut tape, support_preds, &task.support_y, classes)
            };

            // Inner gradients; the second-order flag decides whether the
            // graph is retained through them.
            let wrt = inner.ids();
            let grads = tape.grad(step_loss, &wrt, use_second_order);

            let generated = if self.cfg.alfa {
                Some(alfa::generate(&mut tape, &reg.generator, &inner, &grads)?)
            } else {
                None
            };

            inner = lslr::update_params(
                &mut tape,
                &lslr_cfg,
                &inner,
                &grads,
                &reg.tables,
                generated.as_ref(),
                step,
            )?;

            // Target-set loss with the just-updated weights: every step
            // while multi-step blending is active, else only the final
            // step. The final step always runs, so predictions and
            // accuracy always come from the fully adapted parameters.
            let is_last = step + 1 == num_steps;
            if use_multi_step || is_last {
                let full = inner.merged(&frozen);
                let post_logits =
                    self.backbone.forward(&mut tape, &x_cat, rows, &full, true, step, false)?;
                let target_loss = traced::cross_entropy(&mut tape, post_logits, &y_cat, classes);
                if use_multi_step {
                    step_losses.push(traced::scale(&mut tape, target_loss, importance[step]));
                } else {
                    step_losses.push(target_loss);
                }
                if is_last {
                    final_query_logits =
                        tape.buf_data(post_logits)[n_support * classes..].to_vec();
                }
            }
        }

        // Total task loss: sum of the accumulated per-step contributions.
        let mut total = step_losses[0];
        for &extra in &step_losses[1..] {
            total = traced::add(&mut tape, total, extra);
        }

        let mut predicted = Vec::new();
        tensor::argmax_rows(&final_query_logits, n_target, classes, &mut predicted);
        let accuracies: Vec<f32> = predicted
            .iter()
            .zip(task.target_y.iter())
            .map(|(p, y)| if p == y { 1.0 } else { 0.0 })
            .collect();

        if !training {
            self.backbone.restore_backup_stats();
        }

        let grads = if compute_grads {
            tape.backward(total);
            let mut shadow = self.params.zeros_like();
            fill_group(&tape, &reg.network, &mut shadow.network);
            fill_group(&tape, &reg.tables.alpha, &mut shadow.tables.alpha);
            fill_group(&tape, &reg.tables.beta, &mut shadow.tables.beta);
            fill_group(&tape, &reg.tables.beta_per_param, &mut shadow.tables.beta_per_param);
            fill_group(&tape, &reg.generator, &mut shadow.generator);
            fill_group(&tape, &reg.support_loss, &mut shadow.support_loss);
            fill_group(&tape, &reg.query_loss, &mut shadow.query_loss);
            fill_group(&tape, &reg.support_adapter, &mut shadow.support_adapter);
            fill_group(&tape, &reg.query_adapter, &mut shadow.query_adapter);
            Some(shadow)
        } else {
            None
        };

        Ok(TaskOutcome { loss: tape.buf_data(total)[0], accuracies, grads })
    }

    // ── Checkpointing ────────────────────────────────────────────────

    /// Persist the experiment state plus the full meta-parameter state.
    pub fn save_model(
        &self,
        dir: &std::path::Path,
        name: &str,
        idx: &str,
        state: serde_json::Map<String, serde_json::Value>,
    ) -> Result<std::path::PathBuf, MetaError> {
        save_checkpoint(dir, name, idx, state, &self.params)
    }

    /// Load a checkpoint, validating its structure against the current
    /// configuration before anything is applied. Returns the experiment
    /// state mapping.
    pub fn load_model(
        &mut self,
        dir: &std::path::Path,
        name: &str,
        idx: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, MetaError> {
        let checkpoint = load_checkpoint(dir, name, idx)?;
        self.params.check_same_structure(&checkpoint.network)?;
        self.params = checkpoint.network;
        Ok(checkpoint.state)
    }
}

fn fill_group(tape: &Tape, ids: &TapeParams, dict: &mut ParamDict) {
    for (name, id) in ids.iter() {
        if let Some(t) = dict.get_mut(name) {
            t.data = tape.get_param_grad(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::LinearBackbone;

    fn learner(cfg: MetaConfig) -> MetaLearner<LinearBackbone> {
        MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap()
    }

    fn xor_ish_task() -> Task {
        Task {
            support_x: vec![1.0, 0.0, 0.0, 1.0],
            support_y: vec![0, 1],
            target_x: vec![0.9, 0.1, 0.1, 0.9],
            target_y: vec![0, 1],
        }
    }

    // ── Importance vector properties ─────────────────────────────────

    #[test]
    fn test_importance_vector_sums_to_one() {
        let l = learner(MetaConfig::test_config());
        for epoch in 0..50 {
            let w = l.per_step_loss_importance_vector(epoch);
            let sum: f32 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "epoch {epoch}: sum={sum}");
        }
    }

    #[test]
    fn test_importance_vector_monotone_shift() {
        let mut cfg = MetaConfig::test_config();
        cfg.num_train_steps = 4;
        let l = MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap();
        let mut prev = l.per_step_loss_importance_vector(0);
        for epoch in 1..30 {
            let w = l.per_step_loss_importance_vector(epoch);
            for i in 0..3 {
                assert!(w[i] <= prev[i] + 1e-7, "non-final weight {i} must not grow");
            }
            assert!(w[3] >= prev[3] - 1e-7, "final weight must not shrink");
            prev = w;
        }
    }

    #[test]
    fn test_importance_vector_saturates() {
        let mut cfg = MetaConfig::test_config();
        cfg.num_train_steps = 4;
        cfg.multi_step_loss_num_epochs = 5;
        let l = MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap();
        let late = l.per_step_loss_importance_vector(500);
        let min = 0.03 / 4.0;
        for w in &late[..3] {
            assert!((w - min).abs() < 1e-6, "non-final weights saturate at {min}");
        }
        assert!((late[3] - (1.0 - 3.0 * min)).abs() < 1e-6);
    }

    #[test]
    fn test_importance_single_step() {
        let mut cfg = MetaConfig::test_config();
        cfg.num_train_steps = 1;
        let l = MetaLearner::new(cfg, LinearBackbone::new(2, 2)).unwrap();
        assert_eq!(l.per_step_loss_importance_vector(3), vec![1.0]);
    }

    // ── Task batch layout ────────────────────────────────────────────

    #[test]
    fn test_episode_layout_flattening() {
        let shape = EpisodeShape {
            batch: 2,
            num_classes: 2,
            support_samples_per_class: 1,
            target_samples_per_class: 1,
            channels: 1,
            height: 1,
            width: 3,
        };
        let f = shape.features();
        assert_eq!(f, 3);
        let support_x: Vec<f32> = (0..2 * 2 * f).map(|i| i as f32).collect();
        let target_x: Vec<f32> = (0..2 * 2 * f).map(|i| -(i as f32)).collect();
        let support_y = vec![0, 1, 0, 1];
        let target_y = vec![1, 0, 1, 0];
        let batch =
            TaskBatch::from_episode_layout(&support_x, &target_x, &support_y, &target_y, &shape)
                .unwrap();
        assert_eq!(batch.tasks.len(), 2);
        assert_eq!(batch.tasks[0].support_x, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(batch.tasks[1].support_y, vec![0, 1]);
        assert_eq!(batch.tasks[1].support_x[0], 6.0);
    }

    #[test]
    fn test_episode_layout_size_mismatch_fails() {
        let shape = EpisodeShape {
            batch: 1,
            num_classes: 2,
            support_samples_per_class: 1,
            target_samples_per_class: 1,
            channels: 1,
            height: 1,
            width: 2,
        };
        let err = TaskBatch::from_episode_layout(&[0.0; 3], &[0.0; 4], &[0, 1], &[0, 1], &shape)
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidConfig { .. }));
    }

    // ── Smoke tests ──────────────────────────────────────────────────

    #[test]
    fn test_train_iter_updates_meta_params() {
        let mut l = learner(MetaConfig::test_config());
        let batch = TaskBatch { tasks: vec![xor_ish_task(), xor_ish_task()] };
        let before = l.params.clone();
        let metrics = l.run_train_iter(&batch, 0).unwrap();
        assert!(metrics.loss.is_finite());
        assert_eq!(metrics.per_task_losses.len(), 2);
        assert_eq!(metrics.accuracies.len(), 4);
        assert_ne!(l.params.network, before.network, "outer step must move the initialisation");
    }

    #[test]
    fn test_validation_iter_leaves_params_untouched() {
        let mut l = learner(MetaConfig::test_config());
        let batch = TaskBatch { tasks: vec![xor_ish_task()] };
        let before = l.params.clone();
        let metrics = l.run_validation_iter(&batch).unwrap();
        assert!(metrics.loss.is_finite());
        assert_eq!(l.params, before, "evaluation must not mutate meta-parameters");
    }

    #[test]
    fn test_fixed_tables_stay_fixed() {
        let mut cfg = MetaConfig::test_config();
        cfg.learnable_per_step_rates = false;
        let mut l = learner(cfg);
        let tables_before = l.params.tables.clone();
        let batch = TaskBatch { tasks: vec![xor_ish_task()] };
        l.run_train_iter(&batch, 0).unwrap();
        assert_eq!(l.params.tables, tables_before, "non-learnable tables must stay at init");
    }

    #[test]
    fn test_empty_batch_is_error() {
        let mut l = learner(MetaConfig::test_config());
        let err = l.run_train_iter(&TaskBatch::default(), 0).unwrap_err();
        assert!(matches!(err, MetaError::InvalidConfig { .. }));
    }

    #[test]
    fn test_alfa_train_iter_moves_generator() {
        let mut l = learner(MetaConfig::alfa_test_config());
        let batch = TaskBatch { tasks: vec![xor_ish_task()] };
        let gen_before = l.params.generator.clone();
        l.run_train_iter(&batch, 0).unwrap();
        assert_ne!(l.params.generator, gen_before, "generator must receive outer gradients");
    }

    #[test]
    fn test_second_order_metal_smoke() {
        let mut cfg = MetaConfig::metal_test_config();
        cfg.second_order = true;
        cfg.first_to_second_order_epoch = 0;
        let mut l = learner(cfg);
        let batch = TaskBatch { tasks: vec![xor_ish_task()] };
        let loss_net_before = l.params.support_loss.clone();
        let metrics = l.run_train_iter(&batch, 1).unwrap();
        assert!(metrics.loss.is_finite());
        assert_ne!(
            l.params.support_loss, loss_net_before,
            "second-order training must reach the loss network through the inner updates"
        );
    }
}
