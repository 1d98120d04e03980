// ============================================================
// Layer 5 — Optimizer Pair
// ============================================================
// Two Adam optimizers over disjoint parameter groups:
//
//   extractor group → FeatureExtractor (pretrained, small LR)
//   head group      → Seq2SeqHead      (everything else)
//
// Each group has its own NewBob scheduler. After every
// validation pass the monitored metric (WER) is handed to
// anneal(), and each scheduler decides on its own whether to
// shrink its learning rate.
//
// One training step moves through a fixed cycle:
//
//   Idle ──backward()──▶ Accumulated ──step_all()──▶ Stepped
//    ▲                        │                        │
//    └────────zero_all()──────┴────────zero_all()──────┘
//
// A backward pass outside Idle, or a step outside Accumulated,
// is a contract error. A step whose loss is not finite, is above
// the explosion threshold, or left a NaN/Inf in any gradient
// goes straight from Accumulated to zero_all(): neither group
// is updated.
//
// Reference: Kingma & Ba (2015) Adam
//            Burn Book §5 (Optimizers, GradientsParams)

use anyhow::{bail, Context, Result};
use burn::{
    grad_clipping::GradientClippingConfig,
    module::{Module, ModuleVisitor, ParamId},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::Recorder,
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use serde::{Deserialize, Serialize};
use std::{fs, marker::PhantomData, path::Path};

use crate::infra::checkpoint::checkpoint_recorder;
use crate::ml::model::{AsrModel, FeatureExtractor, Seq2SeqHead};

// ─── NewBob ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewBobConfig {
    pub initial_lr:            f64,
    pub annealing_factor:      f64,
    pub improvement_threshold: f64,
    pub patient:               usize,
}

/// Plateau scheduler: when the relative improvement of the
/// metric falls below the threshold (and patience is used up),
/// the learning rate is multiplied by the annealing factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBobScheduler {
    lr:                    f64,
    annealing_factor:      f64,
    improvement_threshold: f64,
    patient:               usize,
    current_patient:       usize,
    previous:              Option<f64>,
}

impl NewBobScheduler {
    pub fn new(cfg: NewBobConfig) -> Result<Self> {
        if !(cfg.initial_lr.is_finite() && cfg.initial_lr > 0.0) {
            bail!("learning rate must be positive, got {}", cfg.initial_lr);
        }
        if !(cfg.annealing_factor > 0.0 && cfg.annealing_factor <= 1.0) {
            bail!("annealing_factor must lie in (0, 1], got {}", cfg.annealing_factor);
        }
        Ok(Self {
            lr:                    cfg.initial_lr,
            annealing_factor:      cfg.annealing_factor,
            improvement_threshold: cfg.improvement_threshold,
            patient:               cfg.patient,
            current_patient:       cfg.patient,
            previous:              None,
        })
    }

    pub fn lr(&self) -> f64 { self.lr }

    /// Feed one metric value; returns (old_lr, new_lr).
    pub fn step(&mut self, metric: f64) -> (f64, f64) {
        let old = self.lr;

        if let Some(prev) = self.previous {
            let improvement = if prev != 0.0 { (prev - metric) / prev } else { 0.0 };
            if improvement < self.improvement_threshold {
                if self.current_patient == 0 {
                    self.lr *= self.annealing_factor;
                    self.current_patient = self.patient;
                } else {
                    self.current_patient -= 1;
                }
            }
        }

        self.previous = Some(metric);
        (old, self.lr)
    }
}

// ─── Gradient Guard ───────────────────────────────────────────────────────────
/// Decides whether a step's gradients may be applied.
#[derive(Debug, Clone)]
pub struct GradientGuard {
    explosion_threshold: f64,
    skipped:             usize,
}

impl GradientGuard {
    pub fn new(explosion_threshold: f64) -> Self {
        Self { explosion_threshold, skipped: 0 }
    }

    pub fn check(&mut self, loss: f64, grads_finite: bool) -> bool {
        if grads_finite && loss.is_finite() && loss <= self.explosion_threshold {
            return true;
        }
        self.skipped += 1;
        tracing::warn!(
            loss,
            grads_finite,
            threshold = self.explosion_threshold,
            skipped_total = self.skipped,
            "Loss or gradients not finite, or loss too large; skipping this step"
        );
        false
    }

    pub fn skipped(&self) -> usize { self.skipped }
}

/// Looks up each parameter's gradient and flags any NaN or Inf.
struct FiniteGradients<'a> {
    grads:  &'a GradientsParams,
    finite: bool,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for FiniteGradients<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.finite {
            return;
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            // NaN and Inf both survive an absolute sum
            let total = grad.abs().sum().into_scalar().elem::<f64>();
            self.finite = total.is_finite();
        }
    }
}

fn gradients_finite<B: AutodiffBackend>(model: &AsrModel<B>, grads: &PairGradients) -> bool {
    let mut extractor = FiniteGradients { grads: &grads.extractor, finite: true };
    model.extractor.visit(&mut extractor);
    let mut head = FiniteGradients { grads: &grads.head, finite: true };
    model.head.visit(&mut head);
    extractor.finite && head.finite
}

// ─── Settings ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy)]
pub struct OptimSettings {
    pub extractor:                NewBobConfig,
    pub head:                     NewBobConfig,
    /// Gradient-norm clipping; 0 disables it
    pub max_grad_norm:            f64,
    pub loss_explosion_threshold: f64,
}

impl OptimSettings {
    pub fn validate(&self) -> Result<()> {
        NewBobScheduler::new(self.extractor).context("extractor optimizer")?;
        NewBobScheduler::new(self.head).context("head optimizer")?;
        if !(self.max_grad_norm.is_finite() && self.max_grad_norm >= 0.0) {
            bail!("max_grad_norm must be >= 0, got {}", self.max_grad_norm);
        }
        if self.loss_explosion_threshold.is_nan() || self.loss_explosion_threshold <= 0.0 {
            bail!("loss_explosion_threshold must be positive, got {}", self.loss_explosion_threshold);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealReport {
    pub extractor: (f64, f64),
    pub head:      (f64, f64),
}

#[derive(Debug, Serialize, Deserialize)]
struct SchedulerStates {
    extractor: NewBobScheduler,
    head:      NewBobScheduler,
    skipped:   usize,
}

struct PairGradients {
    extractor: GradientsParams,
    head:      GradientsParams,
}

enum StepPhase {
    Idle,
    Accumulated(PairGradients),
    Stepped,
}

impl StepPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle           => "idle",
            Self::Accumulated(_) => "accumulated",
            Self::Stepped        => "stepped",
        }
    }
}

// ─── OptimizerPair ────────────────────────────────────────────────────────────
pub struct OptimizerPair<B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    extractor_optim: OE,
    head_optim:      OH,
    extractor_sched: NewBobScheduler,
    head_sched:      NewBobScheduler,
    guard:           GradientGuard,
    phase:           StepPhase,
    _backend:        PhantomData<B>,
}

/// Adam on both groups, with optional gradient-norm clipping.
#[allow(clippy::type_complexity)]
pub fn adam_pair<B: AutodiffBackend>(
    settings: &OptimSettings,
) -> Result<OptimizerPair<B, impl Optimizer<FeatureExtractor<B>, B>, impl Optimizer<Seq2SeqHead<B>, B>>> {
    let clipping = (settings.max_grad_norm > 0.0)
        .then(|| GradientClippingConfig::Norm(settings.max_grad_norm as f32));
    let adam = AdamConfig::new().with_epsilon(1e-8).with_grad_clipping(clipping);

    OptimizerPair::new(
        adam.init::<B, FeatureExtractor<B>>(),
        adam.init::<B, Seq2SeqHead<B>>(),
        settings,
    )
}

impl<B, OE, OH> OptimizerPair<B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    pub fn new(extractor_optim: OE, head_optim: OH, settings: &OptimSettings) -> Result<Self> {
        Ok(Self {
            extractor_optim,
            head_optim,
            extractor_sched: NewBobScheduler::new(settings.extractor).context("extractor optimizer")?,
            head_sched:      NewBobScheduler::new(settings.head).context("head optimizer")?,
            guard:           GradientGuard::new(settings.loss_explosion_threshold),
            phase:           StepPhase::Idle,
            _backend:        PhantomData,
        })
    }

    /// Back-propagate `loss` and split the gradients by group.
    pub fn backward(&mut self, loss: Tensor<B, 1>, model: &AsrModel<B>) -> Result<()> {
        if !matches!(self.phase, StepPhase::Idle) {
            bail!("backward() called while {}; call zero_all() first", self.phase.name());
        }
        let mut grads = loss.backward();
        let extractor = GradientsParams::from_module(&mut grads, &model.extractor);
        let head      = GradientsParams::from_module(&mut grads, &model.head);
        self.phase = StepPhase::Accumulated(PairGradients { extractor, head });
        Ok(())
    }

    /// Gradient validity check for the step whose loss is `loss`:
    /// the loss and every accumulated gradient must be finite.
    pub fn gradients_valid(&mut self, loss: f64, model: &AsrModel<B>) -> bool {
        let grads_finite = match &self.phase {
            StepPhase::Accumulated(grads) => gradients_finite(model, grads),
            _ => true,
        };
        self.guard.check(loss, grads_finite)
    }

    /// Apply the accumulated gradients to both groups.
    pub fn step_all(&mut self, model: AsrModel<B>) -> Result<AsrModel<B>> {
        let grads = match std::mem::replace(&mut self.phase, StepPhase::Stepped) {
            StepPhase::Accumulated(grads) => grads,
            other => {
                let name = other.name();
                self.phase = other;
                bail!("step_all() called while {name}; it needs a preceding backward()");
            }
        };

        let AsrModel { extractor, head } = model;
        let extractor = self.extractor_optim.step(self.extractor_sched.lr(), extractor, grads.extractor);
        let head      = self.head_optim.step(self.head_sched.lr(), head, grads.head);
        Ok(AsrModel { extractor, head })
    }

    /// Drop any gradients and return to Idle.
    pub fn zero_all(&mut self) {
        self.phase = StepPhase::Idle;
    }

    /// NewBob update for both groups from one metric value.
    pub fn anneal(&mut self, metric: f64) -> AnnealReport {
        let report = AnnealReport {
            extractor: self.extractor_sched.step(metric),
            head:      self.head_sched.step(metric),
        };
        if report.extractor.0 != report.extractor.1 || report.head.0 != report.head.1 {
            tracing::info!(
                lr_extractor = report.extractor.1,
                lr_head = report.head.1,
                "Learning rate annealed"
            );
        }
        report
    }

    /// (extractor, head) learning rates
    pub fn learning_rates(&self) -> (f64, f64) {
        (self.extractor_sched.lr(), self.head_sched.lr())
    }

    pub fn skipped_steps(&self) -> usize { self.guard.skipped() }

    // ─── Persistence ──────────────────────────────────────────────────────────

    pub fn save(&self, dir: &Path) -> Result<()> {
        let recorder = checkpoint_recorder();
        Recorder::<B>::record(&recorder, self.extractor_optim.to_record(), dir.join("extractor_opt"))
            .context("Failed to save extractor optimizer state")?;
        Recorder::<B>::record(&recorder, self.head_optim.to_record(), dir.join("head_opt"))
            .context("Failed to save head optimizer state")?;

        let states = SchedulerStates {
            extractor: self.extractor_sched.clone(),
            head:      self.head_sched.clone(),
            skipped:   self.guard.skipped,
        };
        let path = dir.join("schedulers.json");
        fs::write(&path, serde_json::to_string_pretty(&states)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))
    }

    pub fn load(mut self, dir: &Path, device: &B::Device) -> Result<Self> {
        let recorder = checkpoint_recorder();
        let extractor = Recorder::<B>::load(&recorder, dir.join("extractor_opt"), device)
            .context("Cannot load extractor optimizer state")?;
        let head = Recorder::<B>::load(&recorder, dir.join("head_opt"), device)
            .context("Cannot load head optimizer state")?;
        self.extractor_optim = self.extractor_optim.load_record(extractor);
        self.head_optim      = self.head_optim.load_record(head);

        let path = dir.join("schedulers.json");
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        let states: SchedulerStates = serde_json::from_str(&json)?;
        self.extractor_sched = states.extractor;
        self.head_sched      = states.head;
        self.guard.skipped   = states.skipped;
        self.phase           = StepPhase::Idle;
        Ok(self)
    }
}
