//! Notorch learning unit.
//!
//! One training step does two independent things:
//! - a plain SGD step on the output projection `Wo` from the cross-entropy
//!   gradient `probs - one_hot(target)`
//! - a non-gradient resonance nudge for the target token, driven only by
//!   whether the model already gave it a reasonable probability
//!
//! The gradient must use the activation produced by the forward call that
//! produced `probs`. The single-slot `ActivationSlot` makes that explicit:
//! `forward` fills it, `train_step` takes it, and a taken slot cannot be
//! read again.

use tracing::warn;

use crate::error::{LungError, Result};
use crate::lung::{Lung, TokenId};

/// Target probability above which a prediction counts as correct.
pub const CORRECT_THRESHOLD: f32 = 0.1;
/// Resonance gain for a correct prediction.
pub const RESONANCE_REWARD: f32 = 0.01;
/// Resonance loss for a miss (smaller than the reward).
pub const RESONANCE_PENALTY: f32 = 0.005;
/// Misses never push resonance below this floor.
pub const RESONANCE_FLOOR: f32 = 0.1;

/// Concatenated head output `y` from one forward call.
#[derive(Debug, Clone)]
pub struct Activation {
    generation: u64,
    y: Vec<f32>,
}

impl Activation {
    pub(crate) fn new(generation: u64, y: Vec<f32>) -> Self {
        Self { generation, y }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.y
    }
}

/// Consume-once cache for the most recent activation.
#[derive(Debug, Clone, Default)]
pub enum ActivationSlot {
    /// No forward call has run yet.
    #[default]
    Vacant,
    /// Written by the latest forward call and not yet trained on.
    Fresh(Activation),
    /// The latest activation was already used by a training step.
    Consumed,
}

impl ActivationSlot {
    pub(crate) fn fill(&mut self, activation: Activation) {
        *self = ActivationSlot::Fresh(activation);
    }

    /// Take the fresh activation, leaving the slot `Consumed`.
    pub(crate) fn take(&mut self) -> Option<Activation> {
        match core::mem::replace(self, ActivationSlot::Consumed) {
            ActivationSlot::Fresh(a) => Some(a),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn is_vacant(&self) -> bool {
        matches!(self, ActivationSlot::Vacant)
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, ActivationSlot::Fresh(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    /// Cross-entropy of the target before the update.
    pub loss: f32,
    pub target_prob: f32,
    /// Whether `target_prob` cleared `CORRECT_THRESHOLD`.
    pub correct: bool,
    /// Target resonance after the nudge.
    pub resonance: f32,
}

impl Lung {
    /// Train the output projection toward `target` given `context`.
    ///
    /// Fails with `PrecondNotMet` (and leaves all state untouched) until a
    /// forward call has populated the activation cache at least once.
    pub fn train_step(&mut self, context: &[TokenId], target: TokenId) -> Result<TrainReport> {
        if self.slot.is_vacant() {
            warn!("train_step called before any forward pass; skipping update");
            return Err(LungError::PrecondNotMet(
                "train_step requires a prior forward call",
            ));
        }

        // Recompute the prediction for this exact context; the gradient below
        // must use the activation this call produced.
        let breath = self.forward(context);
        let activation = self.slot.take().ok_or(LungError::PrecondNotMet(
            "forward did not produce an activation",
        ))?;
        debug_assert_eq!(activation.generation(), breath.generation);

        let target = self.clamp_token(target);
        let vocab = self.cfg.vocab_size;
        let lr = self.cfg.learning_rate;
        let probs = &breath.probabilities;
        let target_prob = probs[target];

        // Wo[i][j] -= lr * y[i] * (probs[j] - one_hot[j])
        for (i, &yi) in activation.as_slice().iter().enumerate() {
            if yi == 0.0 {
                continue;
            }
            let row = &mut self.tensors.wo[i * vocab..(i + 1) * vocab];
            let scale = lr * yi;
            for (j, w) in row.iter_mut().enumerate() {
                let grad = if j == target { probs[j] - 1.0 } else { probs[j] };
                *w -= scale * grad;
            }
        }

        let correct = target_prob > CORRECT_THRESHOLD;
        let r = &mut self.resonance[target];
        *r = if correct {
            (*r + RESONANCE_REWARD).min(1.0)
        } else {
            (*r - RESONANCE_PENALTY).max(RESONANCE_FLOOR)
        };
        let resonance = *r;

        self.train_steps += 1;

        Ok(TrainReport {
            loss: -target_prob.max(1e-12).ln(),
            target_prob,
            correct,
            resonance,
        })
    }

    /// Whether a training step may run (some forward call has happened).
    pub fn can_train(&self) -> bool {
        !self.slot.is_vacant()
    }

    /// The cached activation, if the latest forward has not been trained on.
    pub fn pending_activation(&self) -> Option<&Activation> {
        match &self.slot {
            ActivationSlot::Fresh(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lung::LungConfig;

    fn small() -> Lung {
        Lung::new(LungConfig::with_dims(16, 8, 4, 2).with_seed(3)).unwrap()
    }

    #[test]
    fn train_before_forward_is_an_error_and_changes_nothing() {
        let mut lung = small();
        let wo_before = lung.tensors().wo.clone();
        let res_before = lung.resonance(2);
        let err = lung.train_step(&[1, 2], 2).unwrap_err();
        assert!(matches!(err, LungError::PrecondNotMet(_)));
        assert_eq!(lung.tensors().wo, wo_before);
        assert_eq!(lung.resonance(2), res_before);
        assert_eq!(lung.forward_count(), 0);
        assert_eq!(lung.train_steps(), 0);
    }

    #[test]
    fn slot_is_consume_once() {
        let mut slot = ActivationSlot::default();
        assert!(slot.take().is_none());
        assert!(slot.is_vacant());
        slot.fill(Activation::new(1, vec![1.0]));
        assert!(slot.is_fresh());
        assert_eq!(slot.take().map(|a| a.generation()), Some(1));
        assert!(slot.take().is_none());
        assert!(!slot.is_vacant());
    }

    #[test]
    fn training_consumes_the_activation_it_just_produced() {
        let mut lung = small();
        lung.forward(&[9, 9, 9]);
        assert_eq!(lung.pending_activation().map(|a| a.generation()), Some(1));
        lung.train_step(&[1, 2, 3], 4).unwrap();
        // The internal forward was generation 2 and it was consumed.
        assert_eq!(lung.forward_count(), 2);
        assert!(lung.pending_activation().is_none());
        assert!(lung.can_train());
        // A second step still works: it runs its own forward first.
        lung.train_step(&[1, 2, 3], 4).unwrap();
        assert_eq!(lung.train_steps(), 2);
    }

    #[test]
    fn gradient_matches_the_fresh_activation() {
        let mut lung = small();
        lung.forward(&[7]);

        // Reproduce the internal forward on a clone to get y and probs.
        let mut shadow = lung.clone();
        let breath = shadow.forward(&[1, 2]);
        let y = shadow.pending_activation().unwrap().as_slice().to_vec();

        let wo_before = lung.tensors().wo.clone();
        lung.train_step(&[1, 2], 5).unwrap();

        let vocab = lung.vocab_size();
        let lr = lung.config().learning_rate;
        for i in 0..lung.d_model() {
            for j in 0..vocab {
                let grad = breath.probabilities[j] - if j == 5 { 1.0 } else { 0.0 };
                let expected = wo_before[i * vocab + j] - lr * y[i] * grad;
                assert!((lung.tensors().wo[i * vocab + j] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn repeated_training_raises_target_probability() {
        let mut lung = Lung::new(
            LungConfig::with_dims(16, 8, 4, 2)
                .with_seed(5)
                .with_learning_rate(0.5),
        )
        .unwrap();
        lung.forward(&[1, 2, 3]);
        let first = lung.train_step(&[1, 2, 3], 7).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = lung.train_step(&[1, 2, 3], 7).unwrap();
        }
        assert!(last.target_prob > first.target_prob);
        assert!(last.loss < first.loss);
    }

    #[test]
    fn resonance_rule_rewards_and_penalizes() {
        let mut lung = small();
        lung.forward(&[1]);
        lung.set_resonance(3, 0.5);
        let r = lung.train_step(&[1], 3).unwrap();
        // 16-way distribution from small random weights: near-uniform, p ≈ 1/16.
        assert!(!r.correct);
        assert!((r.resonance - 0.495).abs() < 1e-6);

        lung.set_resonance(3, 0.1);
        let r = lung.train_step(&[1], 3).unwrap();
        assert_eq!(r.resonance, RESONANCE_FLOOR);
    }

    #[test]
    fn out_of_range_target_is_clamped() {
        let mut lung = small();
        lung.forward(&[1]);
        let before = lung.resonance(15);
        let r = lung.train_step(&[1], 1000).unwrap();
        assert_eq!(r.resonance, lung.resonance(15));
        assert_ne!(before, lung.resonance(15));
    }
}
