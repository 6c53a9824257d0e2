#[cfg(feature = "serde")]
use serde::Serialize;

use crate::body::Body;
use crate::dark_matter::Scar;
use crate::lung::{Lung, TokenId};

/// A read-only snapshot of what a lung is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the lung.
/// - Snapshotting is on-demand and allocates; the forward path is untouched.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LungSnapshot {
    pub vocab_size: usize,
    pub d_model: usize,
    pub ctx_len: usize,
    pub n_heads: usize,
    pub forward_count: u64,
    pub train_steps: u64,

    pub focus: f32,
    pub spread: f32,
    pub temporal_alpha: f32,
    pub rtl: bool,
    pub temporal_mode: &'static str,

    pub entropy: f32,
    pub perplexity: f32,
    /// `None` until the first forward call.
    pub resonance_field: Option<f32>,
    pub resonance: ResonanceStats,
    /// Most likely next tokens with their probabilities.
    pub top_tokens: Vec<(TokenId, f32)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ResonanceStats {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl ResonanceStats {
    fn of(xs: &[f32]) -> Self {
        if xs.is_empty() {
            return Self::default();
        }
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0;
        for &x in xs {
            min = min.min(x);
            max = max.max(x);
            sum += x;
        }
        Self {
            mean: sum / xs.len() as f32,
            min,
            max,
        }
    }
}

pub struct LungAdapter<'a> {
    lung: &'a Lung,
    top_n: usize,
}

impl<'a> LungAdapter<'a> {
    pub fn new(lung: &'a Lung) -> Self {
        Self { lung, top_n: 5 }
    }

    pub fn with_top_n(mut self, n: usize) -> Self {
        self.top_n = n;
        self
    }

    pub fn snapshot(&self) -> LungSnapshot {
        let l = self.lung;
        let entropy = l.last_entropy();
        LungSnapshot {
            vocab_size: l.vocab_size(),
            d_model: l.d_model(),
            ctx_len: l.ctx_len(),
            n_heads: l.n_heads(),
            forward_count: l.forward_count(),
            train_steps: l.train_steps(),
            focus: l.focus(),
            spread: l.spread(),
            temporal_alpha: l.temporal_alpha(),
            rtl: l.rtl(),
            temporal_mode: l.temporal_mode().label(),
            entropy,
            perplexity: entropy.exp(),
            resonance_field: l.resonance_field(),
            resonance: ResonanceStats::of(l.resonance_slice()),
            top_tokens: l
                .top_k(self.top_n)
                .into_iter()
                .map(|t| (t, l.token_prob(t)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BodySnapshot {
    pub lung: LungSnapshot,
    pub memory_ticks: u64,
    pub scar_count: usize,
    pub total_mass: f32,
    pub scars: Vec<Scar>,
}

pub struct BodyAdapter<'a> {
    body: &'a Body,
}

impl<'a> BodyAdapter<'a> {
    pub fn new(body: &'a Body) -> Self {
        Self { body }
    }

    pub fn snapshot(&self) -> BodySnapshot {
        let dm = &self.body.dark_matter;
        BodySnapshot {
            lung: LungAdapter::new(&self.body.lung).snapshot(),
            memory_ticks: dm.ticks(),
            scar_count: dm.len(),
            total_mass: dm.total_mass(),
            scars: dm.scars().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyConfig;
    use crate::gate::FieldPulse;
    use crate::lung::LungConfig;

    #[test]
    fn snapshot_before_forward_is_quiet() {
        let lung = Lung::new(LungConfig::with_dims(16, 8, 4, 2)).unwrap();
        let snap = LungAdapter::new(&lung).snapshot();
        assert_eq!(snap.forward_count, 0);
        assert_eq!(snap.resonance_field, None);
        assert!(snap.top_tokens.is_empty());
        assert_eq!(snap.temporal_mode, "symmetric");
        assert!(snap.resonance.min >= 0.5 && snap.resonance.max < 1.0);
    }

    #[test]
    fn body_snapshot_lists_scars() {
        let mut body = Body::new(BodyConfig::default()).unwrap();
        body.lung.fill_resonance(0.0);
        body.inject(&[1, 2], FieldPulse::default());
        let snap = BodyAdapter::new(&body).snapshot();
        assert_eq!(snap.scar_count, 1);
        assert_eq!(snap.scars.len(), 1);
        assert_eq!(snap.total_mass, snap.scars[0].mass);
        assert_eq!(snap.lung.forward_count, 1);
        assert_eq!(snap.lung.top_tokens.len(), 5);
        let p: Vec<f32> = snap.lung.top_tokens.iter().map(|&(_, p)| p).collect();
        assert!(p.windows(2).all(|w| w[0] >= w[1]));
    }
}
