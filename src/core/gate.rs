//! Injection gate: decides whether an incoming token sequence resonates with
//! the lung or gets pushed into dark matter.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::dark_matter::DarkMatter;
use crate::lung::{Lung, TokenId};
use crate::prng;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GateConfig {
    /// Accept when the resonance field is strictly above this.
    pub accept_threshold: f32,
    /// How many of the most likely tokens steer the movement vector.
    pub top_k: usize,
    pub base_amplitude: f32,
    /// Resonance added to each injected id on acceptance.
    pub accept_boost: f32,
    /// Resonance removed from each injected id on rejection.
    pub reject_decay: f32,
    /// Presence added to each injected id on acceptance.
    pub presence_bump: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.4,
            top_k: 10,
            base_amplitude: 0.05,
            accept_boost: 0.02,
            reject_decay: 0.01,
            presence_bump: 0.1,
        }
    }
}

impl GateConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.accept_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.accept_threshold.is_finite() {
            return Err("accept_threshold must be finite");
        }
        if self.top_k == 0 {
            return Err("top_k must be > 0");
        }
        for v in [
            self.base_amplitude,
            self.accept_boost,
            self.reject_decay,
            self.presence_bump,
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err("gate rates must be finite and >= 0");
            }
        }
        Ok(())
    }
}

/// Field signals from the movement collaborator. Both are clamped to [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldPulse {
    pub drift: f32,
    pub dissonance: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Injection {
    pub dx: f32,
    pub dy: f32,
    pub accepted: bool,
    /// Mass of the scar left behind; 0 when accepted.
    pub scar_mass: f32,
    /// Resonance field the verdict was based on.
    pub resonance_field: f32,
}

#[derive(Debug, Clone, Default)]
pub struct InjectionGate {
    cfg: GateConfig,
}

impl InjectionGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    /// Feed `tokens` through the lung and apply the accept/reject policy.
    ///
    /// An empty sequence is a no-op: no forward call, no state change, zero
    /// movement.
    pub fn inject(
        &self,
        lung: &mut Lung,
        dark: &mut DarkMatter,
        tokens: &[TokenId],
        pulse: FieldPulse,
    ) -> Injection {
        if tokens.is_empty() {
            return Injection::default();
        }

        let breath = lung.forward(tokens);
        let rf = breath.resonance_field;
        let entropy = breath.entropy;

        let mut dx = 0.0f32;
        let mut dy = 0.0f32;
        for tok in crate::tensor::top_k(&breath.probabilities, self.cfg.top_k) {
            let p = breath.probabilities[tok];
            let theta = token_angle(tok as TokenId);
            dx += p * theta.cos();
            dy += p * theta.sin();
        }
        let drift = clamp01(pulse.drift);
        let dissonance = clamp01(pulse.dissonance);
        let amplitude =
            self.cfg.base_amplitude * (1.0 + 0.25 * entropy) * (1.0 + drift) * (1.0 + dissonance);
        dx *= amplitude;
        dy *= amplitude;

        if rf > self.cfg.accept_threshold {
            for &t in tokens {
                let id = lung.clamp_token(t);
                lung.boost_resonance(id as TokenId, self.cfg.accept_boost);
                lung.pulse_presence(id, self.cfg.presence_bump);
            }
            debug!(resonance_field = rf, entropy, "injection accepted");
            Injection {
                dx,
                dy,
                accepted: true,
                scar_mass: 0.0,
                resonance_field: rf,
            }
        } else {
            // The scar records the ids the lung actually read.
            let seen: Vec<TokenId> = tokens
                .iter()
                .map(|&t| lung.clamp_token(t) as TokenId)
                .collect();
            for &id in &seen {
                lung.decay_resonance(id, self.cfg.reject_decay);
            }
            let mass = (1.0 - rf) * (1.0 + entropy * 0.5);
            let scar_mass = match dark.deposit(&seen, mass) {
                Some(_) => mass,
                None => 0.0,
            };
            debug!(resonance_field = rf, entropy, scar_mass, "injection rejected");
            Injection {
                dx: -dx * 0.5,
                dy: -dy * 0.5,
                accepted: false,
                scar_mass,
                resonance_field: rf,
            }
        }
    }
}

/// Fixed direction for a token: `hash(token) / 2^32 · 2π`.
pub fn token_angle(token: TokenId) -> f32 {
    let h = (prng::hash_tokens(0, &[token]) >> 32) as u32;
    (h as f64 / 4_294_967_296.0 * core::f64::consts::TAU) as f32
}

#[inline]
fn clamp01(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
