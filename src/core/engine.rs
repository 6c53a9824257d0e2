//! Common surface for anything that behaves like a lung.
//!
//! Two implementations exist: the in-process [`Lung`] and
//! [`ForeignLung`](crate::mirror::ForeignLung), which drives the same engine
//! through its C ABI. Both must produce identical trajectories for the same
//! seed and call sequence.

use crate::error::Result;
use crate::lung::{Lung, TokenId, STATE_LEN};

pub trait Engine {
    fn name(&self) -> &'static str;

    fn vocab_size(&self) -> usize;
    fn d_model(&self) -> usize;
    fn ctx_len(&self) -> usize;

    /// Run one forward pass; returns the entropy of the output distribution.
    fn forward(&mut self, context: &[TokenId]) -> f32;

    /// One training step; returns the cross-entropy loss before the update.
    fn train_step(&mut self, context: &[TokenId], target: TokenId) -> Result<f32>;

    /// Owned copies of the last inference buffers; `None` before any forward.
    fn probs(&self) -> Option<Vec<f32>>;
    fn logits(&self) -> Option<Vec<f32>>;
    fn attention(&self) -> Option<Vec<f32>>;

    fn argmax(&self) -> Option<TokenId>;
    fn top_k(&self, k: usize) -> Vec<TokenId>;
    fn token_prob(&self, token: TokenId) -> f32;

    fn set_focus(&mut self, focus: f32);
    fn set_spread(&mut self, spread: f32);
    fn set_temporal_alpha(&mut self, alpha: f32);
    fn set_rtl(&mut self, use_rtl: bool);

    fn resonance(&self, token: TokenId) -> f32;
    fn boost_resonance(&mut self, token: TokenId, amount: f32);
    fn decay_resonance(&mut self, token: TokenId, amount: f32);

    fn state(&self) -> [f32; STATE_LEN];
}

impl Engine for Lung {
    fn name(&self) -> &'static str {
        "lung"
    }

    fn vocab_size(&self) -> usize {
        Lung::vocab_size(self)
    }

    fn d_model(&self) -> usize {
        Lung::d_model(self)
    }

    fn ctx_len(&self) -> usize {
        Lung::ctx_len(self)
    }

    fn forward(&mut self, context: &[TokenId]) -> f32 {
        Lung::forward(self, context).entropy
    }

    fn train_step(&mut self, context: &[TokenId], target: TokenId) -> Result<f32> {
        Lung::train_step(self, context, target).map(|r| r.loss)
    }

    fn probs(&self) -> Option<Vec<f32>> {
        self.copy_probs()
    }

    fn logits(&self) -> Option<Vec<f32>> {
        self.last_logits().map(<[f32]>::to_vec)
    }

    fn attention(&self) -> Option<Vec<f32>> {
        self.last_attention().map(<[f32]>::to_vec)
    }

    fn argmax(&self) -> Option<TokenId> {
        Lung::argmax(self)
    }

    fn top_k(&self, k: usize) -> Vec<TokenId> {
        Lung::top_k(self, k)
    }

    fn token_prob(&self, token: TokenId) -> f32 {
        Lung::token_prob(self, token)
    }

    fn set_focus(&mut self, focus: f32) {
        Lung::set_focus(self, focus)
    }

    fn set_spread(&mut self, spread: f32) {
        Lung::set_spread(self, spread)
    }

    fn set_temporal_alpha(&mut self, alpha: f32) {
        Lung::set_temporal_alpha(self, alpha)
    }

    fn set_rtl(&mut self, use_rtl: bool) {
        Lung::set_rtl(self, use_rtl)
    }

    fn resonance(&self, token: TokenId) -> f32 {
        Lung::resonance(self, token)
    }

    fn boost_resonance(&mut self, token: TokenId, amount: f32) {
        Lung::boost_resonance(self, token, amount)
    }

    fn decay_resonance(&mut self, token: TokenId, amount: f32) {
        Lung::decay_resonance(self, token, amount)
    }

    fn state(&self) -> [f32; STATE_LEN] {
        self.state_mirror()
    }
}
