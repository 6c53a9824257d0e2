//! The lung: a bidirectional multi-head attention kernel.
//!
//! Unlike a standard decoder:
//! - there is no causal mask (the query attends to every slot in the window)
//! - two positional tables exist (left-to-right and right-to-left reading)
//! - per-token resonance modulates attention scores
//! - a decaying presence trace modulates logits
//! - `temporal_alpha` tilts attention toward the "future" or "past" side
//!
//! Only the output projection learns by gradient (see `notorch`); head
//! projections are fixed random features.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::trace;

use crate::error::{LungError, Result};
use crate::notorch::{Activation, ActivationSlot};
use crate::prng::Prng;
use crate::tensor::{self, DotFn, HeadProjection, Tensors};

pub type TokenId = u32;

/// Resonance modulation strength on attention scores.
pub const RESONANCE_ATTENTION_COUPLING: f32 = 0.3;
/// Presence modulation strength on logits.
pub const PRESENCE_LOGIT_COUPLING: f32 = 0.15;
pub const PRESENCE_DECAY: f32 = 0.98;
pub const PRESENCE_INCREMENT: f32 = 0.1;
/// Magnitude of the prophecy/retrodiction score bias at full tilt.
pub const TEMPORAL_BIAS_STRENGTH: f32 = 0.1;

pub const FOCUS_SCALE_MIN: f32 = 0.25;
pub const FOCUS_SCALE_RANGE: f32 = 1.75;
pub const SPREAD_SCALE_MIN: f32 = 0.15;
pub const SPREAD_SCALE_RANGE: f32 = 2.0;

/// Alpha below this reads as retrodiction.
pub const RETRODICTION_BELOW: f32 = 0.4;
/// Alpha above this reads as prophecy.
pub const PROPHECY_ABOVE: f32 = 0.6;

const ASYMMETRY_EPS: f32 = 1e-6;

/// Execution tier for the forward pass.
///
/// - `Scalar`: single-threaded baseline (default, works everywhere)
/// - `Simd`: four-lane dot products via `wide` (requires `simd` feature)
/// - `Parallel`: heads computed on the rayon pool (requires `parallel` feature)
///
/// `Parallel` merges head results in head order, so it is bit-identical to
/// `Scalar`. `Simd` reorders additions and agrees only within float tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LungConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub ctx_len: usize,
    pub n_heads: usize,

    // If set, makes initialization reproducible; otherwise seed 1 is used.
    pub seed: Option<u64>,

    /// SGD step size for the output projection.
    pub learning_rate: f32,

    // Initial attention physics (the setters clamp later writes).
    pub attend_focus: f32,
    pub attend_spread: f32,
    pub temporal_alpha: f32,
    pub use_rtl: bool,

    pub execution_tier: ExecutionTier,
}

impl Default for LungConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            d_model: 32,
            ctx_len: 16,
            n_heads: 4,
            seed: None,
            learning_rate: 0.01,
            attend_focus: 0.70,
            attend_spread: 0.20,
            temporal_alpha: 0.5,
            use_rtl: false,
            execution_tier: ExecutionTier::Scalar,
        }
    }
}

impl LungConfig {
    pub fn with_dims(vocab_size: usize, d_model: usize, ctx_len: usize, n_heads: usize) -> Self {
        Self {
            vocab_size,
            d_model,
            ctx_len,
            n_heads,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }

    pub fn head_dim(&self) -> usize {
        if self.n_heads == 0 {
            0
        } else {
            self.d_model / self.n_heads
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(LungError::config("vocab_size", "must be > 0"));
        }
        if self.vocab_size > i32::MAX as usize {
            return Err(LungError::config("vocab_size", "must fit in i32"));
        }
        if self.d_model == 0 {
            return Err(LungError::config("d_model", "must be > 0"));
        }
        if self.ctx_len == 0 {
            return Err(LungError::config("ctx_len", "must be > 0"));
        }
        if self.n_heads == 0 {
            return Err(LungError::config("n_heads", "must be > 0"));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(LungError::config("d_model", "must be divisible by n_heads"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(LungError::config("learning_rate", "must be finite and >= 0"));
        }
        for (field, v) in [
            ("attend_focus", self.attend_focus),
            ("attend_spread", self.attend_spread),
            ("temporal_alpha", self.temporal_alpha),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(LungError::config(field, "must be in [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Discrete reading of `temporal_alpha`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TemporalMode {
    Retrodiction,
    Symmetric,
    Prophecy,
}

impl TemporalMode {
    pub fn from_alpha(alpha: f32) -> Self {
        if alpha < RETRODICTION_BELOW {
            TemporalMode::Retrodiction
        } else if alpha > PROPHECY_ABOVE {
            TemporalMode::Prophecy
        } else {
            TemporalMode::Symmetric
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TemporalMode::Retrodiction => "retrodiction",
            TemporalMode::Symmetric => "symmetric",
            TemporalMode::Prophecy => "prophecy",
        }
    }

    /// Numeric code used by the state mirror.
    pub fn code(self) -> f32 {
        match self {
            TemporalMode::Retrodiction => -1.0,
            TemporalMode::Symmetric => 0.0,
            TemporalMode::Prophecy => 1.0,
        }
    }
}

/// Result of one forward call. All buffers are owned copies.
#[derive(Debug, Clone)]
pub struct Breath {
    /// Forward call that produced this breath (1-based).
    pub generation: u64,
    pub probabilities: Vec<f32>,
    /// Head-averaged attention over the window (`ctx_len` entries).
    pub attention: Vec<f32>,
    pub entropy: f32,
    pub perplexity: f32,
    /// `Σ probs[i] · resonance[i]` after the call.
    pub resonance_field: f32,
    /// `(future - past) / (future + past)` over the attention halves, in [-1, 1].
    pub temporal_asymmetry: f32,
    pub temporal_mode: TemporalMode,
}

/// Inference state kept for getters after a forward call.
#[derive(Debug, Clone)]
pub(crate) struct Inference {
    pub(crate) logits: Vec<f32>,
    pub(crate) probs: Vec<f32>,
    pub(crate) attention: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Stone interface: fixed-order scalar mirror
// ---------------------------------------------------------------------------

/// Layout version written into slot 0 of the state mirror.
pub const STATE_VERSION: u32 = 1;
/// Number of scalars in the version-1 mirror.
pub const STATE_LEN: usize = 14;

/// Slot names for the state mirror. External callers index by position, so
/// discriminants never change; new fields are appended only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StateField {
    Version = 0,
    VocabSize = 1,
    DModel = 2,
    CtxLen = 3,
    NHeads = 4,
    HeadDim = 5,
    AttendFocus = 6,
    AttendSpread = 7,
    TemporalAlpha = 8,
    UseRtl = 9,
    TemporalMode = 10,
    ForwardCount = 11,
    TrainSteps = 12,
    LastEntropy = 13,
}

impl StateField {
    pub const ALL: [StateField; STATE_LEN] = [
        StateField::Version,
        StateField::VocabSize,
        StateField::DModel,
        StateField::CtxLen,
        StateField::NHeads,
        StateField::HeadDim,
        StateField::AttendFocus,
        StateField::AttendSpread,
        StateField::TemporalAlpha,
        StateField::UseRtl,
        StateField::TemporalMode,
        StateField::ForwardCount,
        StateField::TrainSteps,
        StateField::LastEntropy,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StateField::Version => "version",
            StateField::VocabSize => "vocab_size",
            StateField::DModel => "d_model",
            StateField::CtxLen => "ctx_len",
            StateField::NHeads => "n_heads",
            StateField::HeadDim => "head_dim",
            StateField::AttendFocus => "attend_focus",
            StateField::AttendSpread => "attend_spread",
            StateField::TemporalAlpha => "temporal_alpha",
            StateField::UseRtl => "use_rtl",
            StateField::TemporalMode => "temporal_mode",
            StateField::ForwardCount => "forward_count",
            StateField::TrainSteps => "train_steps",
            StateField::LastEntropy => "last_entropy",
        }
    }
}

// ---------------------------------------------------------------------------
// Lung
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Lung {
    pub(crate) cfg: LungConfig,
    pub(crate) tensors: Tensors,

    // Notorch state, both kept in [0, 1].
    pub(crate) resonance: Vec<f32>,
    pub(crate) presence: Vec<f32>,

    pub(crate) attend_focus: f32,
    pub(crate) attend_spread: f32,
    pub(crate) temporal_alpha: f32,
    pub(crate) use_rtl: bool,
    pub(crate) tier: ExecutionTier,

    pub(crate) last: Option<Inference>,
    pub(crate) slot: ActivationSlot,

    pub(crate) forward_count: u64,
    pub(crate) train_steps: u64,
    pub(crate) last_entropy: f32,

    // Work buffer: ctx_len × d_model token vectors.
    x: Vec<f32>,
}

/// Everything one head needs, borrowed so heads can run on the rayon pool.
struct HeadInput<'a> {
    x: &'a [f32],
    tokens: &'a [usize],
    resonance: &'a [f32],
    d_model: usize,
    head_dim: usize,
    use_rtl: bool,
    temporal_bias: f32,
    focus_scale: f32,
    spread_divisor: f32,
    dot: DotFn,
}

struct HeadOutput {
    row: Vec<f32>,
    out: Vec<f32>,
}

impl Lung {
    pub fn new(cfg: LungConfig) -> Result<Self> {
        cfg.validate()?;

        let mut rng = Prng::new(cfg.seed.unwrap_or(1));
        let tensors = Tensors::new(cfg.vocab_size, cfg.d_model, cfg.ctx_len, cfg.n_heads, &mut rng);

        let resonance = (0..cfg.vocab_size)
            .map(|_| 0.5 + rng.next_f32_01() * 0.5)
            .collect();

        Ok(Self::from_parts(
            cfg,
            tensors,
            resonance,
            vec![0.0; cfg.vocab_size],
        ))
    }

    /// Assemble a lung from already-validated parts. Knobs start from `cfg`,
    /// counters at zero, activation slot `Vacant`.
    pub(crate) fn from_parts(
        cfg: LungConfig,
        tensors: Tensors,
        resonance: Vec<f32>,
        presence: Vec<f32>,
    ) -> Self {
        Self {
            resonance,
            presence,
            attend_focus: cfg.attend_focus,
            attend_spread: cfg.attend_spread,
            temporal_alpha: cfg.temporal_alpha,
            use_rtl: cfg.use_rtl,
            tier: cfg.execution_tier,
            last: None,
            slot: ActivationSlot::Vacant,
            forward_count: 0,
            train_steps: 0,
            last_entropy: 0.0,
            x: vec![0.0; cfg.ctx_len * cfg.d_model],
            tensors,
            cfg,
        }
    }

    pub fn config(&self) -> &LungConfig {
        &self.cfg
    }

    pub fn tensors(&self) -> &Tensors {
        &self.tensors
    }

    pub fn vocab_size(&self) -> usize {
        self.cfg.vocab_size
    }

    pub fn d_model(&self) -> usize {
        self.cfg.d_model
    }

    pub fn ctx_len(&self) -> usize {
        self.cfg.ctx_len
    }

    pub fn n_heads(&self) -> usize {
        self.cfg.n_heads
    }

    pub fn head_dim(&self) -> usize {
        self.tensors.head_dim
    }

    pub fn forward_count(&self) -> u64 {
        self.forward_count
    }

    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    pub fn last_entropy(&self) -> f32 {
        self.last_entropy
    }

    // =========================================================================
    // Execution tier
    // =========================================================================

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    pub fn execution_tier(&self) -> ExecutionTier {
        self.tier
    }

    /// Tier that will actually run, after compile-time feature gates.
    pub fn effective_execution_tier(&self) -> ExecutionTier {
        match self.tier {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }

    fn dot_kernel(&self) -> DotFn {
        match self.effective_execution_tier() {
            #[cfg(feature = "simd")]
            ExecutionTier::Simd => tensor::dot_simd as DotFn,
            _ => tensor::dot as DotFn,
        }
    }

    // =========================================================================
    // Forward pass
    // =========================================================================

    /// Clamp an external id into the vocabulary.
    #[inline]
    pub fn clamp_token(&self, token: TokenId) -> usize {
        (token as usize).min(self.cfg.vocab_size - 1)
    }

    /// The most recent `ctx_len` tokens, clamped and left-padded with 0.
    /// Returns the window and the number of padding slots at its start.
    fn window(&self, context: &[TokenId]) -> (Vec<usize>, usize) {
        let ctx = self.cfg.ctx_len;
        let n = context.len().min(ctx);
        let pad = ctx - n;
        let mut tokens = vec![0usize; ctx];
        for (slot, &t) in tokens[pad..].iter_mut().zip(&context[context.len() - n..]) {
            *slot = self.clamp_token(t);
        }
        (tokens, pad)
    }

    /// Run one breath over `context`.
    ///
    /// Overwrites the cached activation, the inference getters and the
    /// presence trace.
    pub fn forward(&mut self, context: &[TokenId]) -> Breath {
        let ctx = self.cfg.ctx_len;
        let d = self.cfg.d_model;
        let vocab = self.cfg.vocab_size;
        let n_heads = self.cfg.n_heads;
        let head_dim = self.tensors.head_dim;

        let (tokens, pad) = self.window(context);

        // X[t] = E[token[t]] + P[t]
        for (t, &tok) in tokens.iter().enumerate() {
            let e = self.tensors.embedding(tok);
            let p = self.tensors.positional_row(self.use_rtl, t);
            let row = &mut self.x[t * d..(t + 1) * d];
            for i in 0..d {
                row[i] = e[i] + p[i];
            }
        }

        let spread_divisor =
            (SPREAD_SCALE_MIN + SPREAD_SCALE_RANGE * self.attend_spread).max(SPREAD_SCALE_MIN);
        let input = HeadInput {
            x: &self.x,
            tokens: &tokens,
            resonance: &self.resonance,
            d_model: d,
            head_dim,
            use_rtl: self.use_rtl,
            temporal_bias: (self.temporal_alpha - 0.5) * 2.0,
            focus_scale: FOCUS_SCALE_MIN + FOCUS_SCALE_RANGE * self.attend_focus,
            spread_divisor,
            dot: self.dot_kernel(),
        };

        let heads: Vec<HeadOutput> = match self.effective_execution_tier() {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel => self
                .tensors
                .heads
                .par_iter()
                .map(|h| attend_head(&input, h))
                .collect(),
            _ => self
                .tensors
                .heads
                .iter()
                .map(|h| attend_head(&input, h))
                .collect(),
        };

        // Combine heads: averaged attention (diagnostic) and concatenated output.
        let mut attention = vec![0.0f32; ctx];
        let mut y = vec![0.0f32; d];
        let head_weight = 1.0 / n_heads as f32;
        for (h, head) in heads.iter().enumerate() {
            tensor::axpy(&mut attention, &head.row, head_weight);
            y[h * head_dim..(h + 1) * head_dim].copy_from_slice(&head.out);
        }

        // logits = Wo^T · y, then presence pulse.
        let mut inference = self.last.take().unwrap_or_else(|| Inference {
            logits: vec![0.0; vocab],
            probs: vec![0.0; vocab],
            attention: vec![0.0; ctx],
        });
        tensor::mat_vec_t(&mut inference.logits, &self.tensors.wo, &y, vocab);
        for (l, &p) in inference.logits.iter_mut().zip(&self.presence) {
            *l *= 1.0 + p * PRESENCE_LOGIT_COUPLING;
        }
        inference.probs.copy_from_slice(&inference.logits);
        tensor::softmax(&mut inference.probs);
        inference.attention.copy_from_slice(&attention);

        // Presence: decay everything, then pulse the real tokens in the window.
        for p in &mut self.presence {
            *p *= PRESENCE_DECAY;
        }
        for &tok in &tokens[pad..] {
            self.presence[tok] = (self.presence[tok] + PRESENCE_INCREMENT).min(1.0);
        }

        let entropy = tensor::entropy(&inference.probs);
        let resonance_field = tensor::dot(&inference.probs, &self.resonance);
        let temporal_asymmetry = temporal_asymmetry(&attention, self.use_rtl);

        self.forward_count += 1;
        let generation = self.forward_count;
        self.last_entropy = entropy;
        self.slot.fill(Activation::new(generation, y));

        trace!(
            generation,
            entropy,
            resonance_field,
            temporal_asymmetry,
            "lung forward"
        );

        let breath = Breath {
            generation,
            probabilities: inference.probs.clone(),
            attention,
            entropy,
            perplexity: entropy.exp(),
            resonance_field,
            temporal_asymmetry,
            temporal_mode: self.temporal_mode(),
        };
        self.last = Some(inference);
        breath
    }

    // =========================================================================
    // Inference getters
    // =========================================================================

    pub fn last_logits(&self) -> Option<&[f32]> {
        self.last.as_ref().map(|i| i.logits.as_slice())
    }

    pub fn last_probs(&self) -> Option<&[f32]> {
        self.last.as_ref().map(|i| i.probs.as_slice())
    }

    pub fn last_attention(&self) -> Option<&[f32]> {
        self.last.as_ref().map(|i| i.attention.as_slice())
    }

    /// Independent copy of the last probability vector.
    pub fn copy_probs(&self) -> Option<Vec<f32>> {
        self.last_probs().map(|p| p.to_vec())
    }

    pub fn argmax(&self) -> Option<TokenId> {
        self.last_logits()
            .and_then(tensor::argmax)
            .map(|i| i as TokenId)
    }

    /// Up to `k` token ids ordered by logit, highest first.
    pub fn top_k(&self, k: usize) -> Vec<TokenId> {
        self.last_logits()
            .map(|l| tensor::top_k(l, k).into_iter().map(|i| i as TokenId).collect())
            .unwrap_or_default()
    }

    /// Probability of `token` from the last forward; 0 when out of range or
    /// before any forward call.
    pub fn token_prob(&self, token: TokenId) -> f32 {
        self.last_probs()
            .and_then(|p| p.get(token as usize).copied())
            .unwrap_or(0.0)
    }

    /// `Σ probs[i] · resonance[i]` against the current resonance vector.
    pub fn resonance_field(&self) -> Option<f32> {
        self.last_probs().map(|p| tensor::dot(p, &self.resonance))
    }

    // =========================================================================
    // Attention physics
    // =========================================================================

    pub fn set_focus(&mut self, focus: f32) {
        self.attend_focus = clamp_unit(focus, self.attend_focus);
    }

    pub fn set_spread(&mut self, spread: f32) {
        self.attend_spread = clamp_unit(spread, self.attend_spread);
    }

    pub fn set_temporal_alpha(&mut self, alpha: f32) {
        self.temporal_alpha = clamp_unit(alpha, self.temporal_alpha);
    }

    pub fn set_rtl(&mut self, use_rtl: bool) {
        self.use_rtl = use_rtl;
    }

    pub fn focus(&self) -> f32 {
        self.attend_focus
    }

    pub fn spread(&self) -> f32 {
        self.attend_spread
    }

    pub fn temporal_alpha(&self) -> f32 {
        self.temporal_alpha
    }

    pub fn rtl(&self) -> bool {
        self.use_rtl
    }

    pub fn temporal_mode(&self) -> TemporalMode {
        TemporalMode::from_alpha(self.temporal_alpha)
    }

    // =========================================================================
    // Resonance / presence
    // =========================================================================

    pub fn resonance(&self, token: TokenId) -> f32 {
        self.resonance.get(token as usize).copied().unwrap_or(0.0)
    }

    pub fn resonance_slice(&self) -> &[f32] {
        &self.resonance
    }

    pub fn presence(&self, token: TokenId) -> f32 {
        self.presence.get(token as usize).copied().unwrap_or(0.0)
    }

    pub fn presence_slice(&self) -> &[f32] {
        &self.presence
    }

    pub fn boost_resonance(&mut self, token: TokenId, amount: f32) {
        if let Some(r) = self.resonance.get_mut(token as usize) {
            *r = clamp_unit(*r + amount, *r);
        }
    }

    pub fn decay_resonance(&mut self, token: TokenId, amount: f32) {
        if let Some(r) = self.resonance.get_mut(token as usize) {
            *r = clamp_unit(*r - amount, *r);
        }
    }

    pub fn set_resonance(&mut self, token: TokenId, value: f32) {
        if let Some(r) = self.resonance.get_mut(token as usize) {
            *r = clamp_unit(value, *r);
        }
    }

    /// Overwrite every token's resonance with `value` (clamped).
    pub fn fill_resonance(&mut self, value: f32) {
        for r in &mut self.resonance {
            *r = clamp_unit(value, *r);
        }
    }

    pub(crate) fn pulse_presence(&mut self, token: usize, amount: f32) {
        if let Some(p) = self.presence.get_mut(token) {
            *p = clamp_unit(*p + amount, *p);
        }
    }

    // =========================================================================
    // State mirror
    // =========================================================================

    pub fn state_mirror(&self) -> [f32; STATE_LEN] {
        let mut out = [0.0; STATE_LEN];
        for field in StateField::ALL {
            out[field.index()] = self.state_field(field);
        }
        out
    }

    /// Write the mirror into `out`; returns the number of slots written
    /// (`min(out.len(), STATE_LEN)`).
    pub fn copy_state(&self, out: &mut [f32]) -> usize {
        let mirror = self.state_mirror();
        let n = out.len().min(STATE_LEN);
        out[..n].copy_from_slice(&mirror[..n]);
        n
    }

    pub fn state_field(&self, field: StateField) -> f32 {
        match field {
            StateField::Version => STATE_VERSION as f32,
            StateField::VocabSize => self.cfg.vocab_size as f32,
            StateField::DModel => self.cfg.d_model as f32,
            StateField::CtxLen => self.cfg.ctx_len as f32,
            StateField::NHeads => self.cfg.n_heads as f32,
            StateField::HeadDim => self.tensors.head_dim as f32,
            StateField::AttendFocus => self.attend_focus,
            StateField::AttendSpread => self.attend_spread,
            StateField::TemporalAlpha => self.temporal_alpha,
            StateField::UseRtl => {
                if self.use_rtl {
                    1.0
                } else {
                    0.0
                }
            }
            StateField::TemporalMode => self.temporal_mode().code(),
            StateField::ForwardCount => self.forward_count as f32,
            StateField::TrainSteps => self.train_steps as f32,
            StateField::LastEntropy => self.last_entropy,
        }
    }
}

/// Clamp into [0, 1]; NaN falls back to `fallback`.
#[inline]
fn clamp_unit(x: f32, fallback: f32) -> f32 {
    if x.is_nan() {
        fallback
    } else {
        x.clamp(0.0, 1.0)
    }
}

fn attend_head(input: &HeadInput<'_>, head: &HeadProjection) -> HeadOutput {
    let ctx = input.tokens.len();
    let d = input.d_model;
    let hd = input.head_dim;
    let last = ctx - 1;
    let inv_sqrt = 1.0 / (hd as f32).sqrt();

    let mut q = vec![0.0f32; hd];
    let mut k = vec![0.0f32; hd];
    let mut v = vec![0.0f32; hd];

    // Query from the last slot only.
    tensor::mat_vec(&mut q, &head.wq, &input.x[last * d..(last + 1) * d], d, input.dot);

    let mut row = vec![0.0f32; ctx];
    for (t, score_out) in row.iter_mut().enumerate() {
        let x_t = &input.x[t * d..(t + 1) * d];
        tensor::mat_vec(&mut k, &head.wk, x_t, d, input.dot);
        let mut score = (input.dot)(&q, &k) * inv_sqrt;

        score *= 1.0 + input.resonance[input.tokens[t]] * RESONANCE_ATTENTION_COUPLING;

        // Positive sign: slot t is earlier than the query.
        let sign = match last.cmp(&t) {
            core::cmp::Ordering::Greater => 1.0,
            core::cmp::Ordering::Less => -1.0,
            core::cmp::Ordering::Equal => 0.0,
        };
        if input.use_rtl {
            // Earlier slots read as future.
            score += input.temporal_bias * sign * TEMPORAL_BIAS_STRENGTH;
        } else {
            // Earlier slots read as past.
            score -= input.temporal_bias * sign * TEMPORAL_BIAS_STRENGTH;
        }

        score *= input.focus_scale;
        score /= input.spread_divisor;
        *score_out = score;
    }
    tensor::softmax(&mut row);

    let mut out = vec![0.0f32; hd];
    for (t, &w) in row.iter().enumerate() {
        tensor::mat_vec(&mut v, &head.wv, &input.x[t * d..(t + 1) * d], d, input.dot);
        tensor::axpy(&mut out, &v, w);
    }

    HeadOutput { row, out }
}

/// Compare attention mass on the "future" half of the window against the
/// "past" half under the current reading direction.
pub fn temporal_asymmetry(attention: &[f32], use_rtl: bool) -> f32 {
    let mid = attention.len() / 2;
    let early: f32 = attention[..mid].iter().sum();
    let late: f32 = attention[mid..].iter().sum();
    let (future, past) = if use_rtl { (early, late) } else { (late, early) };
    ((future - past) / (future + past + ASYMMETRY_EPS)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Lung {
        Lung::new(LungConfig::with_dims(32, 16, 8, 4).with_seed(42)).unwrap()
    }

    #[test]
    fn rejects_bad_dimensions() {
        for cfg in [
            LungConfig::with_dims(0, 16, 8, 4),
            LungConfig::with_dims(32, 0, 8, 4),
            LungConfig::with_dims(32, 16, 0, 4),
            LungConfig::with_dims(32, 16, 8, 0),
            LungConfig::with_dims(32, 18, 8, 4),
        ] {
            assert!(matches!(
                Lung::new(cfg),
                Err(LungError::Configuration { .. })
            ));
        }
        assert!(Lung::new(LungConfig::default().with_learning_rate(f32::NAN)).is_err());
    }

    #[test]
    fn getters_are_empty_before_forward() {
        let lung = small();
        assert!(lung.last_probs().is_none());
        assert!(lung.last_logits().is_none());
        assert!(lung.last_attention().is_none());
        assert!(lung.copy_probs().is_none());
        assert_eq!(lung.argmax(), None);
        assert!(lung.top_k(3).is_empty());
        assert_eq!(lung.token_prob(0), 0.0);
        assert_eq!(lung.resonance_field(), None);
    }

    #[test]
    fn forward_produces_normalized_outputs() {
        let mut lung = small();
        let b = lung.forward(&[1, 2, 3]);
        let s: f32 = b.probabilities.iter().sum();
        assert!((s - 1.0).abs() < 1e-2);
        assert_eq!(b.attention.len(), 8);
        let a: f32 = b.attention.iter().sum();
        assert!((a - 1.0).abs() < 1e-2);
        assert!(b.entropy > 0.0 && b.entropy <= (32f32).ln() + 1e-4);
        assert!((b.perplexity - b.entropy.exp()).abs() < 1e-4);
        assert!((-1.0..=1.0).contains(&b.temporal_asymmetry));
        assert_eq!(b.generation, 1);
        assert_eq!(lung.forward_count(), 1);
    }

    #[test]
    fn long_context_keeps_most_recent_tokens() {
        let mut a = small();
        let mut b = small();
        let long: Vec<TokenId> = (0..20).collect();
        let tail: Vec<TokenId> = (12..20).collect();
        let pa = a.forward(&long).probabilities;
        let pb = b.forward(&tail).probabilities;
        assert_eq!(pa, pb);
    }

    #[test]
    fn out_of_range_tokens_are_clamped_not_rejected() {
        let mut a = small();
        let mut b = small();
        let pa = a.forward(&[5, 9999]).probabilities;
        let pb = b.forward(&[5, 31]).probabilities;
        assert_eq!(pa, pb);
        assert_eq!(a.presence(31), b.presence(31));
        assert!(a.presence(31) > 0.0);
    }

    #[test]
    fn presence_pulses_only_context_tokens() {
        let mut lung = small();
        lung.forward(&[3]);
        assert!((lung.presence(3) - PRESENCE_INCREMENT).abs() < 1e-6);
        // Padding is token 0 but does not count as presence.
        assert_eq!(lung.presence(0), 0.0);
        lung.forward(&[4]);
        assert!((lung.presence(3) - PRESENCE_INCREMENT * PRESENCE_DECAY).abs() < 1e-6);
        for _ in 0..50 {
            lung.forward(&[4, 4, 4]);
        }
        assert!(lung.presence(4) <= 1.0);
    }

    #[test]
    fn setters_clamp() {
        let mut lung = small();
        lung.set_focus(3.0);
        lung.set_spread(-1.0);
        lung.set_temporal_alpha(f32::NAN);
        assert_eq!(lung.focus(), 1.0);
        assert_eq!(lung.spread(), 0.0);
        assert_eq!(lung.temporal_alpha(), 0.5);
    }

    #[test]
    fn nan_keeps_the_current_knob() {
        let mut lung = small();
        lung.set_focus(0.3);
        lung.set_spread(0.9);
        lung.set_temporal_alpha(0.75);
        lung.set_focus(f32::NAN);
        lung.set_spread(f32::NAN);
        lung.set_temporal_alpha(f32::NAN);
        assert_eq!(lung.focus(), 0.3);
        assert_eq!(lung.spread(), 0.9);
        assert_eq!(lung.temporal_alpha(), 0.75);
    }

    // One head, so the combined row is the head's own softmax row.
    const FULL_WINDOW: [TokenId; 8] = [3, 9, 14, 1, 22, 7, 30, 5];

    fn breathe(use_rtl: bool, alpha: f32, focus: f32, spread: f32) -> Breath {
        let mut lung = Lung::new(LungConfig::with_dims(32, 8, 8, 1).with_seed(7)).unwrap();
        lung.set_rtl(use_rtl);
        lung.set_temporal_alpha(alpha);
        lung.set_focus(focus);
        lung.set_spread(spread);
        lung.forward(&FULL_WINDOW)
    }

    fn last_slot(b: &Breath) -> f32 {
        b.attention[b.attention.len() - 1]
    }

    #[test]
    fn prophecy_leans_toward_later_slots_in_ltr() {
        let retro = breathe(false, 0.1, 0.7, 0.2);
        let prophecy = breathe(false, 0.9, 0.7, 0.2);
        assert!(last_slot(&prophecy) > last_slot(&retro));
        let early = |b: &Breath| b.attention[..7].iter().sum::<f32>();
        assert!(early(&prophecy) < early(&retro));
    }

    #[test]
    fn rtl_reverses_the_temporal_lean() {
        let retro = breathe(true, 0.1, 0.7, 0.2);
        let prophecy = breathe(true, 0.9, 0.7, 0.2);
        assert!(last_slot(&prophecy) < last_slot(&retro));
    }

    #[test]
    fn asymmetry_grows_with_alpha_in_ltr() {
        let a = breathe(false, 0.1, 0.7, 0.2).temporal_asymmetry;
        let b = breathe(false, 0.5, 0.7, 0.2).temporal_asymmetry;
        let c = breathe(false, 0.9, 0.7, 0.2).temporal_asymmetry;
        assert!(a < b && b < c, "{a} {b} {c}");
    }

    #[test]
    fn focus_sharpens_attention() {
        let loose = tensor::entropy(&breathe(false, 0.5, 0.0, 0.2).attention);
        let sharp = tensor::entropy(&breathe(false, 0.5, 1.0, 0.2).attention);
        assert!(sharp < loose, "{sharp} !< {loose}");
    }

    #[test]
    fn spread_softens_attention() {
        let tight = tensor::entropy(&breathe(false, 0.5, 0.7, 0.0).attention);
        let wide = tensor::entropy(&breathe(false, 0.5, 0.7, 1.0).attention);
        assert!(wide > tight, "{wide} !> {tight}");
    }

    #[test]
    fn temporal_labels_follow_alpha() {
        let mut lung = small();
        lung.set_temporal_alpha(0.8);
        assert_eq!(lung.temporal_mode().label(), "prophecy");
        lung.set_temporal_alpha(0.2);
        assert_eq!(lung.temporal_mode().label(), "retrodiction");
        lung.set_temporal_alpha(0.5);
        assert_eq!(lung.temporal_mode().label(), "symmetric");
        lung.set_temporal_alpha(7.0);
        assert_eq!(lung.temporal_alpha(), 1.0);
        assert_eq!(lung.temporal_mode(), TemporalMode::Prophecy);
        lung.set_temporal_alpha(-7.0);
        assert_eq!(lung.temporal_mode(), TemporalMode::Retrodiction);
    }

    #[test]
    fn resonance_mutators_stay_in_unit_range() {
        let mut lung = small();
        lung.boost_resonance(1, 5.0);
        assert_eq!(lung.resonance(1), 1.0);
        lung.decay_resonance(1, 5.0);
        assert_eq!(lung.resonance(1), 0.0);
        lung.set_resonance(2, 0.25);
        assert_eq!(lung.resonance(2), 0.25);
        lung.boost_resonance(999, 1.0);
        assert_eq!(lung.resonance(999), 0.0);
        lung.fill_resonance(0.6);
        assert!(lung.resonance_slice().iter().all(|&r| r == 0.6));
    }

    #[test]
    fn asymmetry_reads_direction() {
        let att = [0.1, 0.1, 0.4, 0.4];
        assert!(temporal_asymmetry(&att, false) > 0.5);
        assert!(temporal_asymmetry(&att, true) < -0.5);
        assert!(temporal_asymmetry(&[1.0], false) > 0.99);
    }

    #[test]
    fn state_mirror_order_is_stable() {
        let mut lung = small();
        lung.set_rtl(true);
        lung.set_temporal_alpha(0.9);
        lung.forward(&[1, 2]);
        let m = lung.state_mirror();
        assert_eq!(m[0], STATE_VERSION as f32);
        assert_eq!(m[1], 32.0);
        assert_eq!(m[2], 16.0);
        assert_eq!(m[3], 8.0);
        assert_eq!(m[4], 4.0);
        assert_eq!(m[5], 4.0);
        assert_eq!(m[9], 1.0);
        assert_eq!(m[10], 1.0);
        assert_eq!(m[11], 1.0);
        assert_eq!(m[12], 0.0);
        assert_eq!(m[13], lung.last_entropy());
        for (i, f) in StateField::ALL.iter().enumerate() {
            assert_eq!(f.index(), i);
        }

        let mut short = [0.0f32; 4];
        assert_eq!(lung.copy_state(&mut short), 4);
        assert_eq!(short[..], m[..4]);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_tier_is_bit_identical() {
        let mut a = small();
        let mut b = small();
        b.set_execution_tier(ExecutionTier::Parallel);
        assert_eq!(a.forward(&[1, 2, 3]).probabilities, b.forward(&[1, 2, 3]).probabilities);
    }

    #[cfg(feature = "simd")]
    #[test]
    fn simd_tier_agrees_within_tolerance() {
        let mut a = small();
        let mut b = small();
        b.set_execution_tier(ExecutionTier::Simd);
        let pa = a.forward(&[1, 2, 3]).probabilities;
        let pb = b.forward(&[1, 2, 3]).probabilities;
        for (x, y) in pa.iter().zip(&pb) {
            assert!((x - y).abs() < 1e-4);
        }
    }
}
