//! `ForeignLung`: the engine driven only through its C ABI.
//!
//! Everything crosses the boundary the way a foreign host would see it:
//! an opaque handle, `i32` token ids, raw float buffers copied out right
//! after each call. Context and top-k scratch arrays live only for the call
//! that needs them.

use core::ptr::NonNull;
use std::slice;

use crate::engine::Engine;
use crate::error::{LungError, Result};
use crate::ffi;
use crate::lung::{Lung, LungConfig, TokenId, STATE_LEN};

pub struct ForeignLung {
    handle: NonNull<Lung>,
    vocab_size: usize,
    d_model: usize,
    ctx_len: usize,
}

impl ForeignLung {
    /// Create through `lung_create` and mirror `cfg`'s knobs through the
    /// setters. Execution tier is not part of the ABI; the handle runs scalar.
    pub fn new(cfg: &LungConfig) -> Result<Self> {
        cfg.validate()?;
        let dim = |v: usize, field: &'static str| {
            i32::try_from(v).map_err(|_| LungError::config(field, "must fit in i32"))
        };
        let raw = ffi::lung_create(
            dim(cfg.vocab_size, "vocab_size")?,
            dim(cfg.d_model, "d_model")?,
            dim(cfg.ctx_len, "ctx_len")?,
            dim(cfg.n_heads, "n_heads")?,
            cfg.seed.unwrap_or(1),
            cfg.learning_rate,
        );
        let handle = NonNull::new(raw).ok_or(LungError::config("lung", "foreign create failed"))?;
        let mut lung = Self {
            handle,
            vocab_size: cfg.vocab_size,
            d_model: cfg.d_model,
            ctx_len: cfg.ctx_len,
        };
        lung.set_focus(cfg.attend_focus);
        lung.set_spread(cfg.attend_spread);
        lung.set_temporal_alpha(cfg.temporal_alpha);
        lung.set_rtl(cfg.use_rtl);
        Ok(lung)
    }

    fn raw(&self) -> *mut Lung {
        self.handle.as_ptr()
    }

    fn scratch(context: &[TokenId]) -> Vec<i32> {
        context
            .iter()
            .map(|&t| i32::try_from(t).unwrap_or(i32::MAX))
            .collect()
    }

    /// Copy `len` floats out of a buffer the handle owns.
    fn copy_out(&self, ptr: *const f32, len: usize) -> Option<Vec<f32>> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the handle is live and the getter contract guarantees `len`
        // floats until the next mutating call, which cannot happen while
        // `&self` is borrowed.
        Some(unsafe { slice::from_raw_parts(ptr, len) }.to_vec())
    }
}

impl Drop for ForeignLung {
    fn drop(&mut self) {
        // SAFETY: created by `lung_create`, destroyed exactly once here.
        unsafe { ffi::lung_destroy(self.raw()) }
    }
}

// SAFETY: the handle is uniquely owned, like a `Box<Lung>`.
unsafe impl Send for ForeignLung {}

impl Engine for ForeignLung {
    fn name(&self) -> &'static str {
        "foreign"
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn d_model(&self) -> usize {
        self.d_model
    }

    fn ctx_len(&self) -> usize {
        self.ctx_len
    }

    fn forward(&mut self, context: &[TokenId]) -> f32 {
        let ctx = Self::scratch(context);
        unsafe { ffi::lung_forward(self.raw(), ctx.as_ptr(), ctx.len() as i32) }
    }

    fn train_step(&mut self, context: &[TokenId], target: TokenId) -> Result<f32> {
        let ctx = Self::scratch(context);
        let target = i32::try_from(target).unwrap_or(i32::MAX);
        let loss =
            unsafe { ffi::lung_train_step(self.raw(), ctx.as_ptr(), ctx.len() as i32, target) };
        if loss < 0.0 {
            Err(LungError::PrecondNotMet(
                "train_step requires a prior forward call",
            ))
        } else {
            Ok(loss)
        }
    }

    fn probs(&self) -> Option<Vec<f32>> {
        let p = unsafe { ffi::lung_get_probs(self.raw()) };
        self.copy_out(p, self.vocab_size)
    }

    fn logits(&self) -> Option<Vec<f32>> {
        let p = unsafe { ffi::lung_get_logits(self.raw()) };
        self.copy_out(p, self.vocab_size)
    }

    fn attention(&self) -> Option<Vec<f32>> {
        let p = unsafe { ffi::lung_get_attention(self.raw()) };
        self.copy_out(p, self.ctx_len)
    }

    fn argmax(&self) -> Option<TokenId> {
        let id = unsafe { ffi::lung_get_argmax(self.raw()) };
        TokenId::try_from(id).ok()
    }

    fn top_k(&self, k: usize) -> Vec<TokenId> {
        let k = k.min(self.vocab_size);
        let mut out = vec![0i32; k];
        let n = unsafe { ffi::lung_get_top_k(self.raw(), out.as_mut_ptr(), k as i32) };
        out.truncate(n.max(0) as usize);
        out.into_iter().map(|id| id.max(0) as TokenId).collect()
    }

    fn token_prob(&self, token: TokenId) -> f32 {
        match i32::try_from(token) {
            Ok(t) => unsafe { ffi::lung_get_token_prob(self.raw(), t) },
            Err(_) => 0.0,
        }
    }

    fn set_focus(&mut self, focus: f32) {
        unsafe { ffi::lung_set_focus(self.raw(), focus) }
    }

    fn set_spread(&mut self, spread: f32) {
        unsafe { ffi::lung_set_spread(self.raw(), spread) }
    }

    fn set_temporal_alpha(&mut self, alpha: f32) {
        unsafe { ffi::lung_set_temporal_alpha(self.raw(), alpha) }
    }

    fn set_rtl(&mut self, use_rtl: bool) {
        unsafe { ffi::lung_set_rtl(self.raw(), use_rtl as i32) }
    }

    fn resonance(&self, token: TokenId) -> f32 {
        match i32::try_from(token) {
            Ok(t) => unsafe { ffi::lung_get_resonance(self.raw(), t) },
            Err(_) => 0.0,
        }
    }

    fn boost_resonance(&mut self, token: TokenId, amount: f32) {
        if let Ok(t) = i32::try_from(token) {
            unsafe { ffi::lung_boost_resonance(self.raw(), t, amount) }
        }
    }

    fn decay_resonance(&mut self, token: TokenId, amount: f32) {
        if let Ok(t) = i32::try_from(token) {
            unsafe { ffi::lung_decay_resonance(self.raw(), t, amount) }
        }
    }

    fn state(&self) -> [f32; STATE_LEN] {
        let mut out = [0.0f32; STATE_LEN];
        unsafe { ffi::lung_copy_state(self.raw(), out.as_mut_ptr(), STATE_LEN as i32) };
        out
    }
}
