//! C ABI over [`Lung`] and [`Body`].
//!
//! Handles are owned heap pointers: `*_create` allocates, `*_destroy` frees
//! exactly once. Pointers returned by the `lung_get_*` buffer getters stay
//! valid only until the next mutating call on the same handle or its destroy.
//!
//! Every entry point tolerates a null handle and returns a neutral value.
//! Token ids are `i32`; negatives clamp to 0, ids past the vocabulary clamp to
//! the last token.

use core::ptr;
use std::slice;

use crate::body::{Body, BodyConfig};
use crate::gate::FieldPulse;
use crate::lung::{Lung, LungConfig, TokenId};

#[inline]
fn token(id: i32) -> TokenId {
    id.max(0) as TokenId
}

/// Copy a caller-owned `i32` array into a scratch buffer of token ids.
///
/// # Safety
/// `ptr` must be null or point to `len` readable `i32`s.
unsafe fn tokens_from_raw(ptr: *const i32, len: i32) -> Vec<TokenId> {
    if ptr.is_null() || len <= 0 {
        return Vec::new();
    }
    slice::from_raw_parts(ptr, len as usize)
        .iter()
        .map(|&t| token(t))
        .collect()
}

#[inline]
fn as_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn dims_config(vocab_size: i32, d_model: i32, ctx_len: i32, n_heads: i32) -> Option<LungConfig> {
    let dim = |v: i32| usize::try_from(v).ok();
    Some(LungConfig::with_dims(
        dim(vocab_size)?,
        dim(d_model)?,
        dim(ctx_len)?,
        dim(n_heads)?,
    ))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create a lung. Returns null when the dimensions are invalid.
#[no_mangle]
pub extern "C" fn lung_create(
    vocab_size: i32,
    d_model: i32,
    ctx_len: i32,
    n_heads: i32,
    seed: u64,
    learning_rate: f32,
) -> *mut Lung {
    let Some(cfg) = dims_config(vocab_size, d_model, ctx_len, n_heads) else {
        return ptr::null_mut();
    };
    match Lung::new(cfg.with_seed(seed).with_learning_rate(learning_rate)) {
        Ok(lung) => Box::into_raw(Box::new(lung)),
        Err(e) => {
            tracing::warn!(error = %e, "lung_create rejected configuration");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `lung` must be null or a handle from `lung_create` not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn lung_destroy(lung: *mut Lung) {
    if !lung.is_null() {
        drop(Box::from_raw(lung));
    }
}

// ---------------------------------------------------------------------------
// Forward / train
// ---------------------------------------------------------------------------

/// Run a forward pass; returns entropy, or 0 for a null handle.
///
/// # Safety
/// `lung` must be null or live; `context` must be null or hold `len` ints.
#[no_mangle]
pub unsafe extern "C" fn lung_forward(lung: *mut Lung, context: *const i32, len: i32) -> f32 {
    let Some(lung) = lung.as_mut() else {
        return 0.0;
    };
    let ctx = tokens_from_raw(context, len);
    lung.forward(&ctx).entropy
}

/// One training step; returns the loss, or -1 when no forward has run yet.
///
/// # Safety
/// As for [`lung_forward`].
#[no_mangle]
pub unsafe extern "C" fn lung_train_step(
    lung: *mut Lung,
    context: *const i32,
    len: i32,
    target: i32,
) -> f32 {
    let Some(lung) = lung.as_mut() else {
        return -1.0;
    };
    let ctx = tokens_from_raw(context, len);
    match lung.train_step(&ctx, token(target)) {
        Ok(report) => report.loss,
        Err(_) => -1.0,
    }
}

// ---------------------------------------------------------------------------
// Getters
// ---------------------------------------------------------------------------

fn buffer_ptr(buf: Option<&[f32]>) -> *const f32 {
    buf.map_or(ptr::null(), <[f32]>::as_ptr)
}

/// `vocab_size` floats, or null before the first forward.
///
/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_logits(lung: *const Lung) -> *const f32 {
    lung.as_ref().map_or(ptr::null(), |l| buffer_ptr(l.last_logits()))
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_probs(lung: *const Lung) -> *const f32 {
    lung.as_ref().map_or(ptr::null(), |l| buffer_ptr(l.last_probs()))
}

/// `ctx_len` floats, or null before the first forward.
///
/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_attention(lung: *const Lung) -> *const f32 {
    lung.as_ref()
        .map_or(ptr::null(), |l| buffer_ptr(l.last_attention()))
}

/// `d_model × vocab_size` floats of the trained output projection.
///
/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_output_weights(lung: *const Lung) -> *const f32 {
    lung.as_ref()
        .map_or(ptr::null(), |l| l.tensors().wo.as_ptr())
}

/// Best token id, or -1 before the first forward.
///
/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_argmax(lung: *const Lung) -> i32 {
    lung.as_ref()
        .and_then(Lung::argmax)
        .map_or(-1, |t| as_i32(t as usize))
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_token_prob(lung: *const Lung, token_id: i32) -> f32 {
    match lung.as_ref() {
        Some(l) if token_id >= 0 => l.token_prob(token_id as TokenId),
        _ => 0.0,
    }
}

/// Write up to `k` ids into `out`; returns how many were written.
///
/// # Safety
/// `lung` must be null or live; `out` must be null or hold `k` ints.
#[no_mangle]
pub unsafe extern "C" fn lung_get_top_k(lung: *const Lung, out: *mut i32, k: i32) -> i32 {
    let Some(lung) = lung.as_ref() else {
        return 0;
    };
    if out.is_null() || k <= 0 {
        return 0;
    }
    let ids = lung.top_k(k as usize);
    let dst = slice::from_raw_parts_mut(out, ids.len());
    for (d, &id) in dst.iter_mut().zip(&ids) {
        *d = as_i32(id as usize);
    }
    as_i32(ids.len())
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_vocab_size(lung: *const Lung) -> i32 {
    lung.as_ref().map_or(0, |l| as_i32(l.vocab_size()))
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_d_model(lung: *const Lung) -> i32 {
    lung.as_ref().map_or(0, |l| as_i32(l.d_model()))
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_ctx_len(lung: *const Lung) -> i32 {
    lung.as_ref().map_or(0, |l| as_i32(l.ctx_len()))
}

/// Copy the state mirror into `out`; returns slots written.
///
/// # Safety
/// `lung` must be null or live; `out` must be null or hold `len` floats.
#[no_mangle]
pub unsafe extern "C" fn lung_copy_state(lung: *const Lung, out: *mut f32, len: i32) -> i32 {
    let Some(lung) = lung.as_ref() else {
        return 0;
    };
    if out.is_null() || len <= 0 {
        return 0;
    }
    let dst = slice::from_raw_parts_mut(out, len as usize);
    as_i32(lung.copy_state(dst))
}

// ---------------------------------------------------------------------------
// Knobs and resonance
// ---------------------------------------------------------------------------

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_set_focus(lung: *mut Lung, focus: f32) {
    if let Some(l) = lung.as_mut() {
        l.set_focus(focus);
    }
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_set_spread(lung: *mut Lung, spread: f32) {
    if let Some(l) = lung.as_mut() {
        l.set_spread(spread);
    }
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_set_temporal_alpha(lung: *mut Lung, alpha: f32) {
    if let Some(l) = lung.as_mut() {
        l.set_temporal_alpha(alpha);
    }
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_set_rtl(lung: *mut Lung, use_rtl: i32) {
    if let Some(l) = lung.as_mut() {
        l.set_rtl(use_rtl != 0);
    }
}

/// Out-of-range ids are ignored.
///
/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_boost_resonance(lung: *mut Lung, token_id: i32, amount: f32) {
    if let Some(l) = lung.as_mut() {
        if token_id >= 0 {
            l.boost_resonance(token_id as TokenId, amount);
        }
    }
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_decay_resonance(lung: *mut Lung, token_id: i32, amount: f32) {
    if let Some(l) = lung.as_mut() {
        if token_id >= 0 {
            l.decay_resonance(token_id as TokenId, amount);
        }
    }
}

/// # Safety
/// `lung` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn lung_get_resonance(lung: *const Lung, token_id: i32) -> f32 {
    match lung.as_ref() {
        Some(l) if token_id >= 0 => l.resonance(token_id as TokenId),
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Body: gate + dark matter
// ---------------------------------------------------------------------------

/// Create a body with default memory and gate settings.
#[no_mangle]
pub extern "C" fn body_create(
    vocab_size: i32,
    d_model: i32,
    ctx_len: i32,
    n_heads: i32,
    seed: u64,
) -> *mut Body {
    let Some(lung) = dims_config(vocab_size, d_model, ctx_len, n_heads) else {
        return ptr::null_mut();
    };
    let mut cfg = BodyConfig {
        lung: lung.with_seed(seed),
        ..Default::default()
    };
    cfg.dark_matter.seed = seed;
    match Body::new(cfg) {
        Ok(body) => Box::into_raw(Box::new(body)),
        Err(e) => {
            tracing::warn!(error = %e, "body_create rejected configuration");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `body` must be null or a handle from `body_create` not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn body_destroy(body: *mut Body) {
    if !body.is_null() {
        drop(Box::from_raw(body));
    }
}

/// Borrow the body's lung for the `lung_*` calls. Owned by the body: never
/// pass it to `lung_destroy`.
///
/// # Safety
/// `body` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn body_lung(body: *mut Body) -> *mut Lung {
    body.as_mut()
        .map_or(ptr::null_mut(), |b| &mut b.lung as *mut Lung)
}

/// Inject tokens. Writes `[dx, dy, scar_mass]` into `out` when non-null and
/// returns 1 if accepted, 0 if rejected or on a null handle.
///
/// # Safety
/// `body` must be null or live; `tokens` must be null or hold `len` ints;
/// `out` must be null or hold 3 floats.
#[no_mangle]
pub unsafe extern "C" fn body_inject(
    body: *mut Body,
    tokens: *const i32,
    len: i32,
    drift: f32,
    dissonance: f32,
    out: *mut f32,
) -> i32 {
    let Some(body) = body.as_mut() else {
        return 0;
    };
    let ids = tokens_from_raw(tokens, len);
    let inj = body.inject(&ids, FieldPulse { drift, dissonance });
    if !out.is_null() {
        slice::from_raw_parts_mut(out, 3).copy_from_slice(&[inj.dx, inj.dy, inj.scar_mass]);
    }
    inj.accepted as i32
}

/// Advance memory one tick; returns scars removed.
///
/// # Safety
/// `body` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn body_tick(body: *mut Body) -> i32 {
    body.as_mut().map_or(0, |b| as_i32(b.tick()))
}

/// # Safety
/// `body` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn body_potential(body: *const Body, x: f32, y: f32) -> f32 {
    body.as_ref().map_or(0.0, |b| b.potential(x, y))
}

/// Writes `[gx, gy]` into `out`.
///
/// # Safety
/// `body` must be null or live; `out` must be null or hold 2 floats.
#[no_mangle]
pub unsafe extern "C" fn body_gradient(body: *const Body, x: f32, y: f32, out: *mut f32) {
    let Some(body) = body.as_ref() else {
        return;
    };
    if out.is_null() {
        return;
    }
    let (gx, gy) = body.gradient(x, y);
    slice::from_raw_parts_mut(out, 2).copy_from_slice(&[gx, gy]);
}

/// # Safety
/// `body` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn body_scar_count(body: *const Body) -> i32 {
    body.as_ref().map_or(0, |b| as_i32(b.dark_matter.len()))
}

/// # Safety
/// `body` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn body_total_mass(body: *const Body) -> f32 {
    body.as_ref().map_or(0.0, |b| b.dark_matter.total_mass())
}
