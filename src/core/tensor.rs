//! Tensor store: weight buffers, positional tables and the dense kernels the
//! forward pass is built from.
//!
//! All matrices are flat row-major `Vec<f32>`. Nothing here mutates after
//! construction except `wo`, which the notorch unit trains.

#[cfg(feature = "simd")]
use wide::f32x4;

use crate::prng::Prng;

/// Uniform init half-width for every random matrix.
pub const INIT_SCALE: f32 = 0.08;

/// Fixed random projections for one attention head (`head_dim × d_model` each).
#[derive(Debug, Clone)]
pub struct HeadProjection {
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Tensors {
    pub vocab_size: usize,
    pub d_model: usize,
    pub ctx_len: usize,
    pub n_heads: usize,
    pub head_dim: usize,

    /// Token embeddings: `vocab_size × d_model`.
    pub embeddings: Vec<f32>,
    /// Positional table, position 0 = oldest.
    pub pos_ltr: Vec<f32>,
    /// Positional table, position 0 = most recent.
    pub pos_rtl: Vec<f32>,
    /// Output projection: `d_model × vocab_size`.
    pub wo: Vec<f32>,
    pub heads: Vec<HeadProjection>,
}

impl Tensors {
    /// Allocate and initialize every buffer.
    ///
    /// Callers validate dimensions first; `head_dim` is `d_model / n_heads`.
    /// Draw order (E, Wo, then Wq/Wk/Wv per head) is part of the
    /// reproducibility contract and must not change.
    pub fn new(
        vocab_size: usize,
        d_model: usize,
        ctx_len: usize,
        n_heads: usize,
        rng: &mut Prng,
    ) -> Self {
        let head_dim = d_model / n_heads;
        let head_size = head_dim * d_model;

        let mut embeddings = vec![0.0; vocab_size * d_model];
        rng.fill_symmetric(&mut embeddings, INIT_SCALE);

        let mut wo = vec![0.0; d_model * vocab_size];
        rng.fill_symmetric(&mut wo, INIT_SCALE);

        let mut heads = Vec::with_capacity(n_heads);
        for _ in 0..n_heads {
            let mut wq = vec![0.0; head_size];
            let mut wk = vec![0.0; head_size];
            let mut wv = vec![0.0; head_size];
            rng.fill_symmetric(&mut wq, INIT_SCALE);
            rng.fill_symmetric(&mut wk, INIT_SCALE);
            rng.fill_symmetric(&mut wv, INIT_SCALE);
            heads.push(HeadProjection { wq, wk, wv });
        }

        Self {
            vocab_size,
            d_model,
            ctx_len,
            n_heads,
            head_dim,
            embeddings,
            pos_ltr: build_positional_encoding(ctx_len, d_model, false),
            pos_rtl: build_positional_encoding(ctx_len, d_model, true),
            wo,
            heads,
        }
    }

    #[inline]
    pub fn embedding(&self, token: usize) -> &[f32] {
        let d = self.d_model;
        &self.embeddings[token * d..(token + 1) * d]
    }

    #[inline]
    pub fn positional_row(&self, rtl: bool, pos: usize) -> &[f32] {
        let d = self.d_model;
        let table = if rtl { &self.pos_rtl } else { &self.pos_ltr };
        &table[pos * d..(pos + 1) * d]
    }

    /// Total number of trainable + fixed weights (excludes positional tables).
    pub fn parameter_count(&self) -> usize {
        self.embeddings.len() + self.wo.len() + self.heads.len() * 3 * self.head_dim * self.d_model
    }
}

/// Sinusoidal encoding. RTL reverses the effective position so that row 0
/// reads as the most recent slot.
pub fn build_positional_encoding(ctx_len: usize, d_model: usize, rtl: bool) -> Vec<f32> {
    let mut p = vec![0.0; ctx_len * d_model];
    let d = (d_model as f32).max(1.0);
    for pos in 0..ctx_len {
        let effective = if rtl { ctx_len - 1 - pos } else { pos };
        for i in 0..d_model {
            let exponent = (2 * (i / 2)) as f32 / d;
            let angle = effective as f32 / 10000f32.powf(exponent).max(f32::EPSILON);
            p[pos * d_model + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    p
}

/// Dot-product kernel selected by execution tier.
pub type DotFn = fn(&[f32], &[f32]) -> f32;

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Four-lane dot product; remainder lanes are summed scalar.
#[cfg(feature = "simd")]
pub fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let chunks = n / 4;
    let mut acc = f32x4::splat(0.0);
    for c in 0..chunks {
        let i = c * 4;
        let va = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc += va * vb;
    }
    let mut sum: f32 = acc.to_array().iter().sum();
    for i in chunks * 4..n {
        sum += a[i] * b[i];
    }
    sum
}

/// `out[rows] = mat[rows × cols] · v[cols]`
pub fn mat_vec(out: &mut [f32], mat: &[f32], v: &[f32], cols: usize, dot: DotFn) {
    for (i, o) in out.iter_mut().enumerate() {
        *o = dot(&mat[i * cols..(i + 1) * cols], v);
    }
}

/// `out[cols] = mat[rows × cols]^T · v[rows]`
pub fn mat_vec_t(out: &mut [f32], mat: &[f32], v: &[f32], cols: usize) {
    out.fill(0.0);
    for (i, &vi) in v.iter().enumerate() {
        if vi == 0.0 {
            continue;
        }
        axpy(out, &mat[i * cols..(i + 1) * cols], vi);
    }
}

/// `y += a * x`
#[inline]
pub fn axpy(y: &mut [f32], x: &[f32], a: f32) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

/// In-place softmax with max subtraction. Non-finite inputs are treated as
/// very negative so the output stays a finite distribution.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    for v in x.iter_mut() {
        if !v.is_finite() {
            *v = if *v == f32::INFINITY { f32::MAX } else { -1e30 };
        }
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum <= 0.0 || !sum.is_finite() {
        let uniform = 1.0 / x.len() as f32;
        x.fill(uniform);
        return;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// Shannon entropy in nats.
pub fn entropy(probs: &[f32]) -> f32 {
    probs
        .iter()
        .filter(|&&p| p > 1e-12)
        .map(|&p| -p * p.ln())
        .sum()
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(xs: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &x) in xs.iter().enumerate() {
        if best.map(|(_, b)| x > b).unwrap_or(true) {
            best = Some((i, x));
        }
    }
    best.map(|(i, _)| i)
}

/// Indices of the `k` largest values, descending, ties broken by lower index.
pub fn top_k(xs: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..xs.len()).collect();
    // Stable sort keeps lower indices first among equal values.
    idx.sort_by(|&a, &b| xs[b].total_cmp(&xs[a]));
    idx.truncate(k.min(xs.len()));
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one_even_for_huge_inputs() {
        let mut x = vec![1000.0, 999.0, -1000.0, 0.0];
        softmax(&mut x);
        let s: f32 = x.iter().sum();
        assert!((s - 1.0).abs() < 1e-5);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!(x[0] > x[1]);
    }

    #[test]
    fn softmax_tolerates_non_finite() {
        let mut x = vec![f32::NAN, 1.0, f32::NEG_INFINITY];
        softmax(&mut x);
        let s: f32 = x.iter().sum();
        assert!((s - 1.0).abs() < 1e-5);
        assert!(x[1] > 0.99);
    }

    #[test]
    fn positional_tables_are_mirrors() {
        let ltr = build_positional_encoding(5, 4, false);
        let rtl = build_positional_encoding(5, 4, true);
        for pos in 0..5 {
            let mirrored = 4 - pos;
            assert_eq!(&rtl[pos * 4..pos * 4 + 4], &ltr[mirrored * 4..mirrored * 4 + 4]);
        }
        // Position 0, even dims: sin(0) = 0; odd dims: cos(0) = 1.
        assert_eq!(ltr[0], 0.0);
        assert_eq!(ltr[1], 1.0);
    }

    #[test]
    fn transposed_mat_vec_matches_manual() {
        // 2 × 3 matrix
        let m = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0; 3];
        mat_vec_t(&mut out, &m, &[1.0, -1.0], 3);
        assert_eq!(out, [-3.0, -3.0, -3.0]);

        let mut out2 = [0.0; 2];
        mat_vec(&mut out2, &m, &[1.0, 0.0, 1.0], 3, dot);
        assert_eq!(out2, [4.0, 10.0]);
    }

    #[test]
    fn argmax_agrees_with_top_one() {
        let xs = [0.3, 0.9, 0.9, -1.0];
        assert_eq!(argmax(&xs), Some(1));
        assert_eq!(top_k(&xs, 1), vec![1]);
        assert_eq!(top_k(&xs, 10), vec![1, 2, 0, 3]);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn entropy_of_uniform_is_ln_n() {
        let p = vec![0.25; 4];
        assert!((entropy(&p) - 4f32.ln()).abs() < 1e-6);
        assert_eq!(entropy(&[1.0, 0.0]), 0.0);
    }

    #[cfg(feature = "simd")]
    #[test]
    fn simd_dot_matches_scalar() {
        let a: Vec<f32> = (0..11).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..11).map(|i| 1.0 - i as f32 * 0.1).collect();
        assert!((dot(&a, &b) - dot_simd(&a, &b)).abs() < 1e-4);
    }
}
