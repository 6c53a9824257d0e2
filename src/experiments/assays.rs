use crate::body::{Body, BodyConfig};
use crate::dark_matter::{DarkMatter, DarkMatterConfig};
use crate::error::Result;
use crate::gate::FieldPulse;
use crate::lung::{Lung, LungConfig, TokenId};

#[cfg(feature = "serde")]
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AssayReport {
    pub seed: u64,

    // Learning on a repeated sequence.
    pub train_steps: usize,
    pub loss_first: f32,
    pub loss_last: f32,
    pub target_prob_last: f32,

    /// (uniform resonance, fraction of injections accepted)
    pub acceptance_sweep: Vec<(f32, f32)>,

    // Dark-matter memory.
    pub scar_half_life_ticks: u64,
    pub scar_fade_ticks: u64,

    /// L1 distance between LTR and RTL output distributions for one context.
    pub rtl_divergence: f32,

    pub image_bytes: usize,
}

pub fn run() -> Result<AssayReport> {
    let report = measure(1)?;
    print_report(&report);
    Ok(report)
}

pub fn measure(seed: u64) -> Result<AssayReport> {
    let cfg = LungConfig::with_dims(64, 32, 8, 4)
        .with_seed(seed)
        .with_learning_rate(0.1);

    let train_steps = 300;
    let (loss_first, loss_last, target_prob_last) = repeated_sequence(cfg, train_steps)?;

    let acceptance_sweep = [0.1f32, 0.3, 0.5, 0.7, 0.9]
        .iter()
        .map(|&r| Ok((r, acceptance_rate(cfg, r, 40)?)))
        .collect::<Result<Vec<_>>>()?;

    let (scar_half_life_ticks, scar_fade_ticks) = scar_lifetime(DarkMatterConfig::default())?;

    let rtl_divergence = rtl_divergence(cfg)?;

    let mut body = Body::new(BodyConfig {
        lung: cfg,
        ..Default::default()
    })?;
    body.lung.fill_resonance(0.2);
    body.inject(&[1, 2, 3], FieldPulse::default());
    let image_bytes = body.save_image_bytes()?.len();

    Ok(AssayReport {
        seed,
        train_steps,
        loss_first,
        loss_last,
        target_prob_last,
        acceptance_sweep,
        scar_half_life_ticks,
        scar_fade_ticks,
        rtl_divergence,
        image_bytes,
    })
}

/// Train the same context → target pair repeatedly.
fn repeated_sequence(cfg: LungConfig, steps: usize) -> Result<(f32, f32, f32)> {
    let mut lung = Lung::new(cfg)?;
    let context: [TokenId; 4] = [10, 20, 30, 40];
    let target = 50;

    lung.forward(&context);
    let first = lung.train_step(&context, target)?;
    let mut last = first;
    for _ in 1..steps {
        last = lung.train_step(&context, target)?;
    }
    Ok((first.loss, last.loss, last.target_prob))
}

/// Fraction of accepted injections with every resonance pinned at `level`
/// before each injection.
fn acceptance_rate(cfg: LungConfig, level: f32, trials: usize) -> Result<f32> {
    let mut body = Body::new(BodyConfig {
        lung: cfg,
        ..Default::default()
    })?;
    let vocab = cfg.vocab_size as TokenId;
    let mut accepted = 0usize;
    for t in 0..trials as TokenId {
        body.lung.fill_resonance(level);
        let tokens = [t % vocab, (t * 7 + 3) % vocab, (t * 13 + 5) % vocab];
        if body.inject(&tokens, FieldPulse::default()).accepted {
            accepted += 1;
        }
    }
    Ok(accepted as f32 / trials as f32)
}

/// Ticks until a unit-mass scar halves, and until it is gone.
fn scar_lifetime(cfg: DarkMatterConfig) -> Result<(u64, u64)> {
    let mut dm = DarkMatter::new(cfg)?;
    dm.deposit(&[1], 1.0);
    let mut half_life = 0;
    while !dm.is_empty() {
        dm.step();
        if half_life == 0 && dm.total_mass() <= 0.5 {
            half_life = dm.ticks();
        }
    }
    Ok((half_life, dm.ticks()))
}

fn rtl_divergence(cfg: LungConfig) -> Result<f32> {
    let context: [TokenId; 6] = [3, 1, 4, 1, 5, 9];
    let mut ltr = Lung::new(cfg)?;
    let mut rtl = Lung::new(cfg)?;
    rtl.set_rtl(true);
    let a = ltr.forward(&context).probabilities;
    let b = rtl.forward(&context).probabilities;
    Ok(a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum())
}

fn print_report(r: &AssayReport) {
    println!("lung assays");
    println!("seed={}", r.seed);
    println!("train_steps={}", r.train_steps);
    println!("loss_first={:.4}", r.loss_first);
    println!("loss_last={:.4}", r.loss_last);
    println!("target_prob_last={:.4}", r.target_prob_last);
    for (level, rate) in &r.acceptance_sweep {
        println!("acceptance[resonance={level:.1}]={rate:.3}");
    }
    println!("scar_half_life_ticks={}", r.scar_half_life_ticks);
    println!("scar_fade_ticks={}", r.scar_fade_ticks);
    println!("rtl_divergence={:.6}", r.rtl_divergence);
    println!("image_bytes={}", r.image_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assays_are_reproducible_and_sane() {
        let a = measure(3).unwrap();
        let b = measure(3).unwrap();
        assert_eq!(a, b);

        assert!(a.loss_last < a.loss_first);
        // Below the 0.4 threshold nothing passes; above it everything does.
        assert_eq!(a.acceptance_sweep[0].1, 0.0);
        assert_eq!(a.acceptance_sweep[1].1, 0.0);
        assert_eq!(a.acceptance_sweep[3].1, 1.0);
        assert_eq!(a.acceptance_sweep[4].1, 1.0);
        // 0.995^139 ≈ 0.498
        assert!((135..=142).contains(&a.scar_half_life_ticks));
        assert!(a.scar_fade_ticks > a.scar_half_life_ticks);
        assert!(a.rtl_divergence > 0.0);
        assert!(a.image_bytes > 0);
    }
}
