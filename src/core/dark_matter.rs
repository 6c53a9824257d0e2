//! Dark matter: long-term memory of rejected inputs.
//!
//! Every rejected injection leaves a scar: a point mass placed
//! deterministically from a hash of its token sequence. Scars decay every
//! tick and are removed once light enough. Together they form a repulsive
//! field the movement collaborator can query.

use std::collections::VecDeque;
use std::io::{self, Cursor, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::error::{self, LungError};
use crate::lung::TokenId;
use crate::prng;
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DarkMatterConfig {
    /// Maximum live scars; the oldest is evicted to admit a new one.
    pub capacity: usize,
    /// Multiplicative mass decay per tick.
    pub decay: f32,
    /// Scars at or below this mass are removed.
    pub mass_floor: f32,
    /// Softening term for distance divisions.
    pub epsilon: f32,
    /// World bounds scars are placed in: `[0, width) × [0, height)`.
    pub width: f32,
    pub height: f32,
    /// Mixed into the placement hash.
    pub seed: u64,
}

impl Default for DarkMatterConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            decay: 0.995,
            mass_floor: 0.01,
            epsilon: 1e-3,
            width: 32.0,
            height: 32.0,
            seed: 1,
        }
    }
}

impl DarkMatterConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_bounds(mut self, width: f32, height: f32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.capacity == 0 {
            return Err("capacity must be > 0");
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err("decay must be in (0, 1]");
        }
        if !self.mass_floor.is_finite() || self.mass_floor < 0.0 {
            return Err("mass_floor must be finite and >= 0");
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err("epsilon must be finite and > 0");
        }
        if !(self.width.is_finite() && self.width > 0.0)
            || !(self.height.is_finite() && self.height > 0.0)
        {
            return Err("world bounds must be finite and > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Scar {
    pub tokens: Vec<TokenId>,
    pub mass: f32,
    pub x: f32,
    pub y: f32,
    /// Dark-matter tick at which the scar was deposited.
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct DarkMatter {
    pub(crate) cfg: DarkMatterConfig,
    pub(crate) scars: VecDeque<Scar>,
    pub(crate) ticks: u64,
}

impl Default for DarkMatter {
    fn default() -> Self {
        Self::empty(DarkMatterConfig::default())
    }
}

impl DarkMatter {
    pub fn new(cfg: DarkMatterConfig) -> error::Result<Self> {
        cfg.validate()
            .map_err(|reason| LungError::config("dark_matter", reason))?;
        Ok(Self::empty(cfg))
    }

    fn empty(cfg: DarkMatterConfig) -> Self {
        Self {
            scars: VecDeque::with_capacity(cfg.capacity.min(1024)),
            cfg,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &DarkMatterConfig {
        &self.cfg
    }

    /// Where a scar for `tokens` would land.
    pub fn position_of(&self, tokens: &[TokenId]) -> (f32, f32) {
        let h = prng::hash_tokens(self.cfg.seed, tokens);
        let x = prng::unit_interval(h) * self.cfg.width;
        let y = prng::unit_interval(prng::mix64(h)) * self.cfg.height;
        (x, y)
    }

    /// Leave a scar for `tokens`. Returns its position, or `None` when `mass`
    /// is not a positive finite number.
    pub fn deposit(&mut self, tokens: &[TokenId], mass: f32) -> Option<(f32, f32)> {
        if !(mass.is_finite() && mass > 0.0) {
            return None;
        }
        let (x, y) = self.position_of(tokens);
        self.scars.push_back(Scar {
            tokens: tokens.to_vec(),
            mass,
            x,
            y,
            created_at: self.ticks,
        });
        debug!(mass, x, y, live = self.scars.len(), "scar deposited");

        while self.scars.len() > self.cfg.capacity {
            if let Some(old) = self.scars.pop_front() {
                debug!(mass = old.mass, created_at = old.created_at, "scar evicted");
            }
        }
        Some((x, y))
    }

    /// Inverse-distance potential: `Σ mass / (dist + ε)`.
    pub fn potential(&self, x: f32, y: f32) -> f32 {
        self.scars
            .iter()
            .map(|s| {
                let dist = ((x - s.x).powi(2) + (y - s.y).powi(2)).sqrt();
                s.mass / (dist + self.cfg.epsilon)
            })
            .sum()
    }

    /// Repulsive force at `(x, y)`: `Σ mass / dist² · unit(point - scar)`.
    ///
    /// Points away from scars. Callers negate it for attraction.
    pub fn gradient(&self, x: f32, y: f32) -> (f32, f32) {
        let eps = self.cfg.epsilon;
        let mut gx = 0.0;
        let mut gy = 0.0;
        for s in &self.scars {
            let dx = x - s.x;
            let dy = y - s.y;
            let d2 = dx * dx + dy * dy;
            let dist = d2.sqrt();
            if dist <= eps {
                // Direction undefined at the scar itself.
                continue;
            }
            let strength = s.mass / (d2 + eps);
            gx += strength * dx / dist;
            gy += strength * dy / dist;
        }
        (gx, gy)
    }

    /// One memory tick: decay all masses, drop scars at or below the floor.
    /// Returns how many scars were removed.
    pub fn step(&mut self) -> usize {
        self.ticks = self.ticks.wrapping_add(1);
        let decay = self.cfg.decay;
        let floor = self.cfg.mass_floor;
        for s in &mut self.scars {
            s.mass *= decay;
        }
        let before = self.scars.len();
        self.scars.retain(|s| s.mass > floor);
        let removed = before - self.scars.len();
        if removed > 0 {
            debug!(removed, live = self.scars.len(), "scars faded");
        }
        removed
    }

    /// Sum of live scar masses.
    pub fn total_mass(&self) -> f32 {
        self.scars.iter().map(|s| s.mass).sum()
    }

    pub fn len(&self) -> usize {
        self.scars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scars.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Live scars, oldest first.
    pub fn scars(&self) -> impl Iterator<Item = &Scar> {
        self.scars.iter()
    }

    pub fn clear(&mut self) {
        self.scars.clear();
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let c = &self.cfg;
        storage::write_u32_le(w, storage::len_u32(c.capacity)?)?;
        storage::write_f32_le(w, c.decay)?;
        storage::write_f32_le(w, c.mass_floor)?;
        storage::write_f32_le(w, c.epsilon)?;
        storage::write_f32_le(w, c.width)?;
        storage::write_f32_le(w, c.height)?;
        storage::write_u64_le(w, c.seed)?;
        storage::write_u64_le(w, self.ticks)?;

        storage::write_u32_le(w, storage::len_u32(self.scars.len())?)?;
        for s in &self.scars {
            storage::write_f32_le(w, s.mass)?;
            storage::write_f32_le(w, s.x)?;
            storage::write_f32_le(w, s.y)?;
            storage::write_u64_le(w, s.created_at)?;
            storage::write_u32_le(w, storage::len_u32(s.tokens.len())?)?;
            for &t in &s.tokens {
                storage::write_u32_le(w, t)?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_image_payload(cur: &mut Cursor<Vec<u8>>) -> io::Result<Self> {
        let cfg = DarkMatterConfig {
            capacity: storage::read_u32_le(cur)? as usize,
            decay: storage::read_f32_le(cur)?,
            mass_floor: storage::read_f32_le(cur)?,
            epsilon: storage::read_f32_le(cur)?,
            width: storage::read_f32_le(cur)?,
            height: storage::read_f32_le(cur)?,
            seed: storage::read_u64_le(cur)?,
        };
        cfg.validate().map_err(|_| storage::invalid("DARK config invalid"))?;
        let ticks = storage::read_u64_le(cur)?;

        let n = storage::read_u32_le(cur)? as usize;
        if n > cfg.capacity {
            return Err(storage::invalid("DARK holds more scars than its capacity"));
        }
        let mut dark = Self::empty(cfg);
        dark.ticks = ticks;
        for _ in 0..n {
            let mass = storage::read_f32_le(cur)?;
            // Stored positions are ignored; placement is a function of the tokens.
            let _x = storage::read_f32_le(cur)?;
            let _y = storage::read_f32_le(cur)?;
            let created_at = storage::read_u64_le(cur)?;
            if !(mass.is_finite() && mass > 0.0) {
                return Err(storage::invalid("DARK scar mass must be positive"));
            }
            let len = storage::read_u32_le(cur)? as usize;
            if len.saturating_mul(4) > storage::remaining(cur) {
                return Err(storage::invalid("DARK scar length exceeds chunk"));
            }
            let tokens = (0..len)
                .map(|_| storage::read_u32_le(cur))
                .collect::<io::Result<Vec<_>>>()?;
            let (x, y) = dark.position_of(&tokens);
            dark.scars.push_back(Scar {
                tokens,
                mass,
                x,
                y,
                created_at,
            });
        }
        Ok(dark)
    }
}
