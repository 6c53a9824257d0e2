//! A body bundles one lung with its dark-matter memory and injection gate.
//!
//! This is the unit a movement collaborator talks to: feed tokens in, get a
//! movement vector back, query the scar field, tick memory.

use std::io::{self, Cursor, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dark_matter::{DarkMatter, DarkMatterConfig};
use crate::error::{LungError, Result};
use crate::gate::{FieldPulse, GateConfig, Injection, InjectionGate};
use crate::lung::{Breath, Lung, LungConfig, TokenId};
use crate::notorch::TrainReport;
use crate::storage;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BodyConfig {
    pub lung: LungConfig,
    pub dark_matter: DarkMatterConfig,
    pub gate: GateConfig,
}

impl BodyConfig {
    pub fn validate(&self) -> Result<()> {
        self.lung.validate()?;
        self.dark_matter
            .validate()
            .map_err(|reason| LungError::config("dark_matter", reason))?;
        self.gate
            .validate()
            .map_err(|reason| LungError::config("gate", reason))?;
        Ok(())
    }

    /// Parse a JSON config. Missing fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    #[cfg(feature = "serde")]
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone)]
pub struct Body {
    pub lung: Lung,
    pub dark_matter: DarkMatter,
    pub gate: InjectionGate,
}

impl Body {
    pub fn new(cfg: BodyConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            lung: Lung::new(cfg.lung)?,
            dark_matter: DarkMatter::new(cfg.dark_matter)?,
            gate: InjectionGate::new(cfg.gate),
        })
    }

    pub fn forward(&mut self, context: &[TokenId]) -> Breath {
        self.lung.forward(context)
    }

    pub fn train_step(&mut self, context: &[TokenId], target: TokenId) -> Result<TrainReport> {
        self.lung.train_step(context, target)
    }

    pub fn inject(&mut self, tokens: &[TokenId], pulse: FieldPulse) -> Injection {
        self.gate
            .inject(&mut self.lung, &mut self.dark_matter, tokens, pulse)
    }

    /// Advance dark-matter memory by one tick; returns scars removed.
    pub fn tick(&mut self) -> usize {
        self.dark_matter.step()
    }

    pub fn potential(&self, x: f32, y: f32) -> f32 {
        self.dark_matter.potential(x, y)
    }

    pub fn gradient(&self, x: f32, y: f32) -> (f32, f32) {
        self.dark_matter.gradient(x, y)
    }

    /// Lung image followed by a `DARK` chunk.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_header(w)?;
        storage::write_lung_chunks(&self.lung, w)?;
        let mut payload = Vec::new();
        self.dark_matter.write_image_payload(&mut payload)?;
        storage::write_chunk_lz4(w, storage::TAG_DARK, &payload)
    }

    /// Load a body image. A plain lung image loads with empty default memory.
    pub fn load_image_from<R: Read>(r: &mut R, gate: GateConfig) -> io::Result<Self> {
        let (lung, dark) = storage::read_image(r)?;
        Ok(Self {
            lung,
            dark_matter: dark.unwrap_or_default(),
            gate: InjectionGate::new(gate),
        })
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    /// Encode the image, failing with `WriteZero` if it would exceed
    /// `max_bytes`. `None` means unbounded.
    pub fn save_image_bounded(&self, max_bytes: Option<usize>) -> io::Result<Vec<u8>> {
        match max_bytes {
            Some(limit) => {
                let mut w = storage::BoundedWriter::new(Vec::new(), limit);
                self.save_image_to(&mut w)?;
                Ok(w.into_inner())
            }
            None => self.save_image_bytes(),
        }
    }

    pub fn load_image_bytes(bytes: &[u8], gate: GateConfig) -> io::Result<Self> {
        Self::load_image_from(&mut Cursor::new(bytes), gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sub_configs_are_reported_by_field() {
        let mut cfg = BodyConfig::default();
        cfg.gate.top_k = 0;
        assert_eq!(
            Body::new(cfg).unwrap_err(),
            LungError::Configuration {
                field: "gate",
                reason: "top_k must be > 0"
            }
        );

        let mut cfg = BodyConfig::default();
        cfg.dark_matter.capacity = 0;
        assert!(matches!(
            Body::new(cfg),
            Err(LungError::Configuration {
                field: "dark_matter",
                ..
            })
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_config_fills_defaults() {
        let cfg = BodyConfig::from_json_str(
            r#"{ "lung": { "vocab_size": 64, "seed": 9 }, "gate": { "accept_threshold": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.lung.vocab_size, 64);
        assert_eq!(cfg.lung.seed, Some(9));
        assert_eq!(cfg.lung.d_model, LungConfig::default().d_model);
        assert_eq!(cfg.gate.accept_threshold, 0.5);
        assert_eq!(cfg.dark_matter, DarkMatterConfig::default());

        let back = BodyConfig::from_json_str(&cfg.to_json_pretty().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn tick_drives_memory() {
        let mut body = Body::new(BodyConfig::default()).unwrap();
        body.lung.fill_resonance(0.1);
        let out = body.inject(&[10, 20, 30], FieldPulse::default());
        assert!(!out.accepted);
        let before = body.dark_matter.total_mass();
        body.tick();
        assert!(body.dark_matter.total_mass() < before);
        assert_eq!(body.dark_matter.ticks(), 1);
    }

    #[test]
    fn bounded_save_respects_the_budget() {
        let mut body = Body::new(BodyConfig::default()).unwrap();
        body.lung.fill_resonance(0.1);
        body.inject(&[4, 5, 6], FieldPulse::default());

        let full = body.save_image_bounded(None).unwrap();
        assert_eq!(body.save_image_bounded(Some(full.len())).unwrap(), full);
        let err = body.save_image_bounded(Some(full.len() - 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
