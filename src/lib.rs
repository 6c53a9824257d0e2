//! # lung
//!
//! A tiny bidirectional attention kernel with online learning, plus a
//! decaying "dark matter" memory of rejected inputs.
//!
//! The lung reads a token window without a causal mask, can read it
//! left-to-right or right-to-left, and bends its attention with per-token
//! resonance, a presence trace and a temporal tilt. Only the output
//! projection learns by gradient; resonance learns by a simple correctness
//! rule. Rejected injections leave scars whose field pushes movement away.
//!
//! ## Quick Start
//!
//! ```
//! use lung::prelude::*;
//!
//! let mut body = Body::new(BodyConfig {
//!     lung: LungConfig::with_dims(64, 16, 8, 4).with_seed(7),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let breath = body.forward(&[1, 2, 3]);
//! assert_eq!(breath.attention.len(), 8);
//!
//! let report = body.train_step(&[1, 2, 3], 4).unwrap();
//! assert!(report.loss > 0.0);
//!
//! let moved = body.inject(&[5, 6], FieldPulse::default());
//! let (gx, gy) = body.gradient(moved.dx, moved.dy);
//! # let _ = (gx, gy);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): config and snapshot serialization, JSON configs
//! - `parallel`: attention heads on the rayon pool
//! - `simd`: four-lane dot products via the `wide` crate
//!
//! ## Modules
//!
//! - [`lung`]: forward pass, knobs, state mirror
//! - [`notorch`]: training step and the activation slot
//! - [`dark_matter`]: scar memory and its field
//! - [`gate`]: accept/reject policy for injections
//! - [`body`]: lung + memory + gate bundle
//! - [`storage`]: chunked image persistence
//! - [`ffi`] / [`mirror`]: C ABI and the engine driven through it
//! - [`observer`]: read-only observation adapters

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/tensor.rs"]
pub mod tensor;

#[path = "core/lung.rs"]
pub mod lung;

#[path = "core/notorch.rs"]
pub mod notorch;

#[path = "core/dark_matter.rs"]
pub mod dark_matter;

#[path = "core/gate.rs"]
pub mod gate;

#[path = "core/body.rs"]
pub mod body;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/ffi.rs"]
pub mod ffi;

#[path = "core/mirror.rs"]
pub mod mirror;

pub mod experiments;
pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use lung::prelude::*;
/// ```
pub mod prelude {
    pub use crate::body::{Body, BodyConfig};
    pub use crate::dark_matter::{DarkMatter, DarkMatterConfig, Scar};
    pub use crate::engine::Engine;
    pub use crate::error::LungError;
    pub use crate::gate::{FieldPulse, GateConfig, Injection, InjectionGate};
    pub use crate::lung::{
        Breath, ExecutionTier, Lung, LungConfig, StateField, TemporalMode, TokenId, STATE_LEN,
        STATE_VERSION,
    };
    pub use crate::mirror::ForeignLung;
    pub use crate::notorch::TrainReport;
    pub use crate::observer::{BodyAdapter, BodySnapshot, LungAdapter, LungSnapshot};
}
