//! Reproducible measurements over the lung and its memory.

pub mod assays;
