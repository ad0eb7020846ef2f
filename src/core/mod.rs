//! Consensus-critical data model, serialization, parameters, and the
//! chain state engine. Everything under `core` is deterministic: no
//! I/O, no clocks beyond what callers pass in, no randomness.

pub mod chain;
pub mod params;
pub mod serialize;
pub mod types;
