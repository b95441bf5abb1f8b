//! Ambient runtime configuration shared by the DCNet crates.
//!
//! * [`determinism`] derives reproducible RNG streams from environment switches.
//! * [`tracing`] installs the global `tracing` subscriber.
//! * [`layered`] merges TOML/JSON configuration files into typed sections.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use layered::{ConfigLayering, LayeredConfig, LayeredConfigError};
