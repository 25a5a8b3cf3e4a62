//! Domain layer - Protocol messages and port definitions
//!
//! This module defines the typed protocol surface and the core traits
//! (ports) that adapters implement, following hexagonal architecture
//! principles.

pub mod csi;
pub mod ports;

pub use csi::*;
pub use ports::*;
