//! Controller side: volume lifecycle against the storage array

pub mod access;
pub mod cache;
pub mod listing;
pub mod service;

pub use access::{check_capability, validate_capabilities, AccessCheck};
pub use cache::VolumeCache;
pub use service::{ControllerConfig, ControllerService};
