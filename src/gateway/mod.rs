//! Array gateway adapters
//!
//! - [`RestGateway`]: the array's REST management API
//! - [`SimulatedArray`]: in-memory array for standalone runs and tests

pub mod memory;
pub mod rest;

pub use memory::{SimulatedArray, SimulatedArrayConfig};
pub use rest::{RestGateway, RestGatewayConfig};
