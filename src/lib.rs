//! FlexBlock CSI - Container storage plugin for block storage arrays
//!
//! Provisions volumes on a software-defined block array and presents them
//! on compute hosts, driven by a container orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  RPC transport (axum, JSON over HTTP)                │
//! ├──────────────────┬──────────────────────────┬───────────────────────┤
//! │     Identity     │        Controller        │         Node          │
//! │  info / probe    │  volume lifecycle state  │  device resolver      │
//! │                  │  machine, volume cache,  │  mount manager        │
//! │                  │  capacity quantizer      │  (private mounts)     │
//! ├──────────────────┴────────────┬─────────────┴───────────────────────┤
//! │        ArrayGateway port      │            NodeHost port            │
//! │  RestGateway | SimulatedArray │        LinuxHost | test fakes       │
//! └───────────────────────────────┴─────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Controller service, listing cache and access checks
//! - [`node`]: Node service, device discovery and mount handling
//! - [`identity`]: Plugin identity and readiness
//! - [`gateway`]: Array gateway adapters
//! - [`api`]: RPC router and server
//! - [`domain`]: Protocol messages and ports
//! - [`error`]: Error types and handling

pub mod api;
pub mod capacity;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod retry;

// Re-export commonly used types
pub use api::{RpcServer, RpcState};
pub use config::{ArrayConfig, DriverConfig, Mode};
pub use controller::{ControllerConfig, ControllerService};
pub use domain::ports::{ArrayGateway, ArrayGatewayRef, NodeHost, NodeHostRef};
pub use error::{ArrayErrorKind, Code, Error, Result};
pub use gateway::{RestGateway, RestGatewayConfig, SimulatedArray, SimulatedArrayConfig};
pub use identity::IdentityService;
pub use metrics::RpcMetrics;
pub use node::{LinuxHost, LinuxHostConfig, NodeConfig, NodeService};
pub use retry::{RequestContext, RetryPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
