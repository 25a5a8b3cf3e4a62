//! Node side of the plugin
//!
//! - [`DeviceResolver`]: array volume -> local block device
//! - [`MountManager`]: private mount points and target bind mounts
//! - [`LinuxHost`]: the [`NodeHost`](crate::domain::ports::NodeHost) of a real machine
//! - [`NodeService`]: the node operations

pub mod device;
pub mod host;
pub mod mount;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use device::DeviceResolver;
pub use host::{LinuxHost, LinuxHostConfig};
pub use mount::{MountManager, PublishPlan};
pub use service::{NodeConfig, NodeService};
