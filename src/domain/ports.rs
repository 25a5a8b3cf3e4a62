//! Domain Ports - Array and host boundaries of the plugin
//!
//! The controller talks to the storage array only through [`ArrayGateway`];
//! the node talks to the local machine only through [`NodeHost`]. Adapters
//! implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Array Model
// =============================================================================

/// Record of a volume being attached to a compute host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMapping {
    pub host_id: String,
    pub host_ip: String,
}

/// Space allocation policy of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningType {
    #[default]
    #[serde(rename = "ThinProvisioned")]
    Thin,
    #[serde(rename = "ThickProvisioned")]
    Thick,
}

impl std::fmt::Display for ProvisioningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningType::Thin => write!(f, "ThinProvisioned"),
            ProvisioningType::Thick => write!(f, "ThickProvisioned"),
        }
    }
}

/// A volume or snapshot as the array reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_kb: u64,
    pub storage_pool_id: String,
    /// Set only on snapshots
    pub ancestor_volume_id: Option<String>,
    pub consistency_group_id: Option<String>,
    pub mappings: Vec<HostMapping>,
    pub provisioning: ProvisioningType,
    pub creation_time: Option<DateTime<Utc>>,
}

impl Volume {
    pub fn is_snapshot(&self) -> bool {
        self.ancestor_volume_id
            .as_deref()
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }

    pub fn is_mapped(&self) -> bool {
        !self.mappings.is_empty()
    }

    pub fn is_mapped_to(&self, host_id: &str) -> bool {
        self.mappings.iter().any(|m| m.host_id == host_id)
    }

    pub fn size_bytes(&self) -> i64 {
        (self.size_kb as i64).saturating_mul(1024)
    }
}

/// Parameters for a volume creation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVolume {
    pub name: String,
    pub size_kb: u64,
    pub storage_pool_id: String,
    pub provisioning: ProvisioningType,
}

/// A storage pool of the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub protection_domain_id: String,
}

/// The array system the session is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub name: String,
}

/// A compute host known to the array (the host agent's registration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub guid: String,
    pub ip: String,
}

/// Capacity figures in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityStats {
    pub total_kb: u64,
    pub available_for_allocation_kb: u64,
}

/// One member of a consistency-group snapshot call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDef {
    pub volume_id: String,
    /// Empty lets the array pick a name
    pub snapshot_name: String,
}

/// Result of a consistency-group snapshot call, in definition order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotGroup {
    pub group_id: String,
    pub volume_ids: Vec<String>,
}

// =============================================================================
// Array Gateway Port
// =============================================================================

/// Port for the storage array's management API
///
/// Failures the controller reacts to are reported as
/// [`Error::Array`](crate::error::Error::Array) with a classified kind.
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Establish (or refresh) an authenticated session
    async fn authenticate(&self) -> Result<()>;

    /// Resolve the configured target system
    async fn system(&self) -> Result<SystemInfo>;

    /// Create a volume and return its ID
    async fn create_volume(&self, spec: &NewVolume) -> Result<String>;

    /// Fetch one volume or snapshot by ID
    async fn volume(&self, id: &str) -> Result<Volume>;

    /// Look up a volume ID by name
    async fn volume_id_by_name(&self, name: &str) -> Result<String>;

    /// All volumes and snapshots of the system
    async fn volumes(&self) -> Result<Vec<Volume>>;

    /// Snapshots whose ancestor is the given volume
    async fn volumes_by_ancestor(&self, ancestor_id: &str) -> Result<Vec<Volume>>;

    /// Remove a single volume or snapshot
    async fn remove_volume(&self, id: &str) -> Result<()>;

    async fn storage_pool_by_id(&self, id: &str) -> Result<StoragePool>;

    async fn storage_pool_by_name(&self, name: &str) -> Result<StoragePool>;

    /// Find the host registered with the given GUID
    async fn host_by_guid(&self, guid: &str) -> Result<Host>;

    /// Attach a volume to a host
    async fn map_volume(&self, volume_id: &str, host_id: &str, allow_multiple: bool)
        -> Result<()>;

    /// Detach a volume from a host
    async fn unmap_volume(&self, volume_id: &str, host_id: &str) -> Result<()>;

    /// Snapshot every listed volume atomically as one consistency group
    async fn snapshot_volumes(&self, defs: &[SnapshotDef]) -> Result<SnapshotGroup>;

    async fn pool_capacity(&self, pool_id: &str) -> Result<CapacityStats>;

    async fn system_capacity(&self) -> Result<CapacityStats>;
}

// =============================================================================
// Node Host Model
// =============================================================================

/// A volume the local host agent has made visible as a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub volume_id: String,
    pub system_id: String,
    pub device_path: PathBuf,
}

/// A local block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Path the device was found at (often a symlink)
    pub full_path: PathBuf,
    /// Device node after symlink resolution
    pub real_dev: PathBuf,
    pub name: String,
}

/// One entry of the host mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Mount source as listed (device node, or the devtmpfs name for binds)
    pub device: String,
    pub path: PathBuf,
    /// Backing device of a bind mount taken from a device filesystem
    pub source: String,
    pub fs_type: String,
    pub opts: Vec<String>,
}

impl MountInfo {
    /// True if this entry exposes the given device
    pub fn is_of(&self, dev: &Device) -> bool {
        let real = dev.real_dev.to_string_lossy();
        let full = dev.full_path.to_string_lossy();
        self.device == real || self.device == full || self.source == real
    }

    pub fn has_opt(&self, opt: &str) -> bool {
        self.opts.iter().any(|o| o == opt)
    }
}

// =============================================================================
// Node Host Port
// =============================================================================

/// Port for local host operations on a compute node
#[async_trait]
pub trait NodeHost: Send + Sync {
    /// GUID the host agent registered with the array
    async fn host_guid(&self) -> Result<String>;

    /// Check the loaded kernel module list for a module
    async fn kernel_module_loaded(&self, module: &str) -> Result<bool>;

    /// Volumes currently visible as local devices
    async fn local_volumes(&self) -> Result<Vec<LocalVolume>>;

    /// Resolve a path to a block device, failing if it is not one
    async fn block_device(&self, path: &Path) -> Result<Device>;

    /// Current mount table
    async fn mounts(&self) -> Result<Vec<MountInfo>>;

    async fn bind_mount(&self, source: &Path, target: &Path, opts: &[String]) -> Result<()>;

    /// Format the device if it carries no filesystem, then mount it
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        opts: &[String],
    ) -> Result<()>;

    /// Mount without formatting
    async fn mount(&self, device: &Path, target: &Path, fs_type: &str, opts: &[String])
        -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Remove a directory through an external tool
    async fn remove_dir(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ArrayGatewayRef = Arc<dyn ArrayGateway>;
pub type NodeHostRef = Arc<dyn NodeHost>;
