//! Protocol Types - Typed requests and responses of the volume protocol
//!
//! These mirror the container storage interface messages the orchestrator
//! sends. The transport layer decodes them; services only see these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Capabilities
// =============================================================================

/// Requested sharing semantics of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Modes that allow only one node to use the volume
    pub fn is_single_node(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeWriter
                | AccessMode::SingleNodeReaderOnly
                | AccessMode::SingleNodeSingleWriter
                | AccessMode::SingleNodeMultiWriter
        )
    }

    /// Modes that never write to the volume
    pub fn is_reader_only(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly
        )
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessMode::Unknown => "UNKNOWN",
            AccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
            AccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            AccessMode::SingleNodeSingleWriter => "SINGLE_NODE_SINGLE_WRITER",
            AccessMode::SingleNodeMultiWriter => "SINGLE_NODE_MULTI_WRITER",
            AccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            AccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            AccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
        };
        f.write_str(s)
    }
}

/// Filesystem presentation options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountVolume {
    /// Filesystem type; empty means the driver default
    #[serde(default)]
    pub fs_type: String,
    /// Extra mount flags
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Requested presentation of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Block,
    Mount(MountVolume),
}

impl AccessType {
    pub fn is_block(&self) -> bool {
        matches!(self, AccessType::Block)
    }
}

/// A single capability the caller wants from a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    #[serde(default)]
    pub access_type: Option<AccessType>,
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
}

impl VolumeCapability {
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Block),
            access_mode: Some(mode),
        }
    }

    pub fn mount(mode: AccessMode, fs_type: &str) -> Self {
        Self {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: Vec::new(),
            })),
            access_mode: Some(mode),
        }
    }

    pub fn is_block(&self) -> bool {
        self.access_type.as_ref().map(AccessType::is_block).unwrap_or(false)
    }
}

/// Requested size bounds in bytes; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

/// Topology segment set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

/// Placement constraints supplied with a create request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

/// Data a new volume is populated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

// =============================================================================
// Volumes & Snapshots
// =============================================================================

/// A volume as reported to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// A snapshot as reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiSnapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    pub ready_to_use: bool,
}

// =============================================================================
// Controller Messages
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: CsiVolume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeResponse {
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Echo of the capabilities the plugin confirmed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Confirmed {
    pub volume_context: BTreeMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(default)]
    pub confirmed: Option<Confirmed>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<CsiVolume>,
    pub next_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<CsiSnapshot>,
    pub next_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: CsiSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityResponse {
    pub available_capacity: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

/// RPCs the controller service implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

// =============================================================================
// Node Messages
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
    #[serde(default)]
    pub staging_target_path: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeResponse {}

/// Staging requests are decoded only to be refused
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    #[serde(default)]
    pub max_volumes_per_node: i64,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

/// RPCs the node service implements beyond publish/unpublish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}

// =============================================================================
// Identity Messages
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_classes() {
        assert!(AccessMode::SingleNodeWriter.is_single_node());
        assert!(AccessMode::SingleNodeMultiWriter.is_single_node());
        assert!(!AccessMode::MultiNodeReaderOnly.is_single_node());
        assert!(AccessMode::MultiNodeReaderOnly.is_reader_only());
        assert!(!AccessMode::MultiNodeMultiWriter.is_reader_only());
    }

    #[test]
    fn test_capability_decoding() {
        let cap: VolumeCapability = serde_json::from_str(
            r#"{"access_type":{"mount":{"fs_type":"xfs"}},"access_mode":"MULTI_NODE_READER_ONLY"}"#,
        )
        .unwrap();
        assert_eq!(
            cap,
            VolumeCapability::mount(AccessMode::MultiNodeReaderOnly, "xfs")
        );

        let cap: VolumeCapability =
            serde_json::from_str(r#"{"access_type":"block","access_mode":"SINGLE_NODE_WRITER"}"#)
                .unwrap();
        assert!(cap.is_block());
    }

    #[test]
    fn test_missing_capability_fields() {
        let cap: VolumeCapability = serde_json::from_str("{}").unwrap();
        assert!(cap.access_type.is_none());
        assert!(cap.access_mode.is_none());
        assert!(!cap.is_block());
    }
}
