//! Node Service - Presenting volumes on a compute host
//!
//! Publish/unpublish run the private mount point protocol of
//! [`MountManager`] on the device found by [`DeviceResolver`]. The probe
//! gate requires the host GUID the array knows this node by and a loaded
//! storage client kernel module.

use crate::domain::csi::*;
use crate::domain::ports::NodeHostRef;
use crate::error::{Error, Result};
use crate::node::device::DeviceResolver;
use crate::node::mount::{MountManager, PublishPlan};
use crate::retry::{RequestContext, RetryPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Node behaviour switches
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the per-volume private mount points
    pub private_mount_dir: PathBuf,
    /// Overrides the GUID reported by the host agent
    pub host_guid: Option<String>,
    /// Kernel module of the storage data client
    pub kernel_module: String,
    pub auto_probe: bool,
    /// Waiting for a mapped volume to appear as a device
    pub device_discovery: RetryPolicy,
    /// Removing a private mount point after unmount
    pub dir_removal: RetryPolicy,
    /// Filesystem used when the capability names none
    pub default_fs_type: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_mount_dir: PathBuf::from("/var/lib/kubelet/plugins/flexblock.csi/disks"),
            host_guid: None,
            kernel_module: "scini".to_string(),
            auto_probe: true,
            device_discovery: RetryPolicy::new(20, Duration::from_secs(1)),
            dir_removal: RetryPolicy::new(3, Duration::from_secs(3)),
            default_fs_type: "ext4".to_string(),
        }
    }
}

fn probe_error(what: &str, err: Error) -> Error {
    match err {
        Error::Cancelled(_) | Error::DeadlineExceeded(_) => err,
        other => Error::FailedPrecondition(format!("{}: {}", what, other)),
    }
}

/// Node side of the plugin
pub struct NodeService {
    config: NodeConfig,
    host: NodeHostRef,
    resolver: DeviceResolver,
    mounts: MountManager,
    /// Host GUID, set once probed
    node_id: tokio::sync::RwLock<Option<String>>,
}

impl NodeService {
    pub fn new(config: NodeConfig, host: NodeHostRef) -> Self {
        let resolver = DeviceResolver::new(host.clone(), config.device_discovery);
        let mounts = MountManager::new(host.clone(), &config.private_mount_dir, config.dir_removal);
        Self {
            config,
            host,
            resolver,
            mounts,
            node_id: tokio::sync::RwLock::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // =========================================================================
    // Probe
    // =========================================================================

    /// Resolve the host GUID and check the data client module
    pub async fn probe(&self, ctx: &RequestContext) -> Result<String> {
        let guid = match &self.config.host_guid {
            Some(guid) if !guid.is_empty() => guid.clone(),
            _ => ctx
                .call("host guid", self.host.host_guid())
                .await
                .map_err(|e| probe_error("unable to get host GUID", e))?,
        };

        let loaded = ctx
            .call(
                "kernel modules",
                self.host.kernel_module_loaded(&self.config.kernel_module),
            )
            .await
            .map_err(|e| probe_error("unable to read kernel modules", e))?;
        if !loaded {
            return Err(Error::FailedPrecondition(format!(
                "device driver module {} not loaded",
                self.config.kernel_module
            )));
        }

        info!("Node probed with host GUID {}", guid);
        *self.node_id.write().await = Some(guid.clone());
        Ok(guid)
    }

    pub async fn is_probed(&self) -> bool {
        self.node_id.read().await.is_some()
    }

    async fn ensure_probed(&self, ctx: &RequestContext) -> Result<String> {
        if let Some(guid) = self.node_id.read().await.clone() {
            return Ok(guid);
        }
        if !self.config.auto_probe {
            return Err(Error::FailedPrecondition(
                "Node Service has not been probed".into(),
            ));
        }
        debug!("Auto-probing node on first use");
        self.probe(ctx).await
    }

    // =========================================================================
    // Publish / Unpublish
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    pub async fn node_publish_volume(
        &self,
        ctx: &RequestContext,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse> {
        self.ensure_probed(ctx).await?;
        let plan = PublishPlan::from_request(&req, &self.config.default_fs_type)?;

        let device = self.resolver.resolve(ctx, &plan.volume_id).await?;
        debug!(
            "Volume {} is device {} ({})",
            plan.volume_id,
            device.name,
            device.real_dev.display()
        );

        self.mounts.publish(ctx, &plan, &device).await?;
        Ok(NodePublishVolumeResponse {})
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    pub async fn node_unpublish_volume(
        &self,
        ctx: &RequestContext,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse> {
        self.ensure_probed(ctx).await?;
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path required".into()));
        }

        let device = self.resolver.lookup(ctx, &req.volume_id).await?;
        if device.is_none() {
            debug!("Volume {} no longer attached", req.volume_id);
        }
        self.mounts
            .unpublish(ctx, &req.volume_id, Path::new(&req.target_path), device.as_ref())
            .await?;

        info!("Volume {} unpublished from {}", req.volume_id, req.target_path);
        Ok(NodeUnpublishVolumeResponse {})
    }

    // =========================================================================
    // Info / Capabilities
    // =========================================================================

    pub async fn node_get_info(&self, ctx: &RequestContext) -> Result<NodeGetInfoResponse> {
        let node_id = self.ensure_probed(ctx).await?;
        Ok(NodeGetInfoResponse {
            node_id,
            ..Default::default()
        })
    }

    /// No staging, stats or expansion
    pub fn node_get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse::default()
    }

    pub async fn node_stage_volume(
        &self,
        _ctx: &RequestContext,
        _req: NodeStageVolumeRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented("NodeStageVolume".into()))
    }

    pub async fn node_unstage_volume(
        &self,
        _ctx: &RequestContext,
        _req: NodeUnstageVolumeRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented("NodeUnstageVolume".into()))
    }

    pub async fn node_expand_volume(
        &self,
        _ctx: &RequestContext,
        _req: NodeExpandVolumeRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented("NodeExpandVolume".into()))
    }

    pub async fn node_get_volume_stats(
        &self,
        _ctx: &RequestContext,
        _req: NodeGetVolumeStatsRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented("NodeGetVolumeStats".into()))
    }
}
