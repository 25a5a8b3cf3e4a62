//! Mount Manager - Private mount point protocol
//!
//! A device is mounted once, at a driver-owned private mount point
//! (`<private root>/<volume id>`), and every target path is a bind mount of
//! that private mount point. This lets several targets share one device
//! while the driver keeps a single place to check the device's rw/ro state.
//!
//! Publish:
//! 1. Target exists with the right type (file for block, dir for mount)
//! 2. Device not mounted anywhere: claim the private mount point and mount
//!    the device there (format-and-mount, plain mount for ro, bind for block)
//! 3. Device mounted at the private mount point: rw/ro must match
//! 4. Bind the private mount point onto the target unless already there
//!
//! Unpublish unmounts the target, then the private mount point once nothing
//! else exposes the device.

use crate::domain::csi::{AccessMode, AccessType, NodePublishVolumeRequest};
use crate::domain::ports::{Device, MountInfo, NodeHostRef};
use crate::error::{Error, Result};
use crate::retry::{Attempt, RequestContext, RetryPolicy};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Publish Plan
// =============================================================================

/// Validated publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPlan {
    pub volume_id: String,
    pub target: PathBuf,
    pub block: bool,
    pub fs_type: String,
    pub mount_flags: Vec<String>,
    pub read_only: bool,
}

impl PublishPlan {
    pub fn from_request(req: &NodePublishVolumeRequest, default_fs_type: &str) -> Result<Self> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(Error::InvalidArgument("target path required".into()));
        }
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability required".into()))?;
        let mode = cap
            .access_mode
            .ok_or_else(|| Error::InvalidArgument("volume access mode required".into()))?;
        if mode == AccessMode::Unknown {
            return Err(Error::InvalidArgument("volume access mode unknown".into()));
        }
        let access_type = cap
            .access_type
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume access type required".into()))?;

        let (block, fs_type, mount_flags, read_only) = match access_type {
            AccessType::Block => {
                // A ro bind of a device node still allows writes to the device
                if req.readonly {
                    return Err(Error::InvalidArgument(
                        "read only not supported for Block Volume".into(),
                    ));
                }
                (true, String::new(), Vec::new(), mode.is_reader_only())
            }
            AccessType::Mount(mnt) => {
                let fs_type = if mnt.fs_type.is_empty() {
                    default_fs_type.to_string()
                } else {
                    mnt.fs_type.clone()
                };
                let read_only = req.readonly || mode.is_reader_only();
                (false, fs_type, mnt.mount_flags.clone(), read_only)
            }
        };

        Ok(Self {
            volume_id: req.volume_id.clone(),
            target: PathBuf::from(&req.target_path),
            block,
            fs_type,
            mount_flags,
            read_only,
        })
    }
}

fn is_read_only(m: &MountInfo) -> bool {
    m.has_opt("ro")
}

// =============================================================================
// Mount Manager
// =============================================================================

pub struct MountManager {
    host: NodeHostRef,
    private_dir: PathBuf,
    dir_removal: RetryPolicy,
}

impl MountManager {
    pub fn new(host: NodeHostRef, private_dir: impl Into<PathBuf>, dir_removal: RetryPolicy) -> Self {
        Self {
            host,
            private_dir: private_dir.into(),
            dir_removal,
        }
    }

    /// Where the device of `volume_id` is mounted privately
    pub fn private_mount_point(&self, volume_id: &str) -> PathBuf {
        self.private_dir.join(volume_id)
    }

    async fn device_mounts(&self, ctx: &RequestContext, device: &Device) -> Result<Vec<MountInfo>> {
        let all = ctx.call("mount table", self.host.mounts()).await?;
        Ok(all.into_iter().filter(|m| m.is_of(device)).collect())
    }

    // =========================================================================
    // Publish
    // =========================================================================

    pub async fn publish(&self, ctx: &RequestContext, plan: &PublishPlan, device: &Device) -> Result<()> {
        ensure_target(&plan.target, plan.block).await?;

        let private = self.private_mount_point(&plan.volume_id);
        tokio::fs::create_dir_all(&self.private_dir).await?;

        let mounts = self.device_mounts(ctx, device).await?;
        match mounts.iter().find(|m| m.path == private) {
            Some(existing) => {
                // Block private mounts are always rw; only the target bind differs
                if !plan.block && is_read_only(existing) != plan.read_only {
                    return Err(Error::InvalidArgument(format!(
                        "access mode conflicts with existing mounts of {}",
                        device.name
                    )));
                }
            }
            None if mounts.is_empty() => {
                self.claim_private_mount_point(ctx, &private, plan.block)
                    .await?;
                self.mount_private(ctx, plan, device, &private).await?;
            }
            None => {
                return Err(Error::Internal(format!(
                    "device {} already in use and mounted elsewhere",
                    device.name
                )));
            }
        }

        let mounts = self.device_mounts(ctx, device).await?;
        if let Some(existing) = mounts.iter().find(|m| m.path == plan.target) {
            if is_read_only(existing) == plan.read_only {
                debug!("Volume {} already published at {}", plan.volume_id, plan.target.display());
                return Ok(());
            }
            return Err(Error::InvalidArgument(format!(
                "target {} already mounted with conflicting access",
                plan.target.display()
            )));
        }

        let mut opts = plan.mount_flags.clone();
        if plan.read_only {
            opts.push("ro".into());
        }
        ctx.call("bind mount", self.host.bind_mount(&private, &plan.target, &opts))
            .await?;

        info!(
            volume_id = %plan.volume_id,
            target = %plan.target.display(),
            read_only = plan.read_only,
            "volume published"
        );
        Ok(())
    }

    /// Create the private mount point, refusing one that is already in use
    async fn claim_private_mount_point(&self, ctx: &RequestContext, private: &Path, block: bool) -> Result<()> {
        let created = if block {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(private)
                .await
                .map(|_| ())
        } else {
            tokio::fs::create_dir(private).await
        };

        match created {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        // Leftover from an earlier run: reuse only if nothing is mounted there
        let all = ctx.call("mount table", self.host.mounts()).await?;
        if let Some(owner) = all.iter().find(|m| m.path == private) {
            return Err(Error::Internal(format!(
                "unable to use private mount point: {} already mounted from {}",
                private.display(),
                owner.device
            )));
        }
        let meta = tokio::fs::metadata(private).await?;
        if meta.is_dir() == block {
            return Err(Error::Internal(format!(
                "unable to use private mount point: {} has the wrong type",
                private.display()
            )));
        }
        debug!("Reusing stale private mount point {}", private.display());
        Ok(())
    }

    async fn mount_private(
        &self,
        ctx: &RequestContext,
        plan: &PublishPlan,
        device: &Device,
        private: &Path,
    ) -> Result<()> {
        if plan.block {
            return ctx
                .call("bind mount", self.host.bind_mount(&device.real_dev, private, &[]))
                .await;
        }

        let mut opts = plan.mount_flags.clone();
        if plan.fs_type == "xfs" {
            opts.push("nouuid".into());
        }
        if plan.read_only {
            opts.push("ro".into());
            ctx.call(
                "mount",
                self.host.mount(&device.real_dev, private, &plan.fs_type, &opts),
            )
            .await
        } else {
            ctx.call(
                "format and mount",
                self.host
                    .format_and_mount(&device.real_dev, private, &plan.fs_type, &opts),
            )
            .await
        }
    }

    // =========================================================================
    // Unpublish
    // =========================================================================

    /// Undo a publish; `device` is `None` when the volume is no longer attached
    pub async fn unpublish(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        target: &Path,
        device: Option<&Device>,
    ) -> Result<()> {
        let Some(device) = device else {
            let all = ctx.call("mount table", self.host.mounts()).await?;
            if all.iter().any(|m| m.path == target) {
                ctx.call("unmount", self.host.unmount(target)).await?;
                info!("Unmounted {} of detached volume {}", target.display(), volume_id);
            }
            return Ok(());
        };

        let mounts = self.device_mounts(ctx, device).await?;
        if mounts.iter().any(|m| m.path == target) {
            ctx.call("unmount", self.host.unmount(target)).await?;
            info!("Unmounted {} for volume {}", target.display(), volume_id);
        }

        let private = self.private_mount_point(volume_id);
        let mounts = self.device_mounts(ctx, device).await?;
        let elsewhere = mounts.iter().filter(|m| m.path != private).count();
        if elsewhere > 0 {
            debug!(
                "Device {} still exposed at {} path(s), keeping private mount",
                device.name, elsewhere
            );
            return Ok(());
        }

        if mounts.iter().any(|m| m.path == private) {
            ctx.call("unmount", self.host.unmount(&private)).await?;
            debug!("Unmounted private mount point {}", private.display());
        }
        self.remove_private_mount_point(ctx, &private).await
    }

    /// Remove the private mount point; the unmount may still be settling
    async fn remove_private_mount_point(&self, ctx: &RequestContext, private: &Path) -> Result<()> {
        let removed = self
            .dir_removal
            .poll(ctx, "private mount point removal", |attempt| async move {
                match remove_path(private).await {
                    Ok(()) => Ok(Attempt::Done(())),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Attempt::Done(())),
                    Err(e) => {
                        debug!(
                            "Removing {} failed (attempt {}): {}",
                            private.display(),
                            attempt + 1,
                            e
                        );
                        Ok(Attempt::Retry)
                    }
                }
            })
            .await?;

        if removed.is_none() {
            warn!("Falling back to external removal of {}", private.display());
            ctx.call("remove dir", self.host.remove_dir(private)).await?;
        }
        Ok(())
    }
}

/// Check or create the target with the type the access type needs
async fn ensure_target(target: &Path, block: bool) -> Result<()> {
    match tokio::fs::metadata(target).await {
        Ok(meta) => {
            if block && meta.is_dir() {
                return Err(Error::FailedPrecondition(format!(
                    "target: {} wrong type (directory) Access Type (block)",
                    target.display()
                )));
            }
            if !block && !meta.is_dir() {
                return Err(Error::FailedPrecondition(format!(
                    "target: {} wrong type (file) Access Type (mount)",
                    target.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if block {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::File::create(target).await?;
            } else {
                tokio::fs::create_dir_all(target).await?;
            }
            debug!("Created target {}", target.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::csi::VolumeCapability;
    use crate::node::testing::FakeHost;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        host: Arc<FakeHost>,
        mgr: MountManager,
        dir: TempDir,
        device: Device,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let device = host.attach("vol1", "scinia");
        let mgr = MountManager::new(
            host.clone(),
            dir.path().join("private"),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        Fixture {
            host,
            mgr,
            dir,
            device,
        }
    }

    fn request(target: &Path, cap: VolumeCapability, readonly: bool) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "vol1".into(),
            target_path: target.display().to_string(),
            volume_capability: Some(cap),
            readonly,
            ..Default::default()
        }
    }

    fn plan(target: &Path, cap: VolumeCapability, readonly: bool) -> PublishPlan {
        PublishPlan::from_request(&request(target, cap, readonly), "ext4").unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::background()
    }

    #[test]
    fn test_plan_rejects_read_only_block() {
        let req = request(
            Path::new("/t"),
            VolumeCapability::block(AccessMode::SingleNodeWriter),
            true,
        );
        let err = PublishPlan::from_request(&req, "ext4").unwrap_err();
        assert_matches!(err, Error::InvalidArgument(ref m) if m == "read only not supported for Block Volume");
    }

    #[test]
    fn test_plan_defaults() {
        let mut cap = VolumeCapability::mount(AccessMode::MultiNodeReaderOnly, "");
        let p = plan(Path::new("/t"), cap.clone(), false);
        assert_eq!(p.fs_type, "ext4");
        assert!(p.read_only);
        assert!(!p.block);

        cap.access_mode = Some(AccessMode::Unknown);
        let req = request(Path::new("/t"), cap, false);
        assert_matches!(
            PublishPlan::from_request(&req, "ext4"),
            Err(Error::InvalidArgument(_))
        );

        let mut req = request(
            Path::new("/t"),
            VolumeCapability::block(AccessMode::SingleNodeWriter),
            false,
        );
        req.target_path.clear();
        assert_matches!(
            PublishPlan::from_request(&req, "ext4"),
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_publish_mount_volume() {
        let f = fixture();
        let target = f.dir.path().join("pods/a/mount");
        let p = plan(&target, VolumeCapability::mount(AccessMode::SingleNodeWriter, "xfs"), false);

        f.mgr.publish(&ctx(), &p, &f.device).await.unwrap();

        let private = f.mgr.private_mount_point("vol1");
        assert!(target.is_dir());
        assert!(private.is_dir());
        assert!(f.host.is_mounted(&private));
        assert!(f.host.is_mounted(&target));
        assert_eq!(f.host.format_calls(), 1);

        let private_entry = f
            .host
            .mount_table()
            .into_iter()
            .find(|m| m.path == private)
            .unwrap();
        assert!(private_entry.has_opt("nouuid"));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let f = fixture();
        let target = f.dir.path().join("target");
        let p = plan(&target, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false);

        f.mgr.publish(&ctx(), &p, &f.device).await.unwrap();
        f.mgr.publish(&ctx(), &p, &f.device).await.unwrap();

        assert_eq!(f.host.mount_table().len(), 2);
        assert_eq!(f.host.format_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_target_shares_private_mount() {
        let f = fixture();
        let cap = VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4");
        let t1 = f.dir.path().join("t1");
        let t2 = f.dir.path().join("t2");

        f.mgr.publish(&ctx(), &plan(&t1, cap.clone(), false), &f.device).await.unwrap();
        f.mgr.publish(&ctx(), &plan(&t2, cap, false), &f.device).await.unwrap();

        assert_eq!(f.host.mount_table().len(), 3);
        assert_eq!(f.host.format_calls(), 1);
    }

    #[tokio::test]
    async fn test_read_only_filesystem_skips_format() {
        let f = fixture();
        let target = f.dir.path().join("ro");
        let p = plan(&target, VolumeCapability::mount(AccessMode::MultiNodeReaderOnly, "ext4"), false);

        f.mgr.publish(&ctx(), &p, &f.device).await.unwrap();

        assert_eq!(f.host.format_calls(), 0);
        assert!(f.host.mount_table().iter().all(|m| m.has_opt("ro")));
    }

    #[tokio::test]
    async fn test_rw_ro_conflict_with_private_mount() {
        let f = fixture();
        let t1 = f.dir.path().join("t1");
        let t2 = f.dir.path().join("t2");
        f.mgr
            .publish(
                &ctx(),
                &plan(&t1, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false),
                &f.device,
            )
            .await
            .unwrap();

        let err = f
            .mgr
            .publish(
                &ctx(),
                &plan(&t2, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), true),
                &f.device,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_publish_block_volume() {
        let f = fixture();
        let target = f.dir.path().join("dev/block/vol1");
        let p = plan(&target, VolumeCapability::block(AccessMode::SingleNodeWriter), false);

        f.mgr.publish(&ctx(), &p, &f.device).await.unwrap();

        let private = f.mgr.private_mount_point("vol1");
        assert!(target.is_file());
        assert!(private.is_file());
        assert_eq!(f.host.format_calls(), 0);
        let table = f.host.mount_table();
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|m| m.is_of(&f.device)));
    }

    #[tokio::test]
    async fn test_reader_only_block_target_is_read_only() {
        let f = fixture();
        let ro_target = f.dir.path().join("dev/block/ro");
        let rw_target = f.dir.path().join("dev/block/rw");
        let ro = plan(&ro_target, VolumeCapability::block(AccessMode::MultiNodeReaderOnly), false);
        assert!(ro.read_only);

        f.mgr.publish(&ctx(), &ro, &f.device).await.unwrap();
        f.mgr.publish(&ctx(), &ro, &f.device).await.unwrap();

        let table = f.host.mount_table();
        let private = f.mgr.private_mount_point("vol1");
        let entry = |path: &Path| table.iter().find(|m| m.path == path).cloned().unwrap();
        assert!(entry(&ro_target).has_opt("ro"));
        assert!(!entry(&private).has_opt("ro"));

        let rw = plan(&rw_target, VolumeCapability::block(AccessMode::MultiNodeMultiWriter), false);
        f.mgr.publish(&ctx(), &rw, &f.device).await.unwrap();
        let table = f.host.mount_table();
        assert_eq!(table.len(), 3);
        let rw_entry = table.iter().find(|m| m.path == rw_target).unwrap();
        assert!(!rw_entry.has_opt("ro"));
    }

    #[tokio::test]
    async fn test_target_type_mismatch() {
        let f = fixture();
        let file = f.dir.path().join("file");
        std::fs::write(&file, b"").unwrap();

        let err = f
            .mgr
            .publish(
                &ctx(),
                &plan(&file, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false),
                &f.device,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::FailedPrecondition(_));

        let err = f
            .mgr
            .publish(
                &ctx(),
                &plan(f.dir.path(), VolumeCapability::block(AccessMode::SingleNodeWriter), false),
                &f.device,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::FailedPrecondition(_));
    }

    #[tokio::test]
    async fn test_stale_private_mount_point_in_use() {
        let f = fixture();
        let private = f.mgr.private_mount_point("vol1");
        std::fs::create_dir_all(&private).unwrap();
        f.host.add_mount("/dev/sdz", &private, &["rw"]);

        let target = f.dir.path().join("target");
        let err = f
            .mgr
            .publish(
                &ctx(),
                &plan(&target, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false),
                &f.device,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Internal(ref m) if m.contains("unable to use private mount point"));
    }

    #[tokio::test]
    async fn test_stale_private_mount_point_reused() {
        let f = fixture();
        let private = f.mgr.private_mount_point("vol1");
        std::fs::create_dir_all(&private).unwrap();

        let target = f.dir.path().join("target");
        f.mgr
            .publish(
                &ctx(),
                &plan(&target, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false),
                &f.device,
            )
            .await
            .unwrap();
        assert!(f.host.is_mounted(&private));
    }

    #[tokio::test]
    async fn test_device_mounted_elsewhere() {
        let f = fixture();
        f.host.add_mount("/dev/scinia", Path::new("/mnt/manual"), &["rw"]);

        let target = f.dir.path().join("target");
        let err = f
            .mgr
            .publish(
                &ctx(),
                &plan(&target, VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"), false),
                &f.device,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Internal(ref m) if m.contains("mounted elsewhere"));
    }

    #[tokio::test]
    async fn test_unpublish_keeps_private_until_last_target() {
        let f = fixture();
        let cap = VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4");
        let t1 = f.dir.path().join("t1");
        let t2 = f.dir.path().join("t2");
        f.mgr.publish(&ctx(), &plan(&t1, cap.clone(), false), &f.device).await.unwrap();
        f.mgr.publish(&ctx(), &plan(&t2, cap, false), &f.device).await.unwrap();
        let private = f.mgr.private_mount_point("vol1");

        f.mgr
            .unpublish(&ctx(), "vol1", &t1, Some(&f.device))
            .await
            .unwrap();
        assert!(!f.host.is_mounted(&t1));
        assert!(f.host.is_mounted(&private));

        f.mgr
            .unpublish(&ctx(), "vol1", &t2, Some(&f.device))
            .await
            .unwrap();
        assert!(f.host.mount_table().is_empty());
        assert!(!private.exists());

        // Again, with nothing left to do
        f.mgr
            .unpublish(&ctx(), "vol1", &t2, Some(&f.device))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unpublish_detached_device() {
        let f = fixture();
        let target = f.dir.path().join("target");
        f.host.add_mount("/dev/scinia", &target, &["rw"]);

        f.mgr.unpublish(&ctx(), "vol1", &target, None).await.unwrap();
        assert!(!f.host.is_mounted(&target));

        f.mgr.unpublish(&ctx(), "vol1", &target, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_private_removal_falls_back_to_host() {
        let f = fixture();
        let private = f.mgr.private_mount_point("vol1");
        std::fs::create_dir_all(private.join("leftover")).unwrap();

        f.mgr
            .unpublish(&ctx(), "vol1", &f.dir.path().join("target"), Some(&f.device))
            .await
            .unwrap();
        assert_eq!(f.host.removed_dirs(), vec![private]);
    }
}
