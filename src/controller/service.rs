//! Controller Service - Volume lifecycle against the array
//!
//! Implements create/delete/publish/unpublish/validate/list/snapshot and
//! capacity operations. Every operation:
//! - passes the probe gate (an authenticated array session)
//! - is idempotent against the array's own state
//! - clears the listing cache after any mutation
//!
//! The array is eventually consistent, so freshly created volumes and
//! in-flight removals are awaited with bounded polls that observe the
//! caller's [`RequestContext`].

use crate::capacity::validate_vol_size;
use crate::controller::access::{check_capability, validate_capabilities, AccessCheck};
use crate::controller::cache::VolumeCache;
use crate::controller::listing::{paginate, parse_starting_token};
use crate::domain::csi::*;
use crate::domain::ports::{
    ArrayGatewayRef, NewVolume, ProvisioningType, SnapshotDef, StoragePool, SystemInfo, Volume,
};
use crate::error::{ArrayErrorKind, Error, Result};
use crate::retry::{Attempt, RequestContext, RetryPolicy};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Create parameter naming the storage pool (name or ID)
pub const KEY_STORAGE_POOL: &str = "storagepool";
/// Create parameter selecting thick provisioning
pub const KEY_THICK_PROVISIONING: &str = "thickprovisioning";
/// Snapshot parameter with extra comma-separated volume IDs
pub const KEY_VOLUME_ID_LIST: &str = "VolumeIDList";

/// Longest volume name the array accepts
pub const MAX_VOLUME_NAME_LEN: usize = 31;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SHORT_SNAPSHOT_PREFIX: &str = "sn";

// Volume context keys
const CTX_NAME: &str = "Name";
const CTX_POOL_ID: &str = "StoragePoolID";
const CTX_POOL_NAME: &str = "StoragePoolName";
const CTX_CREATION_TIME: &str = "CreationTime";

// =============================================================================
// Configuration
// =============================================================================

/// Controller behaviour switches
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Provisioning used when a request does not say
    pub default_thick_provisioning: bool,
    /// Delete every member of a snapshot's consistency group
    pub enable_snapshot_cg_delete: bool,
    /// Probe the array on first use instead of failing
    pub auto_probe: bool,
    /// ListVolumes also returns snapshots, after the volumes
    pub list_volumes_snapshots: bool,
    /// Waiting for a created volume to become readable
    pub visibility_poll: RetryPolicy,
    /// Waiting for an in-progress removal to finish
    pub removal_poll: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_thick_provisioning: false,
            enable_snapshot_cg_delete: false,
            auto_probe: true,
            list_volumes_snapshots: false,
            visibility_poll: RetryPolicy::new(100, Duration::from_millis(3)),
            removal_poll: RetryPolicy::new(100, Duration::from_millis(3)),
        }
    }
}

// =============================================================================
// Error Helpers
// =============================================================================

/// Backend failure as reported to the orchestrator; context errors pass through
fn backend_error(what: &str, err: Error) -> Error {
    match err {
        Error::Cancelled(_) | Error::DeadlineExceeded(_) => err,
        other => Error::Internal(format!("{}: {}", what, other)),
    }
}

fn probe_error(what: &str, err: Error) -> Error {
    match err {
        Error::Cancelled(_) | Error::DeadlineExceeded(_) => err,
        other => Error::FailedPrecondition(format!("{}: {}", what, other)),
    }
}

/// Clamp a name to the array limit
fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_VOLUME_NAME_LEN {
        return name.to_string();
    }
    let short: String = name.chars().take(MAX_VOLUME_NAME_LEN).collect();
    warn!("Name {} truncated to {}", name, short);
    short
}

/// Snapshot names lose their long prefix before truncation
fn snapshot_name(name: &str) -> String {
    if name.chars().count() <= MAX_VOLUME_NAME_LEN {
        return name.to_string();
    }
    match name.strip_prefix(SNAPSHOT_PREFIX) {
        Some(rest) => truncate_name(&format!("{}{}", SHORT_SNAPSHOT_PREFIX, rest)),
        None => truncate_name(name),
    }
}

/// Extra IDs from `VolumeIDList`, trimmed, deduplicated, without the source
fn parse_volume_id_list(list: Option<&String>, source_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    list.map(|l| l.as_str())
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != source_id)
        .filter(|id| seen.insert(id.to_string()))
        .map(String::from)
        .collect()
}

// =============================================================================
// Controller Service
// =============================================================================

/// Controller side of the plugin
pub struct ControllerService {
    config: ControllerConfig,
    array: ArrayGatewayRef,
    /// Listing cache for paged list calls
    cache: VolumeCache,
    /// Host GUID -> array host ID
    host_ids: RwLock<HashMap<String, String>>,
    /// Pool name -> pool ID
    pool_ids: DashMap<String, String>,
    /// Pool ID -> pool name
    pool_names: DashMap<String, String>,
    /// Set once the array session is established
    session: tokio::sync::RwLock<Option<SystemInfo>>,
}

impl ControllerService {
    pub fn new(config: ControllerConfig, array: ArrayGatewayRef) -> Self {
        Self {
            config,
            array,
            cache: VolumeCache::new(),
            host_ids: RwLock::new(HashMap::new()),
            pool_ids: DashMap::new(),
            pool_names: DashMap::new(),
            session: tokio::sync::RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // =========================================================================
    // Probe
    // =========================================================================

    /// Authenticate and resolve the target system
    pub async fn probe(&self, ctx: &RequestContext) -> Result<SystemInfo> {
        ctx.call("array login", self.array.authenticate())
            .await
            .map_err(|e| probe_error("unable to login to array", e))?;
        let system = ctx
            .call("array system", self.array.system())
            .await
            .map_err(|e| probe_error("unable to resolve array system", e))?;

        info!("Controller probed array system {} ({})", system.name, system.id);
        *self.session.write().await = Some(system.clone());
        Ok(system)
    }

    pub async fn is_probed(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn ensure_probed(&self, ctx: &RequestContext) -> Result<()> {
        if self.is_probed().await {
            return Ok(());
        }
        if !self.config.auto_probe {
            return Err(Error::FailedPrecondition(
                "Controller Service has not been probed".into(),
            ));
        }
        debug!("Auto-probing array on first use");
        self.probe(ctx).await.map(|_| ())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Fetch a volume; absent or malformed IDs yield `None`
    async fn find_volume(&self, ctx: &RequestContext, id: &str) -> Result<Option<Volume>> {
        match ctx.call("get volume", self.array.volume(id)).await {
            Ok(vol) => Ok(Some(vol)),
            Err(e) if e.is_array_not_found() => Ok(None),
            Err(e) => Err(backend_error(&format!("failure checking volume {}", id), e)),
        }
    }

    async fn require_volume(&self, ctx: &RequestContext, id: &str) -> Result<Volume> {
        self.find_volume(ctx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume not found: {}", id)))
    }

    fn remember_pool(&self, pool: &StoragePool) {
        self.pool_ids.insert(pool.name.clone(), pool.id.clone());
        self.pool_names.insert(pool.id.clone(), pool.name.clone());
    }

    /// Resolve a pool given by name or ID to its ID
    async fn resolve_pool(&self, ctx: &RequestContext, pool: &str) -> Result<String> {
        if let Some(id) = self.pool_ids.get(pool) {
            return Ok(id.value().clone());
        }
        if self.pool_names.contains_key(pool) {
            return Ok(pool.to_string());
        }

        match ctx
            .call("storage pool by name", self.array.storage_pool_by_name(pool))
            .await
        {
            Ok(found) => {
                self.remember_pool(&found);
                return Ok(found.id);
            }
            Err(e) if e.is_array_not_found() => {}
            Err(e) => return Err(backend_error("storage pool lookup failed", e)),
        }

        match ctx
            .call("storage pool by id", self.array.storage_pool_by_id(pool))
            .await
        {
            Ok(found) => {
                self.remember_pool(&found);
                Ok(found.id)
            }
            Err(e) if e.is_array_not_found() => Err(Error::InvalidArgument(format!(
                "storage pool {} not found",
                pool
            ))),
            Err(e) => Err(backend_error("storage pool lookup failed", e)),
        }
    }

    /// Map a node ID (host GUID) to the array's host ID
    async fn host_id_for(&self, ctx: &RequestContext, node_id: &str) -> Result<String> {
        let cached = self.host_ids.read().get(node_id).cloned();
        if let Some(id) = cached {
            return Ok(id);
        }

        let host = ctx
            .call("host by guid", self.array.host_by_guid(node_id))
            .await
            .map_err(|e| {
                if e.is_array_not_found() {
                    Error::NotFound(format!("host not found for node id {}", node_id))
                } else {
                    backend_error("host lookup failed", e)
                }
            })?;

        debug!("Resolved node {} to host {}", node_id, host.id);
        self.host_ids
            .write()
            .insert(node_id.to_string(), host.id.clone());
        Ok(host.id)
    }

    /// Poll until a just-created volume is readable
    async fn wait_for_volume(&self, ctx: &RequestContext, id: &str) -> Result<Volume> {
        let array = &self.array;
        let found = self
            .config
            .visibility_poll
            .poll(ctx, "volume visibility", |_| async move {
                match ctx.call("get volume", array.volume(id)).await {
                    Ok(vol) => Ok(Attempt::Done(vol)),
                    Err(e) if e.is_array_not_found() => Ok(Attempt::Retry),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| backend_error(&format!("failure reading volume {}", id), e))?;

        found.ok_or_else(|| {
            Error::Internal(format!("volume {} not visible after creation", id))
        })
    }

    /// Remove a volume, riding out "removal in progress" answers
    async fn remove_with_poll(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let array = &self.array;
        let outcome = self
            .config
            .removal_poll
            .poll(ctx, "volume removal", |_| async move {
                match ctx.call("remove volume", array.remove_volume(id)).await {
                    Ok(()) => Ok(Attempt::Done(())),
                    Err(e) if e.is_array_not_found() => Ok(Attempt::Done(())),
                    Err(e) if e.array_kind() == Some(ArrayErrorKind::RemovalInProgress) => {
                        Ok(Attempt::Retry)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| backend_error(&format!("error removing volume {}", id), e))?;

        if outcome.is_none() {
            warn!("Removal of volume {} still in progress after polling", id);
        }
        Ok(())
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    fn csi_volume(&self, vol: &Volume) -> CsiVolume {
        let mut volume_context = BTreeMap::new();
        volume_context.insert(CTX_NAME.to_string(), vol.name.clone());
        volume_context.insert(CTX_POOL_ID.to_string(), vol.storage_pool_id.clone());
        if let Some(name) = self.pool_names.get(&vol.storage_pool_id) {
            volume_context.insert(CTX_POOL_NAME.to_string(), name.value().clone());
        }
        if let Some(created) = vol.creation_time {
            volume_context.insert(CTX_CREATION_TIME.to_string(), created.to_rfc3339());
        }

        CsiVolume {
            volume_id: vol.id.clone(),
            capacity_bytes: vol.size_bytes(),
            volume_context,
            content_source: None,
            accessible_topology: Vec::new(),
        }
    }

    fn csi_snapshot(vol: &Volume) -> CsiSnapshot {
        CsiSnapshot {
            snapshot_id: vol.id.clone(),
            source_volume_id: vol.ancestor_volume_id.clone().unwrap_or_default(),
            size_bytes: vol.size_bytes(),
            creation_time: vol.creation_time,
            ready_to_use: true,
        }
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(name = %req.name))]
    pub async fn create_volume(
        &self,
        ctx: &RequestContext,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse> {
        self.ensure_probed(ctx).await?;

        if req.accessibility_requirements.is_some() {
            return Err(Error::InvalidArgument(
                "Volume AccessibilityRequirements is not supported".into(),
            ));
        }
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("Name cannot be empty".into()));
        }

        let (min, max) = req
            .capacity_range
            .as_ref()
            .map(|r| (r.required_bytes, r.limit_bytes))
            .unwrap_or((0, 0));
        let size_kb = validate_vol_size(min, max)?;

        let pool = req
            .parameters
            .get(KEY_STORAGE_POOL)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("`{}` is a required parameter", KEY_STORAGE_POOL))
            })?;
        let pool_id = self.resolve_pool(ctx, pool).await?;
        let name = truncate_name(&req.name);

        match &req.volume_content_source {
            Some(VolumeContentSource::Volume { .. }) => {
                return Err(Error::InvalidArgument(
                    "Volume as a VolumeContentSource is not supported (i.e. clone)".into(),
                ));
            }
            Some(VolumeContentSource::Snapshot { snapshot_id }) => {
                return self
                    .create_volume_from_snapshot(ctx, snapshot_id, &name, size_kb, &pool_id)
                    .await;
            }
            None => {}
        }

        let mut thick = self.config.default_thick_provisioning;
        if let Some(value) = req.parameters.get(KEY_THICK_PROVISIONING) {
            match value.parse::<bool>() {
                Ok(v) => thick = v,
                Err(_) => warn!(
                    "Invalid boolean `{}`={} in parameters, using default",
                    KEY_THICK_PROVISIONING, value
                ),
            }
        }

        let spec = NewVolume {
            name: name.clone(),
            size_kb,
            storage_pool_id: pool_id.clone(),
            provisioning: if thick {
                ProvisioningType::Thick
            } else {
                ProvisioningType::Thin
            },
        };

        info!(
            "Creating volume {} ({} KiB, {}) in pool {}",
            name, size_kb, spec.provisioning, pool
        );

        let id = match ctx.call("create volume", self.array.create_volume(&spec)).await {
            Ok(id) => id,
            Err(e) if e.array_kind() == Some(ArrayErrorKind::NameInUse) => {
                debug!("Volume name {} already in use, looking it up", name);
                ctx.call("volume by name", self.array.volume_id_by_name(&name))
                    .await
                    .map_err(|e| backend_error("error looking up existing volume", e))?
            }
            Err(e) => return Err(backend_error("error when creating volume", e)),
        };

        self.cache.clear();
        let vol = self.wait_for_volume(ctx, &id).await?;

        if vol.storage_pool_id != pool_id {
            return Err(Error::AlreadyExists(format!(
                "volume '{}' already exists in storage pool {}",
                name, vol.storage_pool_id
            )));
        }
        if vol.size_kb != size_kb {
            return Err(Error::AlreadyExists(format!(
                "volume '{}' already exists with size {} KiB, requested {} KiB",
                name, vol.size_kb, size_kb
            )));
        }

        info!("Created volume {} with id {}", name, vol.id);
        Ok(CreateVolumeResponse {
            volume: self.csi_volume(&vol),
        })
    }

    async fn create_volume_from_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        name: &str,
        size_kb: u64,
        pool_id: &str,
    ) -> Result<CreateVolumeResponse> {
        let snap = self
            .find_volume(ctx, snapshot_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Snapshot not found: {}", snapshot_id)))?;

        if snap.size_kb != size_kb {
            return Err(Error::InvalidArgument(format!(
                "Snapshot {} has incompatible size {} KiB versus requested {} KiB",
                snapshot_id, snap.size_kb, size_kb
            )));
        }
        if snap.storage_pool_id != pool_id {
            return Err(Error::InvalidArgument(format!(
                "Snapshot storage pool {} is different than the requested storage pool {}",
                snap.storage_pool_id, pool_id
            )));
        }

        let content_source = Some(VolumeContentSource::Snapshot {
            snapshot_id: snapshot_id.to_string(),
        });

        let existing = ctx
            .call("volumes by ancestor", self.array.volumes_by_ancestor(snapshot_id))
            .await
            .map_err(|e| backend_error("failure listing snapshot descendants", e))?;
        if let Some(vol) = existing.into_iter().find(|v| v.name == name) {
            debug!("Volume {} from snapshot {} already exists", name, snapshot_id);
            let mut volume = self.csi_volume(&vol);
            volume.content_source = content_source;
            return Ok(CreateVolumeResponse { volume });
        }

        let defs = [SnapshotDef {
            volume_id: snapshot_id.to_string(),
            snapshot_name: name.to_string(),
        }];
        let group = ctx
            .call("snapshot volumes", self.array.snapshot_volumes(&defs))
            .await
            .map_err(|e| backend_error("failed to create volume from snapshot", e))?;
        self.cache.clear();

        let id = group
            .volume_ids
            .first()
            .cloned()
            .ok_or_else(|| Error::Internal("array returned no volume for snapshot".into()))?;
        let vol = self.wait_for_volume(ctx, &id).await?;

        info!("Created volume {} ({}) from snapshot {}", name, vol.id, snapshot_id);
        let mut volume = self.csi_volume(&vol);
        volume.content_source = content_source;
        Ok(CreateVolumeResponse { volume })
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id))]
    pub async fn delete_volume(
        &self,
        ctx: &RequestContext,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse> {
        self.ensure_probed(ctx).await?;

        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }

        let Some(vol) = self.find_volume(ctx, &req.volume_id).await? else {
            debug!("Volume {} already deleted", req.volume_id);
            return Ok(DeleteVolumeResponse {});
        };

        if vol.is_mapped() {
            return Err(Error::FailedPrecondition(format!(
                "volume in use by {} host(s)",
                vol.mappings.len()
            )));
        }

        let removed = self.remove_with_poll(ctx, &vol.id).await;
        self.cache.clear();
        removed?;

        info!("Deleted volume {}", vol.id);
        Ok(DeleteVolumeResponse {})
    }

    // =========================================================================
    // ControllerPublishVolume / ControllerUnpublishVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    pub async fn controller_publish_volume(
        &self,
        ctx: &RequestContext,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        self.ensure_probed(ctx).await?;

        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }
        if req.node_id.is_empty() {
            return Err(Error::InvalidArgument("node ID is required".into()));
        }
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability is required".into()))?;
        let mode = cap
            .access_mode
            .ok_or_else(|| Error::InvalidArgument("access mode is required".into()))?;
        if mode == AccessMode::Unknown {
            return Err(Error::InvalidArgument("access mode cannot be UNKNOWN".into()));
        }

        let host_id = self.host_id_for(ctx, &req.node_id).await?;
        let vol = self.require_volume(ctx, &req.volume_id).await?;

        if vol.is_mapped_to(&host_id) {
            debug!("Volume {} already mapped to host {}", vol.id, host_id);
            return Ok(ControllerPublishVolumeResponse::default());
        }
        if vol.is_mapped() && mode.is_single_node() {
            let other = vol
                .mappings
                .first()
                .map(|m| m.host_id.as_str())
                .unwrap_or_default();
            return Err(Error::FailedPrecondition(format!(
                "volume already published to host {}",
                other
            )));
        }

        let allow_multiple = match check_capability(cap) {
            AccessCheck::Allowed {
                allow_multiple_mappings,
            } => allow_multiple_mappings,
            AccessCheck::Rejected(reason) => return Err(Error::InvalidArgument(reason)),
        };

        ctx.call(
            "map volume",
            self.array.map_volume(&vol.id, &host_id, allow_multiple),
        )
        .await
        .map_err(|e| backend_error(&format!("error mapping volume to node {}", req.node_id), e))?;

        info!("Published volume {} to host {}", vol.id, host_id);
        Ok(ControllerPublishVolumeResponse::default())
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    pub async fn controller_unpublish_volume(
        &self,
        ctx: &RequestContext,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse> {
        self.ensure_probed(ctx).await?;

        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }
        if req.node_id.is_empty() {
            return Err(Error::InvalidArgument("node ID is required".into()));
        }

        let host_id = self.host_id_for(ctx, &req.node_id).await?;
        let Some(vol) = self.find_volume(ctx, &req.volume_id).await? else {
            debug!("Volume {} not found, nothing to unpublish", req.volume_id);
            return Ok(ControllerUnpublishVolumeResponse {});
        };
        if !vol.is_mapped_to(&host_id) {
            debug!("Volume {} not mapped to host {}", vol.id, host_id);
            return Ok(ControllerUnpublishVolumeResponse {});
        }

        ctx.call("unmap volume", self.array.unmap_volume(&vol.id, &host_id))
            .await
            .map_err(|e| {
                backend_error(&format!("error unmapping volume from node {}", req.node_id), e)
            })?;

        info!("Unpublished volume {} from host {}", vol.id, host_id);
        Ok(ControllerUnpublishVolumeResponse {})
    }

    // =========================================================================
    // ValidateVolumeCapabilities
    // =========================================================================

    pub async fn validate_volume_capabilities(
        &self,
        ctx: &RequestContext,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        self.ensure_probed(ctx).await?;

        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID is required".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument("volume capabilities are required".into()));
        }
        self.require_volume(ctx, &req.volume_id).await?;

        Ok(match validate_capabilities(&req.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            },
            Err(reason) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: reason,
            },
        })
    }

    // =========================================================================
    // ListVolumes / ListSnapshots
    // =========================================================================

    /// Volumes and/or snapshots for an unfiltered listing, volumes first
    ///
    /// Later pages are served from the cache when the requested slots are
    /// warm; the first page always refreshes it.
    async fn list_array_volumes(
        &self,
        ctx: &RequestContext,
        start: usize,
        want_volumes: bool,
        want_snapshots: bool,
    ) -> Result<Vec<Volume>> {
        let warm = (!want_volumes || self.cache.volumes_warm())
            && (!want_snapshots || self.cache.snapshots_warm());

        if start != 0 && warm {
            debug!("Serving listing from cache at offset {}", start);
            let mut out = Vec::new();
            if want_volumes {
                out.extend(self.cache.volumes());
            }
            if want_snapshots {
                out.extend(self.cache.snapshots());
            }
            return Ok(out);
        }

        let all = ctx
            .call("list volumes", self.array.volumes())
            .await
            .map_err(|e| backend_error("unable to list volumes", e))?;
        self.cache.populate(&all);

        let (snapshots, volumes): (Vec<Volume>, Vec<Volume>) =
            all.into_iter().partition(Volume::is_snapshot);
        let mut out = Vec::new();
        if want_volumes {
            out.extend(volumes);
        }
        if want_snapshots {
            out.extend(snapshots);
        }
        Ok(out)
    }

    pub async fn list_volumes(
        &self,
        ctx: &RequestContext,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse> {
        self.ensure_probed(ctx).await?;

        let start = parse_starting_token(&req.starting_token)?;
        let volumes = self
            .list_array_volumes(ctx, start, true, self.config.list_volumes_snapshots)
            .await?;
        let (page, next_token) = paginate(&volumes, start, req.max_entries)?;

        Ok(ListVolumesResponse {
            entries: page.iter().map(|v| self.csi_volume(v)).collect(),
            next_token,
        })
    }

    pub async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse> {
        self.ensure_probed(ctx).await?;

        if !req.snapshot_id.is_empty() {
            let entries = self
                .find_volume(ctx, &req.snapshot_id)
                .await?
                .filter(Volume::is_snapshot)
                .filter(|s| {
                    req.source_volume_id.is_empty()
                        || s.ancestor_volume_id.as_deref() == Some(req.source_volume_id.as_str())
                })
                .map(|s| vec![Self::csi_snapshot(&s)])
                .unwrap_or_default();
            return Ok(ListSnapshotsResponse {
                entries,
                next_token: String::new(),
            });
        }

        if !req.source_volume_id.is_empty() {
            let snaps = ctx
                .call(
                    "volumes by ancestor",
                    self.array.volumes_by_ancestor(&req.source_volume_id),
                )
                .await
                .map_err(|e| backend_error("unable to list snapshots", e))?;
            return Ok(ListSnapshotsResponse {
                entries: snaps.iter().map(Self::csi_snapshot).collect(),
                next_token: String::new(),
            });
        }

        let start = parse_starting_token(&req.starting_token)?;
        let snapshots = self.list_array_volumes(ctx, start, false, true).await?;
        let (page, next_token) = paginate(&snapshots, start, req.max_entries)?;

        Ok(ListSnapshotsResponse {
            entries: page.iter().map(Self::csi_snapshot).collect(),
            next_token,
        })
    }

    // =========================================================================
    // CreateSnapshot / DeleteSnapshot
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(source = %req.source_volume_id, name = %req.name))]
    pub async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        self.ensure_probed(ctx).await?;

        if req.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "CreateSnapshot volume ID to be snapped is required".into(),
            ));
        }
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name cannot be empty".into()));
        }
        let name = snapshot_name(&req.name);
        let source = self.require_volume(ctx, &req.source_volume_id).await?;

        if let Some(existing) = self.snapshot_by_name(ctx, &name, &source.id).await? {
            return Ok(CreateSnapshotResponse {
                snapshot: Self::csi_snapshot(&existing),
            });
        }

        let extra_ids = parse_volume_id_list(req.parameters.get(KEY_VOLUME_ID_LIST), &source.id);
        let extras = futures::future::try_join_all(
            extra_ids.iter().map(|id| self.require_volume(ctx, id)),
        )
        .await?;

        let mut defs = Vec::with_capacity(extras.len() + 1);
        defs.push(SnapshotDef {
            volume_id: source.id.clone(),
            snapshot_name: name.clone(),
        });
        defs.extend(extras.into_iter().map(|vol| SnapshotDef {
            volume_id: vol.id,
            snapshot_name: String::new(),
        }));

        let group = match ctx
            .call("snapshot volumes", self.array.snapshot_volumes(&defs))
            .await
        {
            Ok(group) => group,
            // Lost a race with a concurrent request for the same name
            Err(e) if e.array_kind() == Some(ArrayErrorKind::NameInUse) => {
                return match self.snapshot_by_name(ctx, &name, &source.id).await? {
                    Some(existing) => Ok(CreateSnapshotResponse {
                        snapshot: Self::csi_snapshot(&existing),
                    }),
                    None => Err(backend_error("failed to create snapshot", e)),
                };
            }
            Err(e) => return Err(backend_error("failed to create snapshot", e)),
        };
        self.cache.clear();

        let snap_id = group
            .volume_ids
            .first()
            .cloned()
            .ok_or_else(|| Error::Internal("array returned no snapshot".into()))?;
        let snap = self.wait_for_volume(ctx, &snap_id).await?;

        info!(
            "Created snapshot {} ({}) of {} in group {} with {} member(s)",
            name,
            snap.id,
            source.id,
            group.group_id,
            defs.len()
        );
        Ok(CreateSnapshotResponse {
            snapshot: Self::csi_snapshot(&snap),
        })
    }

    /// A snapshot already carrying `name`; it must come from `source_id`
    async fn snapshot_by_name(
        &self,
        ctx: &RequestContext,
        name: &str,
        source_id: &str,
    ) -> Result<Option<Volume>> {
        let existing_id = match ctx
            .call("volume by name", self.array.volume_id_by_name(name))
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_array_not_found() => return Ok(None),
            Err(e) => return Err(backend_error("error looking up snapshot name", e)),
        };

        // The name is taken, so the volume exists even if reads still lag
        let existing = self.wait_for_volume(ctx, &existing_id).await?;
        if existing.ancestor_volume_id.as_deref() != Some(source_id) {
            return Err(Error::AlreadyExists(format!(
                "snapshot with name '{}' exists, but SourceVolumeId {} doesn't match",
                name, source_id
            )));
        }
        debug!("Snapshot {} already exists as {}", name, existing.id);
        Ok(Some(existing))
    }

    #[instrument(skip(self, ctx, req), fields(snapshot_id = %req.snapshot_id))]
    pub async fn delete_snapshot(
        &self,
        ctx: &RequestContext,
        req: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse> {
        self.ensure_probed(ctx).await?;

        if req.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument("snapshot ID is required".into()));
        }

        let Some(snap) = self.find_volume(ctx, &req.snapshot_id).await? else {
            debug!("Snapshot {} already deleted", req.snapshot_id);
            return Ok(DeleteSnapshotResponse {});
        };
        if snap.is_mapped() {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {} is in use by {} host(s)",
                snap.id,
                snap.mappings.len()
            )));
        }

        let group = snap
            .consistency_group_id
            .as_deref()
            .filter(|cg| !cg.is_empty());
        let removed = match group {
            Some(cg) if self.config.enable_snapshot_cg_delete => {
                self.delete_consistency_group(ctx, &snap, cg).await
            }
            _ => self.remove_with_poll(ctx, &snap.id).await,
        };
        self.cache.clear();
        removed?;

        info!("Deleted snapshot {}", snap.id);
        Ok(DeleteSnapshotResponse {})
    }

    /// Remove every member of a consistency group, or none if any is mapped
    async fn delete_consistency_group(
        &self,
        ctx: &RequestContext,
        snap: &Volume,
        group_id: &str,
    ) -> Result<()> {
        let all = ctx
            .call("list volumes", self.array.volumes())
            .await
            .map_err(|e| backend_error("unable to list consistency group", e))?;
        let mut members: Vec<Volume> = all
            .into_iter()
            .filter(|v| v.consistency_group_id.as_deref() == Some(group_id))
            .collect();
        if !members.iter().any(|m| m.id == snap.id) {
            members.push(snap.clone());
        }

        if let Some(busy) = members.iter().find(|m| m.is_mapped()) {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {} in consistency group {} is in use",
                busy.id, group_id
            )));
        }

        info!(
            "Deleting {} member(s) of consistency group {}",
            members.len(),
            group_id
        );
        for member in &members {
            self.remove_with_poll(ctx, &member.id).await?;
        }
        Ok(())
    }

    // =========================================================================
    // GetCapacity / Capabilities
    // =========================================================================

    pub async fn get_capacity(
        &self,
        ctx: &RequestContext,
        req: GetCapacityRequest,
    ) -> Result<GetCapacityResponse> {
        self.ensure_probed(ctx).await?;

        let pool = req
            .parameters
            .get(KEY_STORAGE_POOL)
            .filter(|p| !p.is_empty());
        let stats = match pool {
            Some(pool) => {
                let pool_id = self.resolve_pool(ctx, pool).await?;
                ctx.call("pool capacity", self.array.pool_capacity(&pool_id))
                    .await
            }
            None => {
                ctx.call("system capacity", self.array.system_capacity())
                    .await
            }
        }
        .map_err(|e| backend_error("unable to get capacity", e))?;

        Ok(GetCapacityResponse {
            available_capacity: i64::try_from(stats.available_for_allocation_kb)
                .unwrap_or(i64::MAX)
                .saturating_mul(1024),
        })
    }

    pub fn controller_get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::ListVolumes,
                ControllerCapability::GetCapacity,
                ControllerCapability::CreateDeleteSnapshot,
                ControllerCapability::ListSnapshots,
            ],
        }
    }

    pub async fn controller_expand_volume(
        &self,
        _ctx: &RequestContext,
        _req: ControllerExpandVolumeRequest,
    ) -> Result<()> {
        Err(Error::Unimplemented("ControllerExpandVolume".into()))
    }
}
