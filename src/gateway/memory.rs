//! Simulated Array
//!
//! An in-memory implementation of the array gateway. It reproduces the
//! behaviours the controller has to cope with: array-assigned hexadecimal
//! IDs, name collisions, reads that lag behind creation, and removals that
//! report "in progress" for a while.

use crate::domain::ports::{
    ArrayGateway, CapacityStats, Host, HostMapping, NewVolume, SnapshotDef, SnapshotGroup,
    StoragePool, SystemInfo, Volume,
};
use crate::error::{ArrayErrorKind, Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated array
#[derive(Debug, Clone)]
pub struct SimulatedArrayConfig {
    pub system_id: String,
    pub system_name: String,
    /// Capacity reported for each pool, in KiB
    pub pool_capacity_kb: u64,
}

impl Default for SimulatedArrayConfig {
    fn default() -> Self {
        Self {
            system_id: "7f5d8fc72a3d7f0f".to_string(),
            system_name: "sim-system".to_string(),
            pool_capacity_kb: 1024 * 1024 * 1024,
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct ArrayState {
    /// Keyed by ID; IDs increase monotonically so order is creation order
    volumes: BTreeMap<String, Volume>,
    pools: Vec<StoragePool>,
    hosts: Vec<Host>,
    /// Reads of a volume that still answer "not found"
    hidden_reads: HashMap<String, u32>,
    /// Remove calls that still answer "removal in progress"
    pending_removals: HashMap<String, u32>,
    /// Volumes whose removal fails outright
    failing_removals: HashSet<String>,
    /// Lag applied to volumes created from now on
    read_lag: u32,
    removal_lag: u32,
    create_calls: u32,
    map_calls: u32,
    unmap_calls: u32,
    remove_calls: u32,
    snapshot_calls: u32,
    authenticated: bool,
    fail_auth: bool,
}

// =============================================================================
// Simulated Array
// =============================================================================

/// In-memory stand-in for a block storage array
pub struct SimulatedArray {
    config: SimulatedArrayConfig,
    state: Mutex<ArrayState>,
    next_id: AtomicU64,
}

impl SimulatedArray {
    pub fn new(config: SimulatedArrayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ArrayState::default()),
            next_id: AtomicU64::new(0x3a5b_0000_0000_0001),
        }
    }

    fn generate_id(&self) -> String {
        format!("{:016x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a storage pool and return its ID
    pub fn add_pool(&self, name: &str) -> String {
        let id = self.generate_id();
        self.state.lock().pools.push(StoragePool {
            id: id.clone(),
            name: name.to_string(),
            protection_domain_id: "pd1".to_string(),
        });
        id
    }

    /// Register a host agent and return its host ID
    pub fn add_host(&self, guid: &str, ip: &str) -> String {
        let id = self.generate_id();
        self.state.lock().hosts.push(Host {
            id: id.clone(),
            guid: guid.to_string(),
            ip: ip.to_string(),
        });
        id
    }

    /// Make newly created volumes invisible for `reads` lookups
    pub fn set_read_lag(&self, reads: u32) {
        self.state.lock().read_lag = reads;
    }

    /// Make removals report "in progress" for `calls` attempts
    pub fn set_removal_lag(&self, calls: u32) {
        self.state.lock().removal_lag = calls;
    }

    /// Make every removal of `id` fail with a backend error
    pub fn fail_removal_of(&self, id: &str) {
        self.state.lock().failing_removals.insert(id.to_string());
    }

    pub fn set_fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().volumes.contains_key(id)
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    pub fn map_calls(&self) -> u32 {
        self.state.lock().map_calls
    }

    pub fn unmap_calls(&self) -> u32 {
        self.state.lock().unmap_calls
    }

    pub fn remove_calls(&self) -> u32 {
        self.state.lock().remove_calls
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.state.lock().snapshot_calls
    }

    /// Attach a volume behind the controller's back
    pub fn force_map(&self, volume_id: &str, host_id: &str) {
        let mut state = self.state.lock();
        if let Some(vol) = state.volumes.get_mut(volume_id) {
            vol.mappings.push(HostMapping {
                host_id: host_id.to_string(),
                host_ip: "0.0.0.0".to_string(),
            });
        }
    }

    fn insert_volume(&self, state: &mut ArrayState, vol: Volume) {
        if state.read_lag > 0 {
            state.hidden_reads.insert(vol.id.clone(), state.read_lag);
        }
        state.volumes.insert(vol.id.clone(), vol);
    }

    fn check_session(state: &ArrayState) -> Result<()> {
        if state.authenticated {
            Ok(())
        } else {
            Err(Error::array(
                ArrayErrorKind::Unauthorized,
                "no session, login required",
            ))
        }
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::array(
            ArrayErrorKind::MalformedId,
            format!("id {} must be a hexadecimal number", id),
        ));
    }
    Ok(())
}

fn not_found(id: &str) -> Error {
    Error::array(
        ArrayErrorKind::NotFound,
        format!("Could not find the volume {}", id),
    )
}

#[async_trait]
impl ArrayGateway for SimulatedArray {
    async fn authenticate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_auth {
            return Err(Error::array(
                ArrayErrorKind::Unauthorized,
                "invalid credentials",
            ));
        }
        state.authenticated = true;
        Ok(())
    }

    async fn system(&self) -> Result<SystemInfo> {
        Self::check_session(&self.state.lock())?;
        Ok(SystemInfo {
            id: self.config.system_id.clone(),
            name: self.config.system_name.clone(),
        })
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<String> {
        let id = self.generate_id();
        let mut state = self.state.lock();
        Self::check_session(&state)?;
        state.create_calls += 1;

        if state.volumes.values().any(|v| v.name == spec.name) {
            return Err(Error::array(
                ArrayErrorKind::NameInUse,
                "Volume name already in use. Please use a different name.",
            ));
        }
        if !state.pools.iter().any(|p| p.id == spec.storage_pool_id) {
            return Err(Error::array(
                ArrayErrorKind::NotFound,
                format!("Could not find the storage pool {}", spec.storage_pool_id),
            ));
        }

        let vol = Volume {
            id: id.clone(),
            name: spec.name.clone(),
            size_kb: spec.size_kb,
            storage_pool_id: spec.storage_pool_id.clone(),
            ancestor_volume_id: None,
            consistency_group_id: None,
            mappings: Vec::new(),
            provisioning: spec.provisioning,
            creation_time: Some(Utc::now()),
        };
        self.insert_volume(&mut state, vol);
        debug!(volume_id = %id, name = %spec.name, "simulated volume created");
        Ok(id)
    }

    async fn volume(&self, id: &str) -> Result<Volume> {
        check_id(id)?;
        let mut state = self.state.lock();
        Self::check_session(&state)?;
        if let Some(left) = state.hidden_reads.get_mut(id) {
            *left -= 1;
            if *left == 0 {
                state.hidden_reads.remove(id);
            }
            return Err(not_found(id));
        }
        state.volumes.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn volume_id_by_name(&self, name: &str) -> Result<String> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        state
            .volumes
            .values()
            .find(|v| v.name == name)
            .map(|v| v.id.clone())
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the volume named {}", name),
                )
            })
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        Ok(state.volumes.values().cloned().collect())
    }

    async fn volumes_by_ancestor(&self, ancestor_id: &str) -> Result<Vec<Volume>> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        Ok(state
            .volumes
            .values()
            .filter(|v| v.ancestor_volume_id.as_deref() == Some(ancestor_id))
            .cloned()
            .collect())
    }

    async fn remove_volume(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let mut state = self.state.lock();
        Self::check_session(&state)?;
        state.remove_calls += 1;

        let Some(vol) = state.volumes.get(id) else {
            return Err(not_found(id));
        };
        if vol.is_mapped() {
            return Err(Error::array(
                ArrayErrorKind::Other,
                "Only a volume that is not mapped to any SDC can be removed",
            ));
        }
        if state.failing_removals.contains(id) {
            return Err(Error::array(
                ArrayErrorKind::Other,
                format!("Failed to remove volume {}: internal array error", id),
            ));
        }

        let lag = state.removal_lag;
        let left = state.pending_removals.entry(id.to_string()).or_insert(lag);
        if *left > 0 {
            *left -= 1;
            return Err(Error::array(
                ArrayErrorKind::RemovalInProgress,
                "Volume removal in progress",
            ));
        }
        state.pending_removals.remove(id);
        state.volumes.remove(id);
        Ok(())
    }

    async fn storage_pool_by_id(&self, id: &str) -> Result<StoragePool> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        state
            .pools
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the storage pool {}", id),
                )
            })
    }

    async fn storage_pool_by_name(&self, name: &str) -> Result<StoragePool> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        state
            .pools
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the storage pool named {}", name),
                )
            })
    }

    async fn host_by_guid(&self, guid: &str) -> Result<Host> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        state
            .hosts
            .iter()
            .find(|h| h.guid == guid)
            .cloned()
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the SDC with guid {}", guid),
                )
            })
    }

    async fn map_volume(&self, volume_id: &str, host_id: &str, allow_multiple: bool) -> Result<()> {
        check_id(volume_id)?;
        let mut state = self.state.lock();
        Self::check_session(&state)?;
        state.map_calls += 1;

        let host_ip = state
            .hosts
            .iter()
            .find(|h| h.id == host_id)
            .map(|h| h.ip.clone())
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the SDC {}", host_id),
                )
            })?;
        let vol = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;

        if vol.is_mapped_to(host_id) {
            return Err(Error::array(
                ArrayErrorKind::Other,
                "The volume is already mapped to this SDC",
            ));
        }
        if vol.is_mapped() && !allow_multiple {
            return Err(Error::array(
                ArrayErrorKind::Other,
                "The volume is already mapped to another SDC",
            ));
        }
        vol.mappings.push(HostMapping {
            host_id: host_id.to_string(),
            host_ip,
        });
        Ok(())
    }

    async fn unmap_volume(&self, volume_id: &str, host_id: &str) -> Result<()> {
        check_id(volume_id)?;
        let mut state = self.state.lock();
        Self::check_session(&state)?;
        state.unmap_calls += 1;

        let vol = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;
        let before = vol.mappings.len();
        vol.mappings.retain(|m| m.host_id != host_id);
        if vol.mappings.len() == before {
            return Err(Error::array(
                ArrayErrorKind::Other,
                "The volume is not mapped to this SDC",
            ));
        }
        Ok(())
    }

    async fn snapshot_volumes(&self, defs: &[SnapshotDef]) -> Result<SnapshotGroup> {
        let group_id = self.generate_id();
        let ids: Vec<String> = defs.iter().map(|_| self.generate_id()).collect();

        let mut state = self.state.lock();
        Self::check_session(&state)?;
        state.snapshot_calls += 1;

        let mut created = Vec::with_capacity(defs.len());
        for (def, id) in defs.iter().zip(&ids) {
            check_id(&def.volume_id)?;
            let src = state
                .volumes
                .get(&def.volume_id)
                .ok_or_else(|| not_found(&def.volume_id))?;
            let name = if def.snapshot_name.is_empty() {
                format!("snap-{}", id)
            } else {
                def.snapshot_name.clone()
            };
            if state.volumes.values().any(|v| v.name == name) {
                return Err(Error::array(
                    ArrayErrorKind::NameInUse,
                    "Volume name already in use. Please use a different name.",
                ));
            }
            created.push(Volume {
                id: id.clone(),
                name,
                size_kb: src.size_kb,
                storage_pool_id: src.storage_pool_id.clone(),
                ancestor_volume_id: Some(src.id.clone()),
                consistency_group_id: Some(group_id.clone()),
                mappings: Vec::new(),
                provisioning: src.provisioning,
                creation_time: Some(Utc::now()),
            });
        }
        for vol in created {
            self.insert_volume(&mut state, vol);
        }

        Ok(SnapshotGroup {
            group_id,
            volume_ids: ids,
        })
    }

    async fn pool_capacity(&self, pool_id: &str) -> Result<CapacityStats> {
        let state = self.state.lock();
        Self::check_session(&state)?;
        if !state.pools.iter().any(|p| p.id == pool_id) {
            return Err(Error::array(
                ArrayErrorKind::NotFound,
                format!("Could not find the storage pool {}", pool_id),
            ));
        }
        let used: u64 = state
            .volumes
            .values()
            .filter(|v| v.storage_pool_id == pool_id)
            .map(|v| v.size_kb)
            .sum();
        Ok(CapacityStats {
            total_kb: self.config.pool_capacity_kb,
            available_for_allocation_kb: self.config.pool_capacity_kb.saturating_sub(used),
        })
    }

    async fn system_capacity(&self) -> Result<CapacityStats> {
        let pool_ids: Vec<String> = {
            let state = self.state.lock();
            Self::check_session(&state)?;
            state.pools.iter().map(|p| p.id.clone()).collect()
        };
        let mut total = CapacityStats::default();
        for id in pool_ids {
            let stats = self.pool_capacity(&id).await?;
            total.total_kb = total.total_kb.saturating_add(stats.total_kb);
            total.available_for_allocation_kb = total
                .available_for_allocation_kb
                .saturating_add(stats.available_for_allocation_kb);
        }
        Ok(total)
    }
}
