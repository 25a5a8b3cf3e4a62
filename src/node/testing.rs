//! In-memory node host for tests
//!
//! Records mounts in a table instead of touching the kernel. Directories and
//! files for targets and private mount points are still created on disk by
//! the code under test, so tests point those at a temp dir.

use crate::domain::ports::{Device, LocalVolume, MountInfo, NodeHost};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct FakeState {
    guid: Option<String>,
    modules: Vec<String>,
    local: Vec<LocalVolume>,
    devices: HashMap<PathBuf, Device>,
    mounts: Vec<MountInfo>,
    formatted: HashSet<String>,
    hidden_scans: u32,
    scans: u32,
    format_calls: u32,
    removed_dirs: Vec<PathBuf>,
}

pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

fn rw_opts(opts: &[String]) -> Vec<String> {
    let ro = opts.iter().any(|o| o == "ro");
    let mut out = vec![if ro { "ro" } else { "rw" }.to_string()];
    out.extend(opts.iter().filter(|o| *o != "ro" && *o != "rw").cloned());
    out
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                guid: Some("3c4a5b6d-0000-1111-2222-333344445555".into()),
                modules: vec!["scini".into()],
                ..Default::default()
            }),
        }
    }

    pub fn set_guid(&self, guid: Option<&str>) {
        self.state.lock().guid = guid.map(String::from);
    }

    pub fn set_modules(&self, modules: &[&str]) {
        self.state.lock().modules = modules.iter().map(|m| m.to_string()).collect();
    }

    /// Make a volume visible as `/dev/<name>`
    pub fn attach(&self, volume_id: &str, name: &str) -> Device {
        let full_path = PathBuf::from(format!("/dev/disk/by-id/emc-vol-sys1-{}", volume_id));
        let device = Device {
            full_path: full_path.clone(),
            real_dev: PathBuf::from(format!("/dev/{}", name)),
            name: name.to_string(),
        };
        let mut state = self.state.lock();
        state.local.push(LocalVolume {
            volume_id: volume_id.to_string(),
            system_id: "sys1".into(),
            device_path: full_path.clone(),
        });
        state.devices.insert(full_path, device.clone());
        device
    }

    pub fn detach(&self, volume_id: &str) {
        self.state.lock().local.retain(|v| v.volume_id != volume_id);
    }

    /// Report no local volumes for the next `scans` scans
    pub fn hide_volumes_for(&self, scans: u32) {
        self.state.lock().hidden_scans = scans;
    }

    pub fn local_volume_scans(&self) -> u32 {
        self.state.lock().scans
    }

    /// Put an arbitrary entry in the mount table
    pub fn add_mount(&self, device: &str, path: &Path, opts: &[&str]) {
        self.state.lock().mounts.push(MountInfo {
            device: device.to_string(),
            path: path.to_path_buf(),
            source: String::new(),
            fs_type: "ext4".into(),
            opts: opts.iter().map(|o| o.to_string()).collect(),
        });
    }

    pub fn mount_table(&self) -> Vec<MountInfo> {
        self.state.lock().mounts.clone()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounts.iter().any(|m| m.path == path)
    }

    pub fn format_calls(&self) -> u32 {
        self.state.lock().format_calls
    }

    pub fn removed_dirs(&self) -> Vec<PathBuf> {
        self.state.lock().removed_dirs.clone()
    }
}

#[async_trait]
impl NodeHost for FakeHost {
    async fn host_guid(&self) -> Result<String> {
        self.state.lock().guid.clone().ok_or_else(|| Error::HostCommand {
            command: "drv_cfg --query_guid".into(),
            reason: "no such file or directory".into(),
        })
    }

    async fn kernel_module_loaded(&self, module: &str) -> Result<bool> {
        Ok(self.state.lock().modules.iter().any(|m| m == module))
    }

    async fn local_volumes(&self) -> Result<Vec<LocalVolume>> {
        let mut state = self.state.lock();
        state.scans += 1;
        if state.hidden_scans > 0 {
            state.hidden_scans -= 1;
            return Ok(Vec::new());
        }
        Ok(state.local.clone())
    }

    async fn block_device(&self, path: &Path) -> Result<Device> {
        self.state
            .lock()
            .devices
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("{} is not a block device", path.display())))
    }

    async fn mounts(&self) -> Result<Vec<MountInfo>> {
        Ok(self.state.lock().mounts.clone())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, opts: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = match state.mounts.iter().rev().find(|m| m.path == source) {
            Some(existing) => MountInfo {
                path: target.to_path_buf(),
                opts: rw_opts(opts),
                ..existing.clone()
            },
            None => MountInfo {
                device: "devtmpfs".into(),
                path: target.to_path_buf(),
                source: source.to_string_lossy().into_owned(),
                fs_type: "devtmpfs".into(),
                opts: rw_opts(opts),
            },
        };
        state.mounts.push(entry);
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        opts: &[String],
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            let dev = device.to_string_lossy().into_owned();
            if state.formatted.insert(dev) {
                state.format_calls += 1;
            }
        }
        self.mount(device, target, fs_type, opts).await
    }

    async fn mount(&self, device: &Path, target: &Path, fs_type: &str, opts: &[String]) -> Result<()> {
        self.state.lock().mounts.push(MountInfo {
            device: device.to_string_lossy().into_owned(),
            path: target.to_path_buf(),
            source: String::new(),
            fs_type: fs_type.to_string(),
            opts: rw_opts(opts),
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let mut state = self.state.lock();
        match state.mounts.iter().rposition(|m| m.path == target) {
            Some(idx) => {
                state.mounts.remove(idx);
                Ok(())
            }
            None => Err(Error::Mount {
                path: target.display().to_string(),
                reason: "not mounted".into(),
            }),
        }
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.state.lock().removed_dirs.push(path.to_path_buf());
        Ok(())
    }
}
