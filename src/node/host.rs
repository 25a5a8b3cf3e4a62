//! Linux node host
//!
//! Implements [`NodeHost`] against the local kernel: device symlinks under
//! `/dev/disk/by-id`, `/proc/self/mountinfo`, `mount(2)` through nix and the
//! usual userspace tools for probing and formatting filesystems.

use crate::domain::ports::{Device, LocalVolume, MountInfo, NodeHost};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::mount::{mount, umount, MsFlags};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Prefix of the by-id links the host agent creates for mapped volumes
const VOLUME_LINK_PREFIX: &str = "emc-vol-";

#[derive(Debug, Clone)]
pub struct LinuxHostConfig {
    pub by_id_dir: PathBuf,
    pub mountinfo_path: PathBuf,
    pub modules_path: PathBuf,
    pub drv_cfg_path: PathBuf,
}

impl Default for LinuxHostConfig {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            modules_path: PathBuf::from("/proc/modules"),
            drv_cfg_path: PathBuf::from("/opt/emc/scaleio/sdc/bin/drv_cfg"),
        }
    }
}

pub struct LinuxHost {
    config: LinuxHostConfig,
}

impl LinuxHost {
    pub fn new(config: LinuxHostConfig) -> Self {
        Self { config }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<std::process::Output> {
        let command = format!("{} {}", program.display(), args.join(" "));
        debug!("Running {}", command);
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::HostCommand {
                command,
                reason: e.to_string(),
            })
    }

    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.run(Path::new(program), args).await?;
        if !out.status.success() {
            return Err(Error::HostCommand {
                command: format!("{} {}", program, args.join(" ")),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Filesystem type on a device, `None` if it carries none
    async fn probe_fs(&self, device: &Path) -> Result<Option<String>> {
        let dev = device.to_string_lossy();
        let out = self
            .run(Path::new("blkid"), &["-p", "-s", "TYPE", "-o", "value", &*dev])
            .await?;
        // blkid exits with 2 when nothing was found
        match out.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&out.stdout).trim().to_string();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(2) => Ok(None),
            _ => Err(Error::HostCommand {
                command: format!("blkid {}", dev),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }),
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Split `emc-vol-<system>-<volume>` into (system, volume)
pub(crate) fn parse_volume_link(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix(VOLUME_LINK_PREFIX)?;
    let (system, volume) = rest.rsplit_once('-')?;
    if system.is_empty() || volume.is_empty() {
        return None;
    }
    Some((system.to_string(), volume.to_string()))
}

/// Undo the octal escapes the kernel applies to mount table fields
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(b) = decoded {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/self/mountinfo` content
///
/// `id parent maj:min root mount_point opts [optional...] - fstype source super_opts`
pub(crate) fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let sep = fields.iter().position(|f| *f == "-")?;
            if sep < 6 || fields.len() < sep + 3 {
                return None;
            }
            let root = unescape(fields[3]);
            let path = PathBuf::from(unescape(fields[4]));
            let opts = fields[5].split(',').map(String::from).collect();
            let fs_type = fields[sep + 1].to_string();
            let device = unescape(fields[sep + 2]);

            // Binds of device nodes show the node as the root of devtmpfs
            let source = if device == "devtmpfs" || device == "udev" {
                format!("/dev{}", root)
            } else {
                String::new()
            };

            Some(MountInfo {
                device,
                path,
                source,
                fs_type,
                opts,
            })
        })
        .collect()
}

/// Split mount options into kernel flags and filesystem data
fn mount_flags(opts: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in opts {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" => {}
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

fn mount_error(path: &Path, e: nix::errno::Errno) -> Error {
    Error::Mount {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl NodeHost for LinuxHost {
    async fn host_guid(&self) -> Result<String> {
        let out = self.run(&self.config.drv_cfg_path, &["--query_guid"]).await?;
        let guid = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !out.status.success() || guid.is_empty() {
            return Err(Error::HostCommand {
                command: format!("{} --query_guid", self.config.drv_cfg_path.display()),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(guid)
    }

    async fn kernel_module_loaded(&self, module: &str) -> Result<bool> {
        let content = tokio::fs::read_to_string(&self.config.modules_path).await?;
        Ok(content
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .any(|name| name == module))
    }

    async fn local_volumes(&self) -> Result<Vec<LocalVolume>> {
        let pattern = self
            .config
            .by_id_dir
            .join(format!("{}*", VOLUME_LINK_PREFIX))
            .to_string_lossy()
            .into_owned();
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::Internal(format!("bad device pattern {}: {}", pattern, e)))?;

        let mut volumes = Vec::new();
        for path in paths.flatten() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((system_id, volume_id)) = parse_volume_link(name) {
                volumes.push(LocalVolume {
                    volume_id,
                    system_id,
                    device_path: path.clone(),
                });
            }
        }
        Ok(volumes)
    }

    async fn block_device(&self, path: &Path) -> Result<Device> {
        let real_dev = tokio::fs::canonicalize(path).await?;
        let meta = tokio::fs::metadata(&real_dev).await?;
        if !meta.file_type().is_block_device() {
            return Err(Error::Internal(format!(
                "{} is not a block device",
                real_dev.display()
            )));
        }
        let name = real_dev
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Device {
            full_path: path.to_path_buf(),
            real_dev,
            name,
        })
    }

    async fn mounts(&self) -> Result<Vec<MountInfo>> {
        let content = tokio::fs::read_to_string(&self.config.mountinfo_path).await?;
        Ok(parse_mountinfo(&content))
    }

    async fn bind_mount(&self, source: &Path, target: &Path, opts: &[String]) -> Result<()> {
        let (flags, _) = mount_flags(opts);
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| mount_error(target, e))?;

        // Bind flags only take effect on a remount
        if !flags.is_empty() {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                None::<&str>,
            )
            .map_err(|e| mount_error(target, e))?;
        }
        debug!("Bind mounted {} on {}", source.display(), target.display());
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        opts: &[String],
    ) -> Result<()> {
        if self.probe_fs(device).await?.is_none() {
            let dev = device.to_string_lossy();
            let mkfs = format!("mkfs.{}", fs_type);
            let args: Vec<&str> = if fs_type.starts_with("ext") {
                vec!["-F", &*dev]
            } else {
                vec![&*dev]
            };
            self.run_checked(&mkfs, &args).await?;
            info!("Formatted {} as {}", device.display(), fs_type);
        }
        self.mount(device, target, fs_type, opts).await
    }

    async fn mount(&self, device: &Path, target: &Path, fs_type: &str, opts: &[String]) -> Result<()> {
        let (flags, data) = mount_flags(opts);
        let data = (!data.is_empty()).then_some(data.as_str());
        mount(Some(device), target, Some(fs_type), flags, data)
            .map_err(|e| mount_error(target, e))?;
        debug!("Mounted {} on {} ({})", device.display(), target.display(), fs_type);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        umount(target).map_err(|e| mount_error(target, e))?;
        debug!("Unmounted {}", target.display());
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let dir = path.to_string_lossy();
        self.run_checked("rmdir", &[&*dir]).await?;
        Ok(())
    }
}
