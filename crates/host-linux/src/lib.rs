use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use usbshare_core::{
    Account, BlockDevice, HostProbe, MountEntry, Partition, ReconcileError, ResolvedDevice,
    ServiceAction, SystemMutator,
};
use usbshare_mount_table::{mounts_contain, unescape_field};

mod dry_run;

pub use dry_run::DryRunHost;

/// The running Linux host. Paths are fields so tests can point them at fixtures.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    pub sys_block: PathBuf,
    pub mounts_path: PathBuf,
    pub passwd_path: PathBuf,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            mounts_path: PathBuf::from("/proc/self/mounts"),
            passwd_path: PathBuf::from("/etc/passwd"),
        }
    }
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical disks and their partitions, virtual devices excluded.
    pub fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        let mounts = read_mounts(&self.mounts_path);
        let mut disks = Vec::new();
        let entries = fs::read_dir(&self.sys_block)
            .with_context(|| format!("read {}", self.sys_block.display()))?;
        for entry in entries {
            let entry = entry?;
            let disk_name = entry.file_name().to_string_lossy().to_string();
            if is_virtual_disk(&disk_name, entry.path()) {
                continue;
            }
            let size_bytes = read_u64(entry.path().join("size"))
                .map(|sectors| sectors.saturating_mul(512))
                .unwrap_or(0);
            let removable = read_u64(entry.path().join("removable")).unwrap_or(0) == 1;
            let model = read_string(entry.path().join("device/model"))
                .unwrap_or_else(|| disk_name.clone());
            let partitions = enumerate_partitions(entry.path(), &mounts)?;
            disks.push(BlockDevice {
                path: PathBuf::from("/dev").join(&disk_name),
                name: disk_name,
                model,
                size_bytes,
                removable,
                partitions,
            });
        }
        disks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(disks)
    }
}

impl HostProbe for LinuxHost {
    fn resolve_device(&self, path: &Path) -> Result<ResolvedDevice, ReconcileError> {
        if !is_block_device(path) {
            return Err(ReconcileError::DeviceNotFound(path.to_path_buf()));
        }
        let output = Command::new("blkid")
            .args(["-o", "export"])
            .arg(path)
            .output()
            .map_err(|err| ReconcileError::DeviceNotIdentifiable {
                path: path.to_path_buf(),
                reason: format!("run blkid: {}", err),
            })?;
        // blkid exits 2 when the device carries no recognisable signature
        if !output.status.success() {
            return Err(ReconcileError::DeviceNotIdentifiable {
                path: path.to_path_buf(),
                reason: format!("blkid exited with {}", output.status),
            });
        }
        let resolved = parse_blkid_export(&String::from_utf8_lossy(&output.stdout)).map_err(
            |reason| ReconcileError::DeviceNotIdentifiable {
                path: path.to_path_buf(),
                reason,
            },
        )?;
        debug!(device = %path.display(), uuid = %resolved.uuid, fs = %resolved.fs_kind, "resolved device");
        Ok(resolved)
    }

    fn is_elevated(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    fn lookup_account(&self, name: &str) -> Option<Account> {
        let data = fs::read_to_string(&self.passwd_path).ok()?;
        find_account(&data, name)
    }

    fn is_mount_active(&self, mount_point: &Path) -> Result<bool> {
        let data = fs::read_to_string(&self.mounts_path)
            .with_context(|| format!("read {}", self.mounts_path.display()))?;
        Ok(mounts_contain(&data, mount_point))
    }
}

impl SystemMutator for LinuxHost {
    fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        run_cmd("apt-get", &["update"])?;
        let mut args = vec!["install", "-y"];
        args.extend(packages.iter().map(String::as_str));
        run_cmd("apt-get", &args)?;
        info!(packages = %packages.join(" "), "packages installed");
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> std::io::Result<()> {
        fs::create_dir_all(path)
    }

    fn mount_all(&mut self, entries: &[MountEntry]) -> Result<()> {
        debug!(declared = entries.len(), "mount -a");
        run_cmd("mount", &["-a"])
    }

    fn service(&mut self, action: ServiceAction, unit: &str) -> Result<()> {
        run_cmd("systemctl", &[action.as_str(), unit])
    }
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    debug!(cmd, args = %args.join(" "), "run");
    let output = Command::new(cmd)
        .args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .with_context(|| format!("run {}", cmd))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} {} failed: {}",
            cmd,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(unix)]
fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_block_device(_path: &Path) -> bool {
    false
}

/// Parses `blkid -o export` output into UUID and filesystem kind.
pub fn parse_blkid_export(data: &str) -> std::result::Result<ResolvedDevice, String> {
    let mut uuid = None;
    let mut fs_kind = None;
    for line in data.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key {
            "UUID" => uuid = Some(value.to_string()),
            "TYPE" => fs_kind = Some(value.to_string()),
            _ => {}
        }
    }
    match (uuid, fs_kind) {
        (Some(uuid), Some(fs_kind)) => Ok(ResolvedDevice { uuid, fs_kind }),
        (None, _) => Err("no filesystem UUID".to_string()),
        (Some(_), None) => Err("no filesystem type".to_string()),
    }
}

/// Looks `name` up in passwd-format text.
pub fn find_account(passwd: &str, name: &str) -> Option<Account> {
    passwd.lines().find_map(|line| {
        if line.starts_with('#') {
            return None;
        }
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        Some(Account {
            name: name.to_string(),
            uid,
            gid,
        })
    })
}

fn enumerate_partitions(
    disk_path: PathBuf,
    mounts: &HashMap<String, Vec<MountInfo>>,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let entries = fs::read_dir(&disk_path).context("read disk entries")?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.join("partition").exists() {
            continue;
        }
        let part_name = entry.file_name().to_string_lossy().to_string();
        let size_bytes = read_u64(path.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let mount_infos = mounts.get(&part_name).cloned().unwrap_or_default();
        let mount_points = mount_infos.iter().map(|info| info.mount_point.clone()).collect();
        let fs_type = mount_infos.first().map(|info| info.fs_type.clone());
        partitions.push(Partition {
            path: PathBuf::from("/dev").join(&part_name),
            name: part_name,
            fs: fs_type,
            size_bytes,
            mount_points,
        });
    }
    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(partitions)
}

#[derive(Debug, Clone)]
struct MountInfo {
    mount_point: String,
    fs_type: String,
}

fn read_mounts(path: &Path) -> HashMap<String, Vec<MountInfo>> {
    let data = fs::read_to_string(path).unwrap_or_default();
    parse_mounts(&data)
}

fn parse_mounts(data: &str) -> HashMap<String, Vec<MountInfo>> {
    let mut mounts: HashMap<String, Vec<MountInfo>> = HashMap::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(MountInfo {
            mount_point: unescape_field(mount_point),
            fs_type: fs_type.to_string(),
        });
    }
    mounts
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn is_virtual_disk(name: &str, path: PathBuf) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}
