use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;

pub mod config;
pub mod error;
pub mod host;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod store;

pub use config::{ClientConfig, DriveMapping, HostConfig, MediaServerConfig};
pub use error::ReconcileError;
pub use host::{HostProbe, ServiceAction, SystemMutator};
pub use store::{BackupOnce, BackupOutcome, FileStore, MemoryStore, StoreLock, TextStore};

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

/// A device the host should mount and share, as declared by configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub path: PathBuf,
    pub mount_point: PathBuf,
    pub share_name: String,
}

/// What the OS reports for a block device.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub uuid: String,
    pub fs_kind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub uuid: String,
    pub mount_point: PathBuf,
    pub fs_kind: String,
    pub options: String,
    pub dump_freq: u32,
    pub pass_no: u32,
}

impl MountEntry {
    /// Builds the entry for a resolved device, picking options by filesystem kind.
    pub fn for_device(resolved: &ResolvedDevice, mount_point: PathBuf, owner: &Account) -> Self {
        let fs = resolved.fs_kind.to_ascii_lowercase();
        let (options, pass_no) = match fs.as_str() {
            "ext2" | "ext3" | "ext4" | "btrfs" | "xfs" => ("defaults,nofail".to_string(), 2),
            "vfat" | "exfat" | "ntfs" | "ntfs3" | "fuseblk" => (
                format!(
                    "defaults,nofail,uid={},gid={},umask=000",
                    owner.uid, owner.gid
                ),
                0,
            ),
            _ => ("defaults,nofail".to_string(), 0),
        };
        Self {
            uuid: resolved.uuid.clone(),
            mount_point,
            fs_kind: resolved.fs_kind.clone(),
            options,
            dump_freq: 0,
            pass_no,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub name: String,
    pub path: PathBuf,
    pub browseable: bool,
    pub writeable: bool,
    pub guest_ok: bool,
    pub force_user: String,
    pub create_mask: String,
    pub directory_mask: String,
}

impl ShareEntry {
    /// World-browsable, world-writable, guest-accessible share owned by `owner`.
    pub fn permissive(name: &str, path: impl Into<PathBuf>, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            browseable: true,
            writeable: true,
            guest_ok: true,
            force_user: owner.to_string(),
            create_mask: "0777".to_string(),
            directory_mask: "0777".to_string(),
        }
    }
}

/// A host account, as found in the account database.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reconciled {
    Added,
    AlreadyPresent,
}

impl fmt::Display for Reconciled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconciled::Added => write!(f, "added"),
            Reconciled::AlreadyPresent => write!(f, "already present"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub model: String,
    pub size_bytes: u64,
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Partition {
    pub name: String,
    pub path: PathBuf,
    pub fs: Option<String>,
    pub size_bytes: u64,
    pub mount_points: Vec<String>,
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
