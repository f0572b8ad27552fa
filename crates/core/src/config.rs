use crate::{DeviceSpec, ReconcileError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Everything a setup run needs. `Default` is the compiled-in configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub devices: Vec<DeviceSpec>,
    pub owner: String,
    pub packages: Vec<String>,
    pub fstab_path: PathBuf,
    pub fstab_backup_path: PathBuf,
    pub smb_conf_path: PathBuf,
    pub smb_conf_backup_path: PathBuf,
    pub share_service: String,
    pub name_service: String,
    /// Avahi service definition advertising SMB; `None` skips it.
    pub smb_advert_path: Option<PathBuf>,
    pub media_server: MediaServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MediaServerConfig {
    pub enabled: bool,
    pub package: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    /// Account used on the remote side; falls back to `HostConfig::owner`.
    pub account: Option<String>,
    pub drives: Vec<DriveMapping>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriveMapping {
    pub letter: char,
    pub share: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceSpec {
                    path: PathBuf::from("/dev/sda1"),
                    mount_point: PathBuf::from("/mnt/usb1"),
                    share_name: "USB1".to_string(),
                },
                DeviceSpec {
                    path: PathBuf::from("/dev/sdb1"),
                    mount_point: PathBuf::from("/mnt/usb2"),
                    share_name: "USB2".to_string(),
                },
            ],
            owner: "dan".to_string(),
            packages: ["samba", "samba-common-bin", "avahi-daemon", "ntfs-3g", "exfat-fuse"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            fstab_path: PathBuf::from("/etc/fstab"),
            fstab_backup_path: PathBuf::from("/etc/fstab.bak"),
            smb_conf_path: PathBuf::from("/etc/samba/smb.conf"),
            smb_conf_backup_path: PathBuf::from("/etc/samba/smb.conf.bak"),
            share_service: "smbd".to_string(),
            name_service: "avahi-daemon".to_string(),
            smb_advert_path: Some(PathBuf::from("/etc/avahi/services/smb.service")),
            media_server: MediaServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            package: "minidlna".to_string(),
            service: "minidlna".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "raspberrypi.local".to_string(),
            account: None,
            drives: vec![
                DriveMapping {
                    letter: 'Z',
                    share: "USB1".to_string(),
                },
                DriveMapping {
                    letter: 'Y',
                    share: "USB2".to_string(),
                },
            ],
        }
    }
}

impl HostConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: HostConfig = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the compiled-in configuration.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn client_account(&self) -> &str {
        self.client.account.as_deref().unwrap_or(&self.owner)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |msg: String| Err(ReconcileError::InvalidConfig(msg));

        if self.devices.is_empty() {
            return invalid("no devices configured".to_string());
        }
        if self.owner.trim().is_empty() {
            return invalid("owner account is empty".to_string());
        }

        let mut paths = HashSet::new();
        let mut mount_points = HashSet::new();
        let mut shares = HashSet::new();
        for device in &self.devices {
            if !device.path.is_absolute() {
                return invalid(format!("device path {} is not absolute", device.path.display()));
            }
            if !device.mount_point.is_absolute() {
                return invalid(format!(
                    "mount point {} is not absolute",
                    device.mount_point.display()
                ));
            }
            // written raw into smb.conf `path =` lines
            if device.mount_point.to_string_lossy().chars().any(char::is_control) {
                return invalid(format!(
                    "mount point {:?} contains control characters",
                    device.mount_point
                ));
            }
            if !valid_share_name(&device.share_name) {
                return invalid(format!("invalid share name {:?}", device.share_name));
            }
            if !paths.insert(device.path.clone()) {
                return invalid(format!("duplicate device {}", device.path.display()));
            }
            if !mount_points.insert(device.mount_point.clone()) {
                return invalid(format!(
                    "duplicate mount point {}",
                    device.mount_point.display()
                ));
            }
            if !shares.insert(device.share_name.clone()) {
                return invalid(format!("duplicate share name {}", device.share_name));
            }
        }

        for (label, path) in [
            ("fstab_path", &self.fstab_path),
            ("fstab_backup_path", &self.fstab_backup_path),
            ("smb_conf_path", &self.smb_conf_path),
            ("smb_conf_backup_path", &self.smb_conf_backup_path),
        ] {
            if !path.is_absolute() {
                return invalid(format!("{} {} is not absolute", label, path.display()));
            }
        }
        if self.fstab_path == self.fstab_backup_path || self.smb_conf_path == self.smb_conf_backup_path {
            return invalid("backup path must differ from the file it backs up".to_string());
        }
        if self.share_service.trim().is_empty() || self.name_service.trim().is_empty() {
            return invalid("service names must not be empty".to_string());
        }

        let mut letters = HashSet::new();
        for drive in &self.client.drives {
            if !drive.letter.is_ascii_alphabetic() {
                return invalid(format!("invalid drive letter {:?}", drive.letter));
            }
            if !letters.insert(drive.letter.to_ascii_uppercase()) {
                return invalid(format!("duplicate drive letter {}", drive.letter));
            }
            if !shares.contains(&drive.share) {
                return invalid(format!("drive {} maps unknown share {}", drive.letter, drive.share));
            }
        }
        Ok(())
    }
}

fn valid_share_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['[', ']', '\n'])
}
