//! A fully in-memory host: devices, accounts and mounts are whatever the
//! caller declares, and every mutation is recorded instead of executed.

use crate::host::{HostProbe, ServiceAction, SystemMutator};
use crate::{Account, MountEntry, ReconcileError, ResolvedDevice};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    InstallPackages(Vec<String>),
    CreateDir(PathBuf),
    MountAll(Vec<PathBuf>),
    Service(ServiceAction, String),
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedHost {
    pub elevated: bool,
    devices: HashMap<PathBuf, Option<ResolvedDevice>>,
    accounts: Vec<Account>,
    active_mounts: HashSet<PathBuf>,
    /// Mount points that stay inactive even after `mount_all`.
    broken_mounts: HashSet<PathBuf>,
    failing_services: HashSet<(ServiceAction, String)>,
    failing_packages: bool,
    failing_mount_all: bool,
    actions: Vec<HostAction>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            elevated: true,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, path: impl Into<PathBuf>, uuid: &str, fs_kind: &str) -> Self {
        self.devices.insert(
            path.into(),
            Some(ResolvedDevice {
                uuid: uuid.to_string(),
                fs_kind: fs_kind.to_string(),
            }),
        );
        self
    }

    /// A present block device with no filesystem on it.
    pub fn with_blank_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.devices.insert(path.into(), None);
        self
    }

    pub fn with_account(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.accounts.push(Account {
            name: name.to_string(),
            uid,
            gid,
        });
        self
    }

    pub fn unprivileged(mut self) -> Self {
        self.elevated = false;
        self
    }

    pub fn with_broken_mount(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.broken_mounts.insert(mount_point.into());
        self
    }

    pub fn failing_service(mut self, action: ServiceAction, unit: &str) -> Self {
        self.failing_services.insert((action, unit.to_string()));
        self
    }

    pub fn failing_packages(mut self) -> Self {
        self.failing_packages = true;
        self
    }

    /// `mount_all` still activates entries but reports an error, as `mount -a`
    /// does when some unrelated line fails.
    pub fn failing_mount_all(mut self) -> Self {
        self.failing_mount_all = true;
        self
    }

    pub fn actions(&self) -> &[HostAction] {
        &self.actions
    }

    pub fn ran_service(&self, action: ServiceAction, unit: &str) -> bool {
        self.actions
            .iter()
            .any(|a| *a == HostAction::Service(action, unit.to_string()))
    }
}

impl HostProbe for SimulatedHost {
    fn resolve_device(&self, path: &Path) -> Result<ResolvedDevice, ReconcileError> {
        match self.devices.get(path) {
            None => Err(ReconcileError::DeviceNotFound(path.to_path_buf())),
            Some(None) => Err(ReconcileError::DeviceNotIdentifiable {
                path: path.to_path_buf(),
                reason: "no filesystem signature".to_string(),
            }),
            Some(Some(resolved)) => Ok(resolved.clone()),
        }
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn lookup_account(&self, name: &str) -> Option<Account> {
        self.accounts.iter().find(|a| a.name == name).cloned()
    }

    fn is_mount_active(&self, mount_point: &Path) -> Result<bool> {
        Ok(self.active_mounts.contains(mount_point))
    }
}

impl SystemMutator for SimulatedHost {
    fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        self.actions.push(HostAction::InstallPackages(packages.to_vec()));
        if self.failing_packages {
            return Err(anyhow!("apt-get install failed"));
        }
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> std::io::Result<()> {
        self.actions.push(HostAction::CreateDir(path.to_path_buf()));
        Ok(())
    }

    fn mount_all(&mut self, entries: &[MountEntry]) -> Result<()> {
        let points: Vec<PathBuf> = entries.iter().map(|e| e.mount_point.clone()).collect();
        for point in &points {
            if !self.broken_mounts.contains(point) {
                self.active_mounts.insert(point.clone());
            }
        }
        self.actions.push(HostAction::MountAll(points));
        if self.failing_mount_all {
            return Err(anyhow!("mount -a exited with status 32"));
        }
        Ok(())
    }

    fn service(&mut self, action: ServiceAction, unit: &str) -> Result<()> {
        self.actions
            .push(HostAction::Service(action, unit.to_string()));
        if self.failing_services.contains(&(action, unit.to_string())) {
            return Err(anyhow!("systemctl {} {} failed", action, unit));
        }
        Ok(())
    }
}
