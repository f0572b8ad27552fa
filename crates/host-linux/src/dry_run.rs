use crate::LinuxHost;
use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;
use usbshare_core::{
    Account, HostProbe, MountEntry, ReconcileError, ResolvedDevice, ServiceAction, SystemMutator,
};

/// Queries the real host but only logs what it would change.
///
/// Mount points "activated" by `mount_all` count as active afterwards so a
/// dry run can walk the whole sequence.
#[derive(Debug, Default)]
pub struct DryRunHost {
    probe: LinuxHost,
    simulated_mounts: HashSet<PathBuf>,
    planned: Vec<String>,
}

impl DryRunHost {
    pub fn new(probe: LinuxHost) -> Self {
        Self {
            probe,
            simulated_mounts: HashSet::new(),
            planned: Vec::new(),
        }
    }

    /// Commands the run would have executed, in order.
    pub fn planned(&self) -> &[String] {
        &self.planned
    }

    fn plan(&mut self, action: String) {
        info!(action = %action, "dry-run: would run");
        self.planned.push(action);
    }
}

impl HostProbe for DryRunHost {
    fn resolve_device(&self, path: &Path) -> Result<ResolvedDevice, ReconcileError> {
        self.probe.resolve_device(path)
    }

    fn is_elevated(&self) -> bool {
        self.probe.is_elevated()
    }

    fn lookup_account(&self, name: &str) -> Option<Account> {
        self.probe.lookup_account(name)
    }

    fn is_mount_active(&self, mount_point: &Path) -> Result<bool> {
        if self.simulated_mounts.contains(mount_point) {
            return Ok(true);
        }
        self.probe.is_mount_active(mount_point)
    }
}

impl SystemMutator for DryRunHost {
    fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        self.plan("apt-get update".to_string());
        self.plan(format!("apt-get install -y {}", packages.join(" ")));
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> std::io::Result<()> {
        self.plan(format!("mkdir -p {}", path.display()));
        Ok(())
    }

    fn mount_all(&mut self, entries: &[MountEntry]) -> Result<()> {
        self.plan("mount -a".to_string());
        self.simulated_mounts
            .extend(entries.iter().map(|entry| entry.mount_point.clone()));
        Ok(())
    }

    fn service(&mut self, action: ServiceAction, unit: &str) -> Result<()> {
        self.plan(format!("systemctl {} {}", action, unit));
        Ok(())
    }
}
