use crate::{Account, MountEntry, ReconcileError, ResolvedDevice};
use anyhow::Result;
use std::fmt;
use std::path::Path;

/// Read-only queries against the host.
pub trait HostProbe {
    /// Resolves a block device to its UUID and filesystem kind.
    ///
    /// Fails with `DeviceNotFound` when `path` is not a block device and with
    /// `DeviceNotIdentifiable` when it carries no UUID or filesystem.
    fn resolve_device(&self, path: &Path) -> Result<ResolvedDevice, ReconcileError>;

    fn is_elevated(&self) -> bool;

    fn lookup_account(&self, name: &str) -> Option<Account>;

    fn is_mount_active(&self, mount_point: &Path) -> Result<bool>;
}

/// Privileged side effects. A run only reaches these after preconditions pass.
pub trait SystemMutator {
    fn install_packages(&mut self, packages: &[String]) -> Result<()>;

    fn create_dir_all(&mut self, path: &Path) -> std::io::Result<()>;

    /// Activates every mount-table entry. `entries` are the declared ones.
    fn mount_all(&mut self, entries: &[MountEntry]) -> Result<()>;

    fn service(&mut self, action: ServiceAction, unit: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Enable,
    Start,
    Restart,
    Reload,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Enable => "enable",
            ServiceAction::Start => "start",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
