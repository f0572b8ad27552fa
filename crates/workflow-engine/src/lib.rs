//! The setup run as an explicit state machine.
//!
//! ```text
//! Init -> PackagesReady -> DevicesResolved -> MountsDeclared -> MountsActive
//!      -> SharesDeclared -> ServiceReloaded -> NameServiceEnabled -> Done
//! ```
//!
//! Each state has one transition. Any transition error ends the run in
//! `Failed`; nothing is retried and nothing already written is rolled back.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use usbshare_core::{
    Account, FileStore, HostConfig, HostProbe, MediaServerConfig, MemoryStore, MountEntry, Reconciled,
    ReconcileError, ResolvedDevice, ServiceAction, SystemMutator, TextStore,
};
use usbshare_mount_table::MountTable;
use usbshare_safety::{can_modify_host, SafetyContext, SafetyDecision};
use usbshare_share_store::ShareTable;

/// Avahi service definition advertising the SMB shares under the host name.
pub const SMB_ADVERT: &str = r#"<?xml version="1.0" standalone='no'?>
<!DOCTYPE service-group SYSTEM "avahi-service.dtd">
<service-group>
  <name replace-wildcards="yes">%h</name>
  <service>
    <type>_smb._tcp</type>
    <port>445</port>
  </service>
</service-group>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    PackagesReady,
    DevicesResolved,
    MountsDeclared,
    MountsActive,
    SharesDeclared,
    ServiceReloaded,
    NameServiceEnabled,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::PackagesReady => "packages_ready",
            Stage::DevicesResolved => "devices_resolved",
            Stage::MountsDeclared => "mounts_declared",
            Stage::MountsActive => "mounts_active",
            Stage::SharesDeclared => "shares_declared",
            Stage::ServiceReloaded => "service_reloaded",
            Stage::NameServiceEnabled => "name_service_enabled",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug)]
pub enum RunState {
    Done,
    /// `at` is the last stage reached before the failing transition.
    Failed { at: Stage, error: ReconcileError },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub stage: Stage,
    pub duration_ms: u128,
    /// Log lines the transition produced, joined.
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub path: PathBuf,
    pub uuid: String,
    pub fs_kind: String,
    pub mount_point: PathBuf,
    pub share_name: String,
    pub mount: Option<Reconciled>,
    pub share: Option<Reconciled>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxOutcome {
    Skipped,
    Installed,
    Failed(String),
}

#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub steps: Vec<StepReport>,
    pub devices: Vec<DeviceSummary>,
    pub media_server: AuxOutcome,
    pub logs: Vec<String>,
    pub dry_run: bool,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        matches!(self.state, RunState::Done)
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match &self.state {
            RunState::Done => None,
            RunState::Failed { error, .. } => Some(error),
        }
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.steps.iter().map(|step| step.stage).collect()
    }

    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        match &self.state {
            RunState::Done => out.push_str(&format!("usbshare setup{}: done\n", mode)),
            RunState::Failed { at, error } => out.push_str(&format!(
                "usbshare setup{}: failed after {}: {}\n",
                mode,
                at.as_str(),
                error
            )),
        }
        for device in &self.devices {
            out.push_str(&format!(
                "  {}  UUID={} ({})\n",
                device.path.display(),
                device.uuid,
                device.fs_kind
            ));
            out.push_str(&format!(
                "    mount  {}  [{}]\n",
                device.mount_point.display(),
                describe(device.mount)
            ));
            out.push_str(&format!(
                "    share  {}  [{}]\n",
                device.share_name,
                describe(device.share)
            ));
        }
        match &self.media_server {
            AuxOutcome::Skipped => {}
            AuxOutcome::Installed => out.push_str("  media server: installed\n"),
            AuxOutcome::Failed(reason) => {
                out.push_str(&format!("  media server: failed ({})\n", reason))
            }
        }
        out
    }

    /// Run metadata for the report bundle.
    pub fn to_meta(&self) -> serde_json::Value {
        let (state, failed_after, error_kind, error) = match &self.state {
            RunState::Done => ("done", None, None, None),
            RunState::Failed { at, error } => (
                "failed",
                Some(at.as_str()),
                Some(error.kind()),
                Some(error.to_string()),
            ),
        };
        serde_json::json!({
            "workflow": "usbshare-setup",
            "state": state,
            "failed_after": failed_after,
            "error_kind": error_kind,
            "error": error,
            "dry_run": self.dry_run,
            "steps": self.steps,
            "devices": self.devices,
            "media_server": self.media_server,
        })
    }
}

fn install_media_server<H: SystemMutator>(host: &mut H, media: &MediaServerConfig) -> anyhow::Result<()> {
    host.install_packages(std::slice::from_ref(&media.package))?;
    host.service(ServiceAction::Enable, &media.service)?;
    host.service(ServiceAction::Restart, &media.service)?;
    Ok(())
}

fn describe(outcome: Option<Reconciled>) -> String {
    outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| "not reached".to_string())
}

/// The persistent files a run reconciles.
pub struct Stores<S> {
    pub mount_table: MountTable<S>,
    pub share_table: ShareTable<S>,
    pub smb_advert: Option<S>,
}

impl Stores<FileStore> {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            mount_table: MountTable::with_backup(
                FileStore::new(&config.fstab_path),
                FileStore::new(&config.fstab_backup_path),
            ),
            share_table: ShareTable::with_backup(
                FileStore::new(&config.smb_conf_path),
                FileStore::new(&config.smb_conf_backup_path),
            ),
            smb_advert: config.smb_advert_path.as_ref().map(FileStore::new),
        }
    }
}

impl Stores<MemoryStore> {
    /// In-memory copies of the configured files, for dry runs.
    pub fn snapshot(config: &HostConfig) -> std::io::Result<Self> {
        Ok(Self {
            mount_table: MountTable::with_backup(
                MemoryStore::snapshot_of(&config.fstab_path)?,
                MemoryStore::snapshot_of(&config.fstab_backup_path)?,
            ),
            share_table: ShareTable::with_backup(
                MemoryStore::snapshot_of(&config.smb_conf_path)?,
                MemoryStore::snapshot_of(&config.smb_conf_backup_path)?,
            ),
            smb_advert: match &config.smb_advert_path {
                Some(path) => Some(MemoryStore::snapshot_of(path)?),
                None => None,
            },
        })
    }
}

pub struct Orchestrator<'h, H, S> {
    config: HostConfig,
    host: &'h mut H,
    stores: Stores<S>,
    dry_run: bool,
    owner: Option<Account>,
    devices: Vec<DeviceSummary>,
    logs: Vec<String>,
}

impl<'h, H, S> Orchestrator<'h, H, S>
where
    H: HostProbe + SystemMutator,
    S: TextStore,
{
    pub fn new(config: HostConfig, host: &'h mut H, stores: Stores<S>) -> Self {
        Self {
            config,
            host,
            stores,
            dry_run: false,
            owner: None,
            devices: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn stores(&self) -> &Stores<S> {
        &self.stores
    }

    pub fn into_stores(self) -> Stores<S> {
        self.stores
    }

    pub fn run(&mut self) -> RunReport {
        let mut steps = Vec::new();
        self.logs.push("workflow=usbshare-setup".to_string());
        self.logs.push(format!("dry_run={}", self.dry_run));

        let state = match self.preflight() {
            Err(error) => {
                error!(%error, "preconditions not met");
                RunState::Failed {
                    at: Stage::Init,
                    error,
                }
            }
            Ok(()) => {
                let mut stage = Stage::Init;
                loop {
                    if stage == Stage::Done {
                        break RunState::Done;
                    }
                    let start = Instant::now();
                    let mark = self.logs.len();
                    match self.advance(stage) {
                        Ok(next) => {
                            let duration_ms = start.elapsed().as_millis();
                            let detail = self.logs[mark..].join("; ");
                            info!(stage = next.as_str(), duration_ms, "stage reached");
                            self.logs
                                .push(format!("stage={} duration_ms={}", next.as_str(), duration_ms));
                            steps.push(StepReport {
                                stage: next,
                                duration_ms,
                                detail,
                            });
                            stage = next;
                        }
                        Err(error) => {
                            error!(after = stage.as_str(), %error, "setup failed");
                            break RunState::Failed { at: stage, error };
                        }
                    }
                }
            }
        };

        let media_server = match state {
            RunState::Done => self.install_media_server(),
            RunState::Failed { .. } => AuxOutcome::Skipped,
        };

        match &state {
            RunState::Done => self.logs.push("state=done".to_string()),
            RunState::Failed { at, error } => self.logs.push(format!(
                "state=failed after={} kind={} reason={}",
                at.as_str(),
                error.kind(),
                error
            )),
        }

        RunReport {
            state,
            steps,
            devices: self.devices.clone(),
            media_server,
            logs: std::mem::take(&mut self.logs),
            dry_run: self.dry_run,
        }
    }

    /// Validates configuration and checks privileges and the owning account.
    /// Nothing on the host is touched.
    pub fn preflight(&mut self) -> Result<(), ReconcileError> {
        self.config.validate()?;
        let ctx = SafetyContext::probe(&*self.host, &self.config.owner, self.dry_run);
        match can_modify_host(&ctx) {
            SafetyDecision::Allow(account) => {
                self.logs.push(format!(
                    "owner={} uid={} gid={}",
                    account.name, account.uid, account.gid
                ));
                self.owner = Some(account);
                Ok(())
            }
            SafetyDecision::Deny(reason) => Err(ReconcileError::PrecondFailed(reason)),
        }
    }

    /// Performs the transition out of `stage` and returns the stage reached.
    pub fn advance(&mut self, stage: Stage) -> Result<Stage, ReconcileError> {
        match stage {
            Stage::Init => {
                self.install_packages()?;
                Ok(Stage::PackagesReady)
            }
            Stage::PackagesReady => {
                self.resolve_devices()?;
                Ok(Stage::DevicesResolved)
            }
            Stage::DevicesResolved => {
                self.declare_mounts()?;
                Ok(Stage::MountsDeclared)
            }
            Stage::MountsDeclared => {
                self.activate_mounts()?;
                Ok(Stage::MountsActive)
            }
            Stage::MountsActive => {
                self.declare_shares()?;
                Ok(Stage::SharesDeclared)
            }
            Stage::SharesDeclared => {
                self.reload_share_service()?;
                Ok(Stage::ServiceReloaded)
            }
            Stage::ServiceReloaded => {
                self.enable_name_service()?;
                Ok(Stage::NameServiceEnabled)
            }
            Stage::NameServiceEnabled | Stage::Done => Ok(Stage::Done),
        }
    }

    fn owner(&self) -> Result<Account, ReconcileError> {
        self.owner.clone().ok_or_else(|| {
            ReconcileError::PrecondFailed("preflight has not confirmed the owner".to_string())
        })
    }

    fn install_packages(&mut self) -> Result<(), ReconcileError> {
        let packages = self.config.packages.clone();
        self.host
            .install_packages(&packages)
            .map_err(|err| ReconcileError::PackageInstallFailed(format!("{:#}", err)))?;
        self.logs.push(format!("packages={}", packages.join(",")));
        Ok(())
    }

    fn resolve_devices(&mut self) -> Result<(), ReconcileError> {
        let mut devices = Vec::new();
        for spec in &self.config.devices {
            let ResolvedDevice { uuid, fs_kind } = self.host.resolve_device(&spec.path)?;
            info!(device = %spec.path.display(), %uuid, fs = %fs_kind, "device resolved");
            self.logs.push(format!(
                "device={} uuid={} fs={}",
                spec.path.display(),
                uuid,
                fs_kind
            ));
            devices.push(DeviceSummary {
                path: spec.path.clone(),
                uuid,
                fs_kind,
                mount_point: spec.mount_point.clone(),
                share_name: spec.share_name.clone(),
                mount: None,
                share: None,
            });
        }
        self.devices = devices;
        Ok(())
    }

    fn declare_mounts(&mut self) -> Result<(), ReconcileError> {
        let owner = self.owner()?;
        for device in self.devices.iter_mut() {
            let resolved = ResolvedDevice {
                uuid: device.uuid.clone(),
                fs_kind: device.fs_kind.clone(),
            };
            let entry = MountEntry::for_device(&resolved, device.mount_point.clone(), &owner);
            self.host.create_dir_all(&entry.mount_point).map_err(|err| {
                ReconcileError::store(format!("create {}", entry.mount_point.display()), err)
            })?;
            let outcome = self.stores.mount_table.ensure_mount(&entry)?;
            self.logs.push(format!(
                "mount={} uuid={} outcome={:?}",
                entry.mount_point.display(),
                entry.uuid,
                outcome
            ));
            device.mount = Some(outcome);
        }
        Ok(())
    }

    fn activate_mounts(&mut self) -> Result<(), ReconcileError> {
        let uuids: Vec<&str> = self.devices.iter().map(|d| d.uuid.as_str()).collect();
        let entries = self.stores.mount_table.entries_for(&uuids)?;
        if let Err(err) = self.host.mount_all(&entries) {
            // A failing mount -a is not terminal on its own: it also fails on
            // unrelated fstab lines. Only an inactive configured mount point
            // ends the run, in the check below.
            warn!(error = %format!("{:#}", err), "mount -a reported errors");
            self.logs.push(format!("mount_all_error={:#}", err));
        }

        for device in &self.devices {
            let active = match self.host.is_mount_active(&device.mount_point) {
                Ok(active) => active,
                Err(err) => {
                    warn!(mount_point = %device.mount_point.display(), error = %format!("{:#}", err), "cannot read active mounts");
                    false
                }
            };
            if !active {
                if let Some(entry) = entries
                    .iter()
                    .find(|e| e.uuid == device.uuid && e.mount_point != device.mount_point)
                {
                    warn!(
                        uuid = %device.uuid,
                        declared = %entry.mount_point.display(),
                        requested = %device.mount_point.display(),
                        "device is declared at a different mount point"
                    );
                }
                return Err(ReconcileError::MountVerificationFailed(
                    device.mount_point.clone(),
                ));
            }
            self.logs
                .push(format!("mount_active={}", device.mount_point.display()));
        }
        Ok(())
    }

    fn declare_shares(&mut self) -> Result<(), ReconcileError> {
        let owner = self.owner()?;
        for device in self.devices.iter_mut() {
            let outcome = self.stores.share_table.ensure_share(
                &device.share_name,
                device.mount_point.clone(),
                &owner.name,
            )?;
            self.logs
                .push(format!("share={} outcome={:?}", device.share_name, outcome));
            device.share = Some(outcome);
        }
        Ok(())
    }

    fn reload_share_service(&mut self) -> Result<(), ReconcileError> {
        let unit = self.config.share_service.clone();
        if let Err(reload_err) = self.host.service(ServiceAction::Reload, &unit) {
            warn!(%unit, error = %format!("{:#}", reload_err), "reload failed, restarting");
            self.host
                .service(ServiceAction::Restart, &unit)
                .map_err(|restart_err| {
                    ReconcileError::ShareReloadFailed(format!(
                        "{}: reload: {:#}; restart: {:#}",
                        unit, reload_err, restart_err
                    ))
                })?;
            self.logs.push(format!("service={} action=restart", unit));
        } else {
            self.logs.push(format!("service={} action=reload", unit));
        }
        self.require_service(ServiceAction::Enable, &unit)
    }

    fn enable_name_service(&mut self) -> Result<(), ReconcileError> {
        if let Some(advert) = self.stores.smb_advert.as_mut() {
            if advert.exists() {
                info!(path = %advert.location(), "smb advertisement already present");
            } else {
                advert.write_new(SMB_ADVERT).map_err(|err| {
                    ReconcileError::store(format!("write {}", advert.location()), err)
                })?;
                info!(path = %advert.location(), "smb advertisement written");
                self.logs.push(format!("smb_advert={}", advert.location()));
            }
        }
        let unit = self.config.name_service.clone();
        self.require_service(ServiceAction::Enable, &unit)?;
        self.require_service(ServiceAction::Restart, &unit)
    }

    fn require_service(&mut self, action: ServiceAction, unit: &str) -> Result<(), ReconcileError> {
        self.host
            .service(action, unit)
            .map_err(|err| ReconcileError::ServiceFailed {
                unit: unit.to_string(),
                reason: format!("{}: {:#}", action, err),
            })?;
        self.logs.push(format!("service={} action={}", unit, action));
        Ok(())
    }

    /// Best effort; failures are logged and reported, never fatal.
    fn install_media_server(&mut self) -> AuxOutcome {
        let media = self.config.media_server.clone();
        if !media.enabled {
            return AuxOutcome::Skipped;
        }
        match install_media_server(&mut *self.host, &media) {
            Ok(()) => {
                info!(service = %media.service, "media server installed");
                self.logs.push(format!("media_server={} installed", media.service));
                AuxOutcome::Installed
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                warn!(service = %media.service, error = %reason, "media server install failed");
                self.logs.push(format!("media_server={} failed", media.service));
                AuxOutcome::Failed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbshare_core::sim::{HostAction, SimulatedHost};

    const STOCK_FSTAB: &str = "proc /proc proc defaults 0 0\nPARTUUID=738a4d67-02 / ext4 defaults,noatime 0 1\n";
    const STOCK_SMB: &str = "[global]\n   workgroup = WORKGROUP\n   map to guest = bad user\n";

    fn host() -> SimulatedHost {
        SimulatedHost::new()
            .with_account("dan", 1000, 1000)
            .with_device("/dev/sda1", "ABCD-1234", "ext4")
            .with_device("/dev/sdb1", "5E6F-7A8B", "exfat")
    }

    fn stores() -> Stores<MemoryStore> {
        Stores {
            mount_table: MountTable::with_backup(
                MemoryStore::with_contents("fstab", STOCK_FSTAB),
                MemoryStore::missing("fstab.bak"),
            ),
            share_table: ShareTable::with_backup(
                MemoryStore::with_contents("smb.conf", STOCK_SMB),
                MemoryStore::missing("smb.conf.bak"),
            ),
            smb_advert: Some(MemoryStore::missing("smb.service")),
        }
    }

    /// Same files, fresh process: backups are re-evaluated from what is on "disk".
    fn next_process(stores: &Stores<MemoryStore>) -> Stores<MemoryStore> {
        Stores {
            mount_table: MountTable::with_backup(
                stores.mount_table.store().clone(),
                stores.mount_table.backup().unwrap().clone(),
            ),
            share_table: ShareTable::with_backup(
                stores.share_table.store().clone(),
                stores.share_table.backup().unwrap().clone(),
            ),
            smb_advert: stores.smb_advert.clone(),
        }
    }

    fn fstab(stores: &Stores<MemoryStore>) -> String {
        stores.mount_table.store().contents().unwrap_or("").to_string()
    }

    fn smb(stores: &Stores<MemoryStore>) -> String {
        stores.share_table.store().contents().unwrap_or("").to_string()
    }

    #[test]
    fn full_run_reaches_done() {
        let mut host = host();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();

        assert!(report.is_done(), "{}", report.summary_text());
        assert_eq!(
            report.stages(),
            vec![
                Stage::PackagesReady,
                Stage::DevicesResolved,
                Stage::MountsDeclared,
                Stage::MountsActive,
                Stage::SharesDeclared,
                Stage::ServiceReloaded,
                Stage::NameServiceEnabled,
                Stage::Done,
            ]
        );
        assert_eq!(report.media_server, AuxOutcome::Skipped);

        let stores = orch.into_stores();
        let table = fstab(&stores);
        assert!(table.starts_with(STOCK_FSTAB));
        assert!(table.contains("UUID=ABCD-1234  /mnt/usb1  ext4  defaults,nofail  0  2"));
        assert!(table.contains("UUID=5E6F-7A8B  /mnt/usb2  exfat  defaults,nofail,uid=1000,gid=1000,umask=000  0  0"));
        let conf = smb(&stores);
        assert!(conf.contains("[USB1]\n   path = /mnt/usb1"));
        assert!(conf.contains("[USB2]\n   path = /mnt/usb2"));
        assert_eq!(stores.share_table.backup().unwrap().contents(), Some(STOCK_SMB));
        assert_eq!(stores.mount_table.backup().unwrap().contents(), Some(STOCK_FSTAB));
        assert_eq!(stores.smb_advert.as_ref().unwrap().contents(), Some(SMB_ADVERT));

        assert!(host.ran_service(ServiceAction::Reload, "smbd"));
        assert!(host.ran_service(ServiceAction::Enable, "smbd"));
        assert!(host.ran_service(ServiceAction::Enable, "avahi-daemon"));
        assert!(host.ran_service(ServiceAction::Restart, "avahi-daemon"));
        assert!(!host.ran_service(ServiceAction::Restart, "smbd"));
        assert!(host
            .actions()
            .contains(&HostAction::CreateDir(PathBuf::from("/mnt/usb1"))));
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut host = host();
        let mut first = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(first.run().is_done());
        let after_first = first.into_stores();

        let mut host = self::host();
        let mut second =
            Orchestrator::new(HostConfig::default(), &mut host, next_process(&after_first));
        let report = second.run();
        assert!(report.is_done());
        for device in &report.devices {
            assert_eq!(device.mount, Some(Reconciled::AlreadyPresent));
            assert_eq!(device.share, Some(Reconciled::AlreadyPresent));
        }

        let after_second = second.into_stores();
        assert_eq!(fstab(&after_second), fstab(&after_first));
        assert_eq!(smb(&after_second), smb(&after_first));
        assert_eq!(smb(&after_second).matches("[USB1]").count(), 1);
        assert_eq!(after_second.share_table.backup().unwrap().contents(), Some(STOCK_SMB));
    }

    #[test]
    fn missing_owner_fails_before_any_mutation() {
        let mut host = SimulatedHost::new().with_device("/dev/sda1", "ABCD-1234", "ext4");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();

        assert!(matches!(
            report.state,
            RunState::Failed {
                at: Stage::Init,
                error: ReconcileError::PrecondFailed(_)
            }
        ));
        assert!(report.steps.is_empty());
        let stores = orch.into_stores();
        assert_eq!(fstab(&stores), STOCK_FSTAB);
        assert_eq!(smb(&stores), STOCK_SMB);
        assert!(!stores.share_table.backup().unwrap().exists());
        assert!(host.actions().is_empty());
    }

    #[test]
    fn unprivileged_run_is_refused_unless_dry_run() {
        let mut host = host().unprivileged();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(matches!(
            orch.run().error(),
            Some(ReconcileError::PrecondFailed(_))
        ));

        let mut host = self::host().unprivileged();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores()).dry_run(true);
        assert!(orch.run().is_done());
    }

    #[test]
    fn invalid_config_does_no_work() {
        let mut config = HostConfig::default();
        config.devices.clear();
        let mut host = host();
        let mut orch = Orchestrator::new(config, &mut host, stores());
        assert!(matches!(
            orch.run().error(),
            Some(ReconcileError::InvalidConfig(_))
        ));
        assert!(host.actions().is_empty());
    }

    #[test]
    fn missing_device_aborts_before_mount_table() {
        let mut host = SimulatedHost::new()
            .with_account("dan", 1000, 1000)
            .with_device("/dev/sda1", "ABCD-1234", "ext4");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();

        match &report.state {
            RunState::Failed { at, error } => {
                assert_eq!(*at, Stage::PackagesReady);
                assert!(matches!(error, ReconcileError::DeviceNotFound(p) if p == &PathBuf::from("/dev/sdb1")));
            }
            RunState::Done => panic!("expected failure"),
        }
        assert_eq!(fstab(&orch.into_stores()), STOCK_FSTAB);
    }

    #[test]
    fn blank_device_is_not_identifiable() {
        let mut host = SimulatedHost::new()
            .with_account("dan", 1000, 1000)
            .with_device("/dev/sda1", "ABCD-1234", "ext4")
            .with_blank_device("/dev/sdb1");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(matches!(
            orch.run().error(),
            Some(ReconcileError::DeviceNotIdentifiable { .. })
        ));
    }

    #[test]
    fn inactive_mount_fails_verification_and_keeps_entry() {
        let mut host = host().with_broken_mount("/mnt/usb2");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();

        match &report.state {
            RunState::Failed { at, error } => {
                assert_eq!(*at, Stage::MountsDeclared);
                assert!(matches!(error, ReconcileError::MountVerificationFailed(p) if p == &PathBuf::from("/mnt/usb2")));
            }
            RunState::Done => panic!("expected failure"),
        }
        let stores = orch.into_stores();
        assert!(fstab(&stores).contains("UUID=5E6F-7A8B"));
        assert_eq!(smb(&stores), STOCK_SMB);
    }

    #[test]
    fn stale_mount_point_for_known_device_fails_verification() {
        let mut stores = stores();
        stores.mount_table = MountTable::new(MemoryStore::with_contents(
            "fstab",
            format!("{}UUID=ABCD-1234  /srv/old  ext4  defaults  0  2\n", STOCK_FSTAB),
        ));
        let mut host = host();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores);
        let report = orch.run();

        assert_eq!(report.devices[0].mount, Some(Reconciled::AlreadyPresent));
        assert!(matches!(
            report.error(),
            Some(ReconcileError::MountVerificationFailed(p)) if p == &PathBuf::from("/mnt/usb1")
        ));
        assert_eq!(fstab(&orch.into_stores()).matches("ABCD-1234").count(), 1);
    }

    #[test]
    fn reload_failure_falls_back_to_restart() {
        let mut host = host().failing_service(ServiceAction::Reload, "smbd");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(orch.run().is_done());
        assert!(host.ran_service(ServiceAction::Restart, "smbd"));
        assert!(host.ran_service(ServiceAction::Enable, "smbd"));
    }

    #[test]
    fn reload_and_restart_failure_is_fatal() {
        let mut host = host()
            .failing_service(ServiceAction::Reload, "smbd")
            .failing_service(ServiceAction::Restart, "smbd");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();
        match &report.state {
            RunState::Failed { at, error } => {
                assert_eq!(*at, Stage::SharesDeclared);
                assert!(matches!(error, ReconcileError::ShareReloadFailed(_)));
            }
            RunState::Done => panic!("expected failure"),
        }
        assert!(!host.ran_service(ServiceAction::Enable, "avahi-daemon"));
    }

    #[test]
    fn name_service_failure_is_fatal() {
        let mut host = host().failing_service(ServiceAction::Enable, "avahi-daemon");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(matches!(
            orch.run().error(),
            Some(ReconcileError::ServiceFailed { unit, .. }) if unit == "avahi-daemon"
        ));
    }

    #[test]
    fn package_failure_is_fatal() {
        let mut host = host().failing_packages();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();
        assert!(matches!(
            report.error(),
            Some(ReconcileError::PackageInstallFailed(_))
        ));
        assert_eq!(fstab(&orch.into_stores()), STOCK_FSTAB);
    }

    #[test]
    fn media_server_failure_is_not_fatal() {
        let mut config = HostConfig::default();
        config.media_server.enabled = true;
        let mut host = host().failing_service(ServiceAction::Restart, "minidlna");
        let mut orch = Orchestrator::new(config, &mut host, stores());
        let report = orch.run();
        assert!(report.is_done());
        assert!(matches!(report.media_server, AuxOutcome::Failed(_)));
        assert!(report.summary_text().contains("media server: failed"));
    }

    #[test]
    fn media_server_installs_when_enabled() {
        let mut config = HostConfig::default();
        config.media_server.enabled = true;
        let mut host = host();
        let mut orch = Orchestrator::new(config, &mut host, stores());
        assert_eq!(orch.run().media_server, AuxOutcome::Installed);
        assert!(host
            .actions()
            .contains(&HostAction::InstallPackages(vec!["minidlna".to_string()])));
    }

    #[test]
    fn existing_advert_is_left_alone() {
        let mut stores = stores();
        stores.smb_advert = Some(MemoryStore::with_contents("smb.service", "custom"));
        let mut host = host();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores);
        assert!(orch.run().is_done());
        let stores = orch.into_stores();
        assert_eq!(stores.smb_advert.unwrap().contents(), Some("custom"));
    }

    #[test]
    fn summary_and_meta_describe_the_run() {
        let mut host = host();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();
        let text = report.summary_text();
        assert!(text.contains("done"));
        assert!(text.contains("/dev/sda1  UUID=ABCD-1234 (ext4)"));
        assert!(text.contains("mount  /mnt/usb1  [added]"));
        assert!(text.contains("share  USB2  [added]"));

        let meta = report.to_meta();
        assert_eq!(meta["state"], "done");
        assert_eq!(meta["devices"][1]["share_name"], "USB2");
        assert_eq!(meta["steps"][0]["stage"], "packages_ready");
        assert!(report.logs.iter().any(|l| l == "state=done"));
    }

    #[test]
    fn advance_requires_preflight_for_owner() {
        let mut host = host();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert_eq!(orch.advance(Stage::PackagesReady).unwrap(), Stage::DevicesResolved);
        assert!(matches!(
            orch.advance(Stage::DevicesResolved),
            Err(ReconcileError::PrecondFailed(_))
        ));
        orch.preflight().unwrap();
        assert_eq!(orch.advance(Stage::DevicesResolved).unwrap(), Stage::MountsDeclared);
    }

    #[test]
    fn mount_all_error_alone_is_not_terminal() {
        let mut host = host().failing_mount_all();
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        let report = orch.run();
        assert!(report.is_done(), "{}", report.summary_text());
        assert!(report.logs.iter().any(|l| l.starts_with("mount_all_error=")));

        let mut host = self::host().failing_mount_all().with_broken_mount("/mnt/usb1");
        let mut orch = Orchestrator::new(HostConfig::default(), &mut host, stores());
        assert!(matches!(
            orch.run().error(),
            Some(ReconcileError::MountVerificationFailed(_))
        ));
    }

    fn config_in(dir: &std::path::Path) -> HostConfig {
        let mut config = HostConfig::default();
        config.fstab_path = dir.join("fstab");
        config.fstab_backup_path = dir.join("fstab.bak");
        config.smb_conf_path = dir.join("samba/smb.conf");
        config.smb_conf_backup_path = dir.join("samba/smb.conf.bak");
        config.smb_advert_path = Some(dir.join("avahi/services/smb.service"));
        config
    }

    fn seed(config: &HostConfig) {
        std::fs::create_dir_all(config.smb_conf_path.parent().unwrap()).unwrap();
        std::fs::write(&config.fstab_path, STOCK_FSTAB).unwrap();
        std::fs::write(&config.smb_conf_path, STOCK_SMB).unwrap();
    }

    #[test]
    fn dry_run_leaves_real_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        seed(&config);

        let stores = Stores::snapshot(&config).unwrap();
        let mut host = self::host().unprivileged();
        let mut orch = Orchestrator::new(config.clone(), &mut host, stores).dry_run(true);
        let report = orch.run();
        assert!(report.is_done(), "{}", report.summary_text());

        // the planned changes exist only in memory
        let stores = orch.into_stores();
        assert!(fstab(&stores).contains("UUID=ABCD-1234"));
        assert!(smb(&stores).contains("[USB1]"));

        assert_eq!(std::fs::read_to_string(&config.fstab_path).unwrap(), STOCK_FSTAB);
        assert_eq!(std::fs::read_to_string(&config.smb_conf_path).unwrap(), STOCK_SMB);
        assert!(!config.fstab_backup_path.exists());
        assert!(!config.smb_conf_backup_path.exists());
        assert!(!config.smb_advert_path.as_ref().unwrap().exists());
    }

    #[test]
    fn file_backed_runs_keep_pristine_backups() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        seed(&config);

        for _ in 0..2 {
            let mut host = self::host();
            let mut orch =
                Orchestrator::new(config.clone(), &mut host, Stores::from_config(&config));
            let report = orch.run();
            assert!(report.is_done(), "{}", report.summary_text());
        }

        let fstab = std::fs::read_to_string(&config.fstab_path).unwrap();
        assert_eq!(fstab.matches("UUID=ABCD-1234").count(), 1);
        assert_eq!(fstab.matches("UUID=5E6F-7A8B").count(), 1);
        let conf = std::fs::read_to_string(&config.smb_conf_path).unwrap();
        assert_eq!(conf.matches("[USB1]").count(), 1);
        assert_eq!(conf.matches("[USB2]").count(), 1);

        assert_eq!(std::fs::read_to_string(&config.fstab_backup_path).unwrap(), STOCK_FSTAB);
        assert_eq!(std::fs::read_to_string(&config.smb_conf_backup_path).unwrap(), STOCK_SMB);
        assert_eq!(
            std::fs::read_to_string(config.smb_advert_path.as_ref().unwrap()).unwrap(),
            SMB_ADVERT
        );
    }
}
