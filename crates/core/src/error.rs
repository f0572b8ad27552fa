use std::path::PathBuf;

/// Failure kinds of a reconciliation run. Every variant is fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("precondition failed: {0}")]
    PrecondFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("device not identifiable: {}: {reason}", .path.display())]
    DeviceNotIdentifiable { path: PathBuf, reason: String },

    #[error("package installation failed: {0}")]
    PackageInstallFailed(String),

    #[error("mount verification failed: {} is not an active mount", .0.display())]
    MountVerificationFailed(PathBuf),

    #[error("share service reload failed: {0}")]
    ShareReloadFailed(String),

    #[error("service {unit} failed: {reason}")]
    ServiceFailed { unit: String, reason: String },

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReconcileError {
    pub fn store(context: impl Into<String>, source: std::io::Error) -> Self {
        ReconcileError::Store {
            context: context.into(),
            source,
        }
    }

    /// Short stable name of the failure kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::PrecondFailed(_) => "precond_failed",
            ReconcileError::InvalidConfig(_) => "invalid_config",
            ReconcileError::DeviceNotFound(_) => "device_not_found",
            ReconcileError::DeviceNotIdentifiable { .. } => "device_not_identifiable",
            ReconcileError::PackageInstallFailed(_) => "package_install_failed",
            ReconcileError::MountVerificationFailed(_) => "mount_verification_failed",
            ReconcileError::ShareReloadFailed(_) => "share_reload_failed",
            ReconcileError::ServiceFailed { .. } => "service_failed",
            ReconcileError::Store { .. } => "store",
        }
    }
}
