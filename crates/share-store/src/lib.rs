//! Reconciler for the Samba share configuration (`smb.conf`).
//!
//! Shares are keyed on their section name. A share whose `[NAME]` header is
//! already in the store is never touched; new shares are appended with a fixed
//! permissive policy.

use std::path::PathBuf;
use tracing::info;
use usbshare_core::{BackupOnce, Reconciled, ReconcileError, ShareEntry, TextStore};

pub struct ShareTable<S> {
    store: S,
    backup: Option<BackupOnce<S>>,
}

impl<S: TextStore> ShareTable<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            backup: None,
        }
    }

    /// The backup is taken before the first append made through this table.
    pub fn with_backup(store: S, backup: S) -> Self {
        Self {
            store,
            backup: Some(BackupOnce::new(backup)),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backup(&self) -> Option<&S> {
        self.backup.as_ref().map(|b| b.target())
    }

    fn read(&self) -> Result<String, ReconcileError> {
        self.store
            .read_or_empty()
            .map_err(|err| ReconcileError::store(format!("read {}", self.store.location()), err))
    }

    /// Section names in store order, `global` included.
    pub fn sections(&self) -> Result<Vec<String>, ReconcileError> {
        Ok(self.read()?.lines().filter_map(section_name).map(str::to_string).collect())
    }

    pub fn has_section(&self, name: &str) -> Result<bool, ReconcileError> {
        Ok(self.read()?.lines().any(|line| section_name(line) == Some(name)))
    }

    pub fn ensure_share(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
        owner: &str,
    ) -> Result<Reconciled, ReconcileError> {
        self.ensure_entry(&ShareEntry::permissive(name, path, owner))
    }

    pub fn ensure_entry(&mut self, entry: &ShareEntry) -> Result<Reconciled, ReconcileError> {
        let _lock = self
            .store
            .lock_exclusive()
            .map_err(|err| ReconcileError::store(format!("lock {}", self.store.location()), err))?;
        let current = self.read()?;
        if current.lines().any(|line| section_name(line) == Some(entry.name.as_str())) {
            info!(share = %entry.name, "share already present");
            return Ok(Reconciled::AlreadyPresent);
        }

        if let Some(backup) = self.backup.as_mut() {
            backup.ensure(&self.store).map_err(|err| {
                ReconcileError::store(format!("back up {}", self.store.location()), err)
            })?;
        }

        let mut text = String::new();
        if !current.is_empty() {
            if !current.ends_with('\n') {
                text.push('\n');
            }
            text.push('\n');
        }
        text.push_str(&format_section(entry));
        self.store
            .append(&text)
            .map_err(|err| ReconcileError::store(format!("append {}", self.store.location()), err))?;

        info!(share = %entry.name, path = %entry.path.display(), owner = %entry.force_user, "share added");
        Ok(Reconciled::Added)
    }
}

fn section_name(line: &str) -> Option<&str> {
    line.trim().strip_prefix('[')?.strip_suffix(']')
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn format_section(entry: &ShareEntry) -> String {
    let mut out = String::new();
    out.push_str(&format!("[{}]\n", entry.name));
    out.push_str(&format!("   path = {}\n", entry.path.display()));
    out.push_str(&format!("   browseable = {}\n", yes_no(entry.browseable)));
    out.push_str(&format!("   writeable = {}\n", yes_no(entry.writeable)));
    out.push_str(&format!("   guest ok = {}\n", yes_no(entry.guest_ok)));
    out.push_str(&format!("   public = {}\n", yes_no(entry.guest_ok)));
    out.push_str(&format!("   force user = {}\n", entry.force_user));
    out.push_str(&format!("   create mask = {}\n", entry.create_mask));
    out.push_str(&format!("   directory mask = {}\n", entry.directory_mask));
    out
}
