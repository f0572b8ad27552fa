//! Reconciler for the persistent mount table (`/etc/fstab`).
//!
//! Entries are keyed on the filesystem UUID. The table is append-only from
//! this crate's point of view: an identifier that is already declared is left
//! exactly as it is, even if it points at a different mount point.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use usbshare_core::{BackupOnce, MountEntry, Reconciled, ReconcileError, TextStore};

/// One parsed, non-comment line of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLine {
    pub spec: String,
    pub mount_point: PathBuf,
    pub fs_kind: String,
    pub options: String,
    pub dump_freq: u32,
    pub pass_no: u32,
}

impl TableLine {
    /// UUID named by the first field, if it names one.
    pub fn uuid(&self) -> Option<&str> {
        let spec = self.spec.as_str();
        let value = spec
            .strip_prefix("UUID=")
            .or_else(|| spec.strip_prefix("/dev/disk/by-uuid/"))?;
        Some(value.trim_matches('"'))
    }

    fn names(&self, uuid: &str) -> bool {
        match self.uuid() {
            Some(value) => value.eq_ignore_ascii_case(uuid),
            None => self.spec == uuid,
        }
    }
}

pub fn parse_line(line: &str) -> Option<TableLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let spec = fields.next()?.to_string();
    let mount_point = PathBuf::from(unescape_field(fields.next()?));
    let fs_kind = fields.next()?.to_string();
    let options = fields.next().unwrap_or("defaults").to_string();
    let dump_freq = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let pass_no = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    Some(TableLine {
        spec,
        mount_point,
        fs_kind,
        options,
        dump_freq,
        pass_no,
    })
}

pub fn format_line(entry: &MountEntry) -> String {
    format!(
        "UUID={}  {}  {}  {}  {}  {}",
        entry.uuid,
        escape_field(&entry.mount_point.display().to_string()),
        entry.fs_kind,
        entry.options,
        entry.dump_freq,
        entry.pass_no
    )
}

pub struct MountTable<S> {
    store: S,
    backup: Option<BackupOnce<S>>,
}

impl<S: TextStore> MountTable<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            backup: None,
        }
    }

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

    pub fn lines(&self) -> Result<Vec<TableLine>, ReconcileError> {
        let data = self
            .store
            .read_or_empty()
            .map_err(|err| ReconcileError::store(format!("read {}", self.store.location()), err))?;
        Ok(data.lines().filter_map(parse_line).collect())
    }

    pub fn find(&self, uuid: &str) -> Result<Option<TableLine>, ReconcileError> {
        Ok(self.lines()?.into_iter().find(|line| line.names(uuid)))
    }

    /// Entries this table declares for the given UUIDs, in table order.
    pub fn entries_for(&self, uuids: &[&str]) -> Result<Vec<MountEntry>, ReconcileError> {
        Ok(self
            .lines()?
            .into_iter()
            .filter_map(|line| {
                let uuid = uuids.iter().find(|uuid| line.names(uuid))?;
                Some(MountEntry {
                    uuid: uuid.to_string(),
                    mount_point: line.mount_point,
                    fs_kind: line.fs_kind,
                    options: line.options,
                    dump_freq: line.dump_freq,
                    pass_no: line.pass_no,
                })
            })
            .collect())
    }

    /// Adds `entry` unless its UUID is already declared. The lookup, backup
    /// and append all happen under one exclusive lock on the table.
    pub fn ensure_mount(&mut self, entry: &MountEntry) -> Result<Reconciled, ReconcileError> {
        let _lock = self
            .store
            .lock_exclusive()
            .map_err(|err| ReconcileError::store(format!("lock {}", self.store.location()), err))?;
        if let Some(existing) = self.find(&entry.uuid)? {
            if existing.mount_point != entry.mount_point {
                warn!(
                    uuid = %entry.uuid,
                    declared = %existing.mount_point.display(),
                    requested = %entry.mount_point.display(),
                    "mount table already declares this device at another mount point; leaving it"
                );
            } else {
                info!(uuid = %entry.uuid, mount_point = %entry.mount_point.display(), "mount entry already present");
            }
            return Ok(Reconciled::AlreadyPresent);
        }

        if let Some(backup) = self.backup.as_mut() {
            backup.ensure(&self.store).map_err(|err| {
                ReconcileError::store(format!("back up {}", self.store.location()), err)
            })?;
        }

        let current = self
            .store
            .read_or_empty()
            .map_err(|err| ReconcileError::store(format!("read {}", self.store.location()), err))?;
        let mut text = String::new();
        if !current.is_empty() && !current.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format_line(entry));
        text.push('\n');
        self.store
            .append(&text)
            .map_err(|err| ReconcileError::store(format!("append {}", self.store.location()), err))?;

        info!(uuid = %entry.uuid, mount_point = %entry.mount_point.display(), fs = %entry.fs_kind, "mount entry added");
        Ok(Reconciled::Added)
    }
}

/// Whether `mount_point` appears as the target of a line in mount-info text
/// (`/proc/self/mounts` format).
pub fn mounts_contain(mounts: &str, mount_point: &Path) -> bool {
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|target| Path::new(&unescape_field(target)) == mount_point)
            .unwrap_or(false)
    })
}

pub fn escape_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => output.push_str("\\040"),
            '\t' => output.push_str("\\011"),
            '\n' => output.push_str("\\012"),
            '\\' => output.push_str("\\134"),
            _ => output.push(ch),
        }
    }
    output
}

pub fn unescape_field(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_digit(8) {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}
