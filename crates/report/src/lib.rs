use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use usbshare_core::{now_utc_rfc3339, REPORT_SCHEMA_VERSION};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub devices_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    run_id: String,
    created_at_utc: String,
    schema_version: String,
    meta: Option<Value>,
}

/// Writes `reports/<run-id>/{run.json,devices.json,logs.txt}` under `base`.
pub fn create_report_bundle<D: Serialize + ?Sized>(
    base: impl AsRef<Path>,
    devices: &D,
    meta: Option<Value>,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let base = base.as_ref();
    let root = base.join("reports").join(&run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let devices_json = root.join("devices.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    std::fs::write(&devices_json, serde_json::to_string_pretty(devices)?)?;

    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        meta,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;
    std::fs::write(&logs_path, logs.unwrap_or(""))?;

    Ok(ReportPaths {
        run_id,
        root,
        devices_json,
        run_json,
        logs_path,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Digest of a file's contents, `None` if it cannot be read.
pub fn file_digest(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read(path).ok().map(|bytes| sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let devices = vec![serde_json::json!({ "uuid": "ABCD-1234" })];
        let paths = create_report_bundle(
            dir.path(),
            &devices,
            Some(serde_json::json!({ "state": "done" })),
            Some("stage=done"),
        )
        .unwrap();

        assert!(paths.root.starts_with(dir.path().join("reports")));
        let run: Value = serde_json::from_str(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["run_id"], paths.run_id.as_str());
        assert_eq!(run["meta"]["state"], "done");
        assert_eq!(std::fs::read_to_string(&paths.logs_path).unwrap(), "stage=done");
        assert!(std::fs::read_to_string(&paths.devices_json).unwrap().contains("ABCD-1234"));
    }

    #[test]
    fn digests_match_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(file_digest("/nonexistent/usbshare").is_none());
    }
}
