use anyhow::{anyhow, Result};
use std::path::Path;
use usbshare_core::HostConfig;

/// Renders the Windows batch script that maps the host's shares to drive letters.
///
/// Each drive is unmapped first so re-running the script is harmless. `*`
/// makes `net use` prompt for the password instead of storing it in the file.
pub fn render_batch(config: &HostConfig) -> Result<String> {
    if config.client.drives.is_empty() {
        return Err(anyhow!("no client drives configured"));
    }
    let host = config.client.host.trim();
    if host.is_empty() {
        return Err(anyhow!("client host is empty"));
    }
    let account = config.client_account();

    let mut lines = vec![
        "@echo off".to_string(),
        format!("rem Map shares from {}", host),
    ];
    for drive in &config.client.drives {
        let letter = drive.letter.to_ascii_uppercase();
        lines.push(format!("net use {}: /delete /y >nul 2>&1", letter));
    }
    for drive in &config.client.drives {
        let letter = drive.letter.to_ascii_uppercase();
        lines.push(format!(
            "net use {}: \\\\{}\\{} * /user:{} /persistent:yes",
            letter, host, drive.share, account
        ));
    }
    lines.push("exit".to_string());

    let mut script = lines.join("\r\n");
    script.push_str("\r\n");
    Ok(script)
}

pub fn write_batch(config: &HostConfig, path: impl AsRef<Path>) -> Result<()> {
    let script = render_batch(config)?;
    std::fs::write(path.as_ref(), script)?;
    Ok(())
}
