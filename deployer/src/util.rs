//! Subprocess helpers and local workspace management

use crate::error::Error;
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

/// Maximum number of attempts for a retried subprocess
pub const MAX_COMMAND_ATTEMPTS: usize = 3;

/// Interval between subprocess retries
pub const COMMAND_RETRY_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(5);

/// Returns the local workspace directory, optionally scoped to a deployment.
///
/// Generated artifacts (parameter files, Helm values, job specs, the VPN
/// profile) live here and are safe to delete; every run regenerates them.
pub fn workspace_directory(name: Option<&str>) -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join(".sparkobs");
    match name {
        Some(name) => dir.join(name),
        None => dir,
    }
}

/// Verifies that every prerequisite tool is on PATH before any AWS call.
/// Each entry pairs the tool with the arguments of its version probe.
pub async fn ensure_tools(tools: &[(&str, &[&str])]) -> Result<(), Error> {
    for (tool, probe) in tools {
        let status = Command::new(tool)
            .args(*probe)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                debug!(tool, "found prerequisite tool");
            }
            _ => return Err(Error::ToolMissing(tool.to_string())),
        }
    }
    Ok(())
}

/// Runs a subprocess to completion, capturing output; retries transient
/// failures up to [`MAX_COMMAND_ATTEMPTS`] times
pub async fn run(program: &str, args: &[&str]) -> Result<String, Error> {
    let rendered = format!("{program} {}", args.join(" "));
    let mut last_detail = String::new();
    for attempt in 1..=MAX_COMMAND_ATTEMPTS {
        debug!(command = rendered.as_str(), attempt, "running command");
        let output = Command::new(program).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        last_detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if attempt < MAX_COMMAND_ATTEMPTS {
            tokio::time::sleep(COMMAND_RETRY_INTERVAL).await;
        }
    }
    Err(Error::CommandFailed {
        command: rendered,
        detail: last_detail,
    })
}

/// Runs a subprocess once, writing `input` to its stdin (used for
/// `docker login --password-stdin`)
pub async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<(), Error> {
    let rendered = format!("{program} {}", args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(input).await?;
    }
    drop(child.stdin.take());
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: rendered,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Writes a generated artifact into the workspace directory and logs where
/// it landed
pub fn write_artifact(dir: &Path, file_name: &str, contents: &str) -> Result<PathBuf, Error> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, contents)?;
    info!(path = %path.display(), "wrote artifact");
    Ok(path)
}

/// Hex-encoded SHA-256 digest of a byte slice
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for byte in out {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_stable() {
        assert_eq!(
            digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest(b""), digest(b""));
        assert_ne!(digest(b"a"), digest(b"b"));
    }

    #[test]
    fn test_workspace_directory_scoped() {
        let base = workspace_directory(None);
        let scoped = workspace_directory(Some("demo"));
        assert_eq!(scoped, base.join("demo"));
    }

    #[test]
    fn test_write_artifact_roundtrip() {
        let dir = std::env::temp_dir().join("sparkobs-test-artifacts");
        let path = write_artifact(&dir, "sample.json", "{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        std::fs::remove_dir_all(&dir).ok();
    }
}
