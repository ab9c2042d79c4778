//! Controls the workload container through the Pebble CLI.

use oathkeeper_operator_reconcile::{Layer, Workload, WorkloadError};
use std::{collections::BTreeSet, io::Write, path::PathBuf, process::Output, time::Duration};
use tempfile::NamedTempFile;
use tokio::{process::Command, time};
use tracing::{debug, info};

const LAYER_LABEL: &str = "oathkeeper";

/// Grace period beyond an exec's own timeout before the CLI is abandoned.
const EXEC_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct Pebble {
    socket: PathBuf,
    service: String,
}

// === impl Pebble ===

impl Pebble {
    pub fn new(socket: impl Into<PathBuf>, service: impl ToString) -> Self {
        Self {
            socket: socket.into(),
            service: service.to_string(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("pebble");
        cmd.env("PEBBLE_SOCKET", &self.socket)
            .args(args)
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<Output, WorkloadError> {
        self.command(args)
            .output()
            .await
            .map_err(|error| WorkloadError::Unreachable(error.to_string()))
    }

    /// Runs a Pebble request that changes the workload.
    async fn change(&self, args: &[&str]) -> Result<(), WorkloadError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(WorkloadError::Change(stderr(&output)));
        }
        Ok(())
    }
}

/// Stages content in a local file so that the CLI can upload it.
fn staged(prefix: &str, content: &str) -> Result<NamedTempFile, WorkloadError> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .map_err(|error| WorkloadError::Change(error.to_string()))?;
    file.write_all(content.as_bytes())
        .map_err(|error| WorkloadError::Change(error.to_string()))?;
    Ok(file)
}

#[async_trait::async_trait]
impl Workload for Pebble {
    async fn can_connect(&self) -> bool {
        match self.output(&["plan"]).await {
            Ok(output) => output.status.success(),
            Err(error) => {
                debug!(%error, "Cannot reach Pebble");
                false
            }
        }
    }

    async fn is_running(&self) -> bool {
        match self.output(&["services", &self.service]).await {
            Ok(output) if output.status.success() => {
                service_is_active(&String::from_utf8_lossy(&output.stdout), &self.service)
            }
            _ => false,
        }
    }

    async fn add_layer(&self, layer: &Layer) -> Result<(), WorkloadError> {
        let yaml = layer
            .to_yaml()
            .map_err(|error| WorkloadError::Change(error.to_string()))?;
        let file = staged("oathkeeper-layer-", &yaml)?;
        let path = file.path().to_string_lossy().into_owned();
        self.change(&["add", LAYER_LABEL, &path, "--combine"]).await?;
        info!(label = LAYER_LABEL, "Added Pebble layer");
        Ok(())
    }

    async fn restart(&self) -> Result<(), WorkloadError> {
        self.change(&["restart", &self.service]).await?;
        info!(service = %self.service, "Restarted service");
        Ok(())
    }

    async fn push(&self, path: &str, content: &str) -> Result<(), WorkloadError> {
        let file = staged("oathkeeper-push-", content)?;
        let local = file.path().to_string_lossy().into_owned();
        self.change(&["push", "--make-dirs", &local, path]).await?;
        debug!(%path, "Pushed file to the workload");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), WorkloadError> {
        let output = self.output(&["rm", "-r", path]).await?;
        if output.status.success() {
            debug!(%path, "Removed path from the workload");
            return Ok(());
        }
        let stderr = stderr(&output);
        if is_not_found(&stderr) {
            return Ok(());
        }
        Err(WorkloadError::Change(stderr))
    }

    async fn list_files(&self, dir: &str) -> Result<BTreeSet<String>, WorkloadError> {
        let output = self.output(&["ls", "-l", dir]).await?;
        if output.status.success() {
            return Ok(regular_files(&String::from_utf8_lossy(&output.stdout)));
        }
        let stderr = stderr(&output);
        if is_not_found(&stderr) {
            return Ok(BTreeSet::new());
        }
        Err(WorkloadError::Change(stderr))
    }

    async fn exec(&self, command: &[String], timeout: Duration) -> Result<String, WorkloadError> {
        let timeout_arg = format!("{}s", timeout.as_secs());
        let mut args = vec!["exec", "--timeout", timeout_arg.as_str(), "--"];
        args.extend(command.iter().map(String::as_str));

        let output = time::timeout(timeout + EXEC_GRACE, self.output(&args))
            .await
            .map_err(|_| WorkloadError::Timeout(timeout))??;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(code) => Err(WorkloadError::Exec {
                code,
                stderr: stderr(&output),
            }),
            None => Err(WorkloadError::Change(format!(
                "command terminated by signal: {}",
                stderr(&output)
            ))),
        }
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such file or directory")
}

/// Parses the long listing printed by `pebble ls -l`, keeping regular files only:
///
/// ```text
/// -rw-r--r--  root  root  1.2kB  today at 10:00 UTC  access-rules-requirer-deny.json
/// drwxr-xr-x  root  root      -  today at 10:00 UTC  nested
/// ```
fn regular_files(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter(|line| line.starts_with('-'))
        .filter_map(|line| line.split_whitespace().last())
        .map(|path| path.rsplit('/').next().unwrap_or(path).to_string())
        .collect()
}

/// Parses the table printed by `pebble services`:
///
/// ```text
/// Service     Startup  Current  Since
/// oathkeeper  enabled  active   today at 10:00 UTC
/// ```
fn service_is_active(table: &str, service: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let mut columns = line.split_whitespace();
        columns.next() == Some(service) && columns.nth(1) == Some("active")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_status() {
        let active = "Service     Startup  Current  Since\n\
                      oathkeeper  enabled  active   today at 10:00 UTC\n";
        assert!(service_is_active(active, "oathkeeper"));
        assert!(!service_is_active(active, "other"));

        let inactive = "Service     Startup  Current   Since\n\
                        oathkeeper  enabled  inactive  -\n";
        assert!(!service_is_active(inactive, "oathkeeper"));

        assert!(!service_is_active("", "oathkeeper"));
    }

    #[test]
    fn parses_file_listings() {
        let listing = "\
            -rw-r--r--  root  root  1.2kB  today at 10:00 UTC  access-rules-requirer-allow.json\n\
            -rw-r--r--  root  root    310B  today at 10:00 UTC  /etc/config/access-rules/b.json\n\
            drwxr-xr-x  root  root       -  today at 10:00 UTC  nested\n";
        assert_eq!(
            regular_files(listing),
            ["access-rules-requirer-allow.json", "b.json"]
                .map(String::from)
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
        assert!(regular_files("").is_empty());
    }

    #[test]
    fn detects_missing_paths() {
        assert!(is_not_found(
            "error: stat /etc/config/access-rules: no such file or directory"
        ));
        assert!(!is_not_found("error: permission denied"));
    }
}
