//! Command execution: one process per command, or the persistent pipe

use super::command::RrdCommand;
use super::error::RrdError;
use super::process::RrdProcess;
use crate::config::RrdToolConfig;
use tokio::process::Command;
use tokio::sync::Mutex;

enum Mode {
    Cli,
    Persistent(Mutex<RrdProcess>),
}

pub struct RrdRunner {
    binary: String,
    daemon: Option<String>,
    mode: Mode,
}

impl RrdRunner {
    /// Nothing is spawned until the first command
    pub fn new(config: &RrdToolConfig) -> Self {
        let mode = if config.persistent {
            Mode::Persistent(Mutex::new(RrdProcess::new(config.binary.clone())))
        } else {
            Mode::Cli
        };
        Self {
            binary: config.binary.clone(),
            daemon: config.rrdcached_address.clone().filter(|a| !a.is_empty()),
            mode,
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.mode, Mode::Persistent(_))
    }

    pub async fn run(&self, command: &RrdCommand) -> Result<String, RrdError> {
        let daemon = self.daemon.as_deref();
        tracing::debug!(driver = "rrdtool", command = %command.to_line(daemon), "Running rrdtool");

        match &self.mode {
            Mode::Persistent(process) => process.lock().await.run(&command.to_line(daemon)).await,
            Mode::Cli => {
                let output = Command::new(&self.binary)
                    .args(command.to_args(daemon))
                    .kill_on_drop(true)
                    .output()
                    .await?;

                if output.status.success() {
                    return Ok(String::from_utf8_lossy(&output.stdout).to_string());
                }

                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = stderr
                    .lines()
                    .find(|l| l.starts_with("ERROR"))
                    .unwrap_or_else(|| stderr.trim());
                if message.is_empty() {
                    Err(RrdError::Command(format!("{} exited with {}", command.name(), output.status)))
                } else {
                    Err(RrdError::from_message(message))
                }
            }
        }
    }

    /// Check that the binary can be spawned. Persistent mode starts the
    /// pipe here rather than on the first command.
    pub async fn health_check(&self) -> Result<(), RrdError> {
        match &self.mode {
            Mode::Persistent(process) => process.lock().await.ensure_started().await,
            Mode::Cli => {
                Command::new(&self.binary).kill_on_drop(true).output().await?;
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<(), RrdError> {
        if let Mode::Persistent(process) = &self.mode {
            process.lock().await.stop().await?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Shell stand-in for the rrdtool CLI. Calls are appended to
    /// `calls.log` next to the script.
    pub(crate) fn fake_cli_binary(dir: &Path) -> PathBuf {
        let path = dir.join("rrdtool");
        std::fs::write(
            &path,
            r#"#!/bin/sh
log="$(dirname "$0")/calls.log"
echo "$*" >> "$log"
cmd="$1"; shift
[ "$1" = "--daemon" ] && shift 2
case "$cmd" in
  info)
    if [ ! -f "$1" ]; then echo "ERROR: opening '$1': No such file or directory" >&2; exit 1; fi
    echo "filename = \"$1\""
    echo "step = 60"
    echo "ds[usage].index = 0"
    echo "ds[idle].index = 1"
    ;;
  xport)
    echo '{"meta": {"start": 1698404400, "step": 60, "legend": ["usage", "idle"]},'
    echo ' "data": [[1.0, 99.0], [2.0, 98.0]]}'
    ;;
  fetch)
    echo "   usage   idle"
    echo ""
    echo "1698404460: 1.0e+00 9.9e+01"
    ;;
  last) echo "1698404400" ;;
  create) touch "$1" ;;
  update)
    case "$*" in
      *1000000000:*) echo "ERROR: $1: illegal attempt to update using time 1000000000 when last update time is 1698404400 (minimum one second step)" >&2; exit 1 ;;
    esac
    ;;
  *) exit 0 ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(binary: &Path) -> RrdToolConfig {
        RrdToolConfig {
            binary: binary.to_string_lossy().to_string(),
            ..RrdToolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cli_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RrdRunner::new(&config(&fake_cli_binary(dir.path())));
        assert!(!runner.is_persistent());

        let last = RrdCommand::Last {
            path: dir.path().join("cpu.rrd"),
        };
        assert_eq!(runner.run(&last).await.unwrap().trim(), "1698404400");

        let info = RrdCommand::Info {
            path: dir.path().join("missing.rrd"),
        };
        let err = runner.run(&info).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_daemon_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&fake_cli_binary(dir.path()));
        config.rrdcached_address = Some("unix:/tmp/rrdcached.sock".into());
        let runner = RrdRunner::new(&config);

        let last = RrdCommand::Last {
            path: dir.path().join("cpu.rrd"),
        };
        runner.run(&last).await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(log.starts_with("last --daemon unix:/tmp/rrdcached.sock "));
    }

    #[tokio::test]
    async fn test_persistent_mode() {
        let dir = tempfile::tempdir().unwrap();
        let binary = super::super::process::tests::fake_pipe_binary(dir.path());
        let mut config = config(&binary);
        config.persistent = true;
        let runner = RrdRunner::new(&config);
        assert!(runner.is_persistent());

        let last = RrdCommand::Last {
            path: "/data/cpu.rrd".into(),
        };
        assert_eq!(runner.run(&last).await.unwrap(), "echo: last /data/cpu.rrd\n");
        runner.close().await.unwrap();
        assert!(runner.run(&last).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = RrdRunner::new(&RrdToolConfig {
            binary: "/nonexistent/rrdtool".into(),
            ..RrdToolConfig::default()
        });
        assert!(runner.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_persistent_health_check_spawns() {
        let missing = RrdRunner::new(&RrdToolConfig {
            binary: "/nonexistent/rrdtool".into(),
            persistent: true,
            ..RrdToolConfig::default()
        });
        assert!(matches!(missing.health_check().await, Err(RrdError::Io(_))));

        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&super::super::process::tests::fake_pipe_binary(dir.path()));
        config.persistent = true;
        let runner = RrdRunner::new(&config);
        runner.health_check().await.unwrap();

        let last = RrdCommand::Last {
            path: "/data/cpu.rrd".into(),
        };
        assert_eq!(runner.run(&last).await.unwrap(), "echo: last /data/cpu.rrd\n");
        runner.close().await.unwrap();
    }
}
