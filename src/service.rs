use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use tokio::process::{Child, Command};

use crate::config::Config;

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A service subprocess launched for replay, with the mock URL injected
/// through its environment.
pub struct ManagedService {
    child: Child,
    command: String,
}

/// Launches the configured service command through the platform shell,
/// inheriting the parent environment plus `extra_env`, then waits for the
/// configured startup time. Returns `None` when no command is configured.
pub async fn start_service(
    config: &Config,
    extra_env: &[(String, String)],
) -> anyhow::Result<Option<ManagedService>> {
    let command_line = config.service.command.trim();
    if command_line.is_empty() {
        return Ok(None);
    }

    let mut command = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    };

    for (name, value) in extra_env {
        command.env(name, value);
    }
    command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    command.kill_on_drop(true);

    let child = command
        .spawn()
        .with_context(|| format!("start service command `{command_line}`"))?;

    tracing::info!(
        pid = child.id(),
        command = command_line,
        "started service subprocess"
    );
    for (name, value) in extra_env {
        tracing::info!(env = %format!("{name}={value}"), "injected environment");
    }

    tokio::time::sleep(Duration::from_millis(config.service.startup_time_ms)).await;

    Ok(Some(ManagedService {
        child,
        command: command_line.to_owned(),
    }))
}

impl ManagedService {
    /// Terminates the subprocess: signal it, wait up to the grace period,
    /// then force-kill.
    pub async fn stop(mut self) {
        let pid = self.child.id();
        let _ = self.child.start_kill();

        match tokio::time::timeout(STOP_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?pid, %status, "service subprocess stopped");
            }
            Ok(Err(err)) => {
                tracing::warn!(?pid, "failed to reap service subprocess: {err}");
            }
            Err(_) => {
                tracing::warn!(
                    ?pid,
                    command = %self.command,
                    "service did not stop within grace period; killing"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::start_service;
    use crate::config::Config;

    fn config_with_command(command: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
[service]
name = "svc"
base_url = "http://127.0.0.1:0"
command = "{command}"
startup_time_ms = 50

[database]
type = "sqlite"
connection_string = "sqlite://test.db"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn empty_command_yields_no_handle() {
        let mut config = config_with_command("placeholder");
        config.service.command = String::new();
        let service = start_service(&config, &[]).await.unwrap();
        assert!(service.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawns_with_injected_environment_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("env.txt");
        let config = config_with_command(&format!("env > {}", marker.display()));

        let service = start_service(
            &config,
            &[(
                "SNAPSHOT_MOCK_URL".to_owned(),
                "http://127.0.0.1:9999".to_owned(),
            )],
        )
        .await
        .unwrap()
        .expect("command configured");

        let written = std::fs::read_to_string(&marker).unwrap();
        assert!(
            written.contains("SNAPSHOT_MOCK_URL=http://127.0.0.1:9999"),
            "missing injected env in: {written}"
        );

        service.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_a_long_running_command() {
        let config = config_with_command("sleep 60");
        let service = start_service(&config, &[])
            .await
            .unwrap()
            .expect("command configured");

        let started = std::time::Instant::now();
        service.stop().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
