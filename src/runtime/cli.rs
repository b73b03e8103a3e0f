//! Privileged strategy: the Docker CLI, optionally behind sudo
//!
//! Used when the daemon socket is only reachable with elevated privilege.
//! Every invocation is bounded by a timeout and killed if it overruns.

use super::{ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, StartedContainer};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Seconds `timeout(1)` waits after SIGTERM before sending SIGKILL
const TIMEOUT_KILL_GRACE_SECS: u64 = 5;

/// Privilege escalation wrapper settings
#[derive(Clone)]
pub struct SudoConfig {
    pub path: String,
    /// Written to the wrapper's stdin; `None` means non-interactive mode
    pub password: Option<String>,
}

pub struct CliRuntime {
    config: RuntimeConfig,
    sudo: Option<SudoConfig>,
}

impl CliRuntime {
    pub fn new(config: RuntimeConfig, sudo: Option<SudoConfig>) -> Self {
        Self { config, sudo }
    }

    /// Full argv for a docker invocation, including the wrapper if any.
    ///
    /// Under sudo the CLI also runs under `timeout(1)`: killing `sudo` on
    /// overrun does not reach its privileged child.
    fn argv(&self, args: &[String], timeout: Duration) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 8);
        if let Some(sudo) = &self.sudo {
            argv.push(sudo.path.clone());
            if sudo.password.is_some() {
                // Read the password from stdin, no prompt text
                argv.extend(["-S".to_string(), "-p".to_string(), String::new()]);
            } else {
                argv.push("-n".to_string());
            }
            argv.extend([
                self.config.timeout_path.clone(),
                "-k".to_string(),
                format!("{}s", TIMEOUT_KILL_GRACE_SECS),
                format!("{}s", timeout.as_secs().max(1)),
            ]);
        }
        argv.push(self.config.cli_path.clone());
        argv.extend(args.iter().cloned());
        argv
    }

    async fn run(&self, args: Vec<String>, timeout: Duration) -> Result<Output, RuntimeError> {
        let argv = self.argv(&args, timeout);
        let rendered = shell_words::join(&argv);
        debug!(command = %rendered, "Running container CLI");

        let password = self.sudo.as_ref().and_then(|s| s.password.clone());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if password.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Unavailable(format!("failed to launch '{}': {}", argv[0], e))
        })?;

        if let (Some(password), Some(mut stdin)) = (password, child.stdin.take()) {
            stdin
                .write_all(format!("{}\n", password).as_bytes())
                .await
                .map_err(|e| RuntimeError::Command(format!("failed to write to sudo: {}", e)))?;
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| RuntimeError::Command(format!("{} failed: {}", rendered, e)))?,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    operation: rendered,
                    timeout,
                })
            }
        };

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&stderr, &args))
        }
    }

    fn stop_wait(&self) -> Duration {
        self.config.stop_timeout() + Duration::from_secs(10)
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn strategy(&self) -> &'static str {
        if self.sudo.is_some() {
            "privileged-cli"
        } else {
            "cli"
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling image");
        self.run(
            vec!["pull".to_string(), image.to_string()],
            self.config.pull_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<StartedContainer, RuntimeError> {
        let output = self.run(run_args(spec), self.config.start_timeout()).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let container_id = container_id_from_output(&stdout).ok_or_else(|| {
            RuntimeError::Command(format!(
                "could not read container id from output: {}",
                stdout.trim()
            ))
        })?;

        info!(container_id, name = %spec.name, port = spec.host_port, "Started container");
        Ok(StartedContainer {
            container_id,
            port: spec.host_port,
            status: "running".to_string(),
        })
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.config.stop_timeout_secs.to_string(),
            container.to_string(),
        ];
        match self.run(args, self.stop_wait()).await {
            Ok(_) => {
                info!(container, "Stopped container");
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        let args = vec!["rm".to_string(), "-f".to_string(), container.to_string()];
        match self.run(args, self.stop_wait()).await {
            Ok(_) | Err(RuntimeError::NotFound(_)) => {
                debug!(container, "Removed container");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            container.to_string(),
        ];
        let output = self.run(args, self.config.inspect_timeout()).await?;
        parse_inspect(&String::from_utf8_lossy(&output.stdout), container)
    }

    async fn logs(&self, container: &str, tail: usize) -> Result<String, RuntimeError> {
        let args = vec![
            "logs".to_string(),
            "--timestamps".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container.to_string(),
        ];
        let output = self.run(args, self.config.inspect_timeout()).await?;
        Ok(merge_log_streams(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            tail,
        ))
    }

    async fn list_bound_host_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        let args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Ports}}".to_string(),
        ];
        let output = self.run(args, self.config.inspect_timeout()).await?;
        Ok(parse_published_ports(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn purge_path(&self, path: &Path) -> Result<(), RuntimeError> {
        let (parent, name) = super::docker::purge_target(path)?;
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/purge", parent),
            self.config.helper_image.clone(),
            "rm".to_string(),
            "-rf".to_string(),
            "--".to_string(),
            format!("/purge/{}", name),
        ];
        self.run(args, self.config.start_timeout()).await?;
        info!(path = %path.display(), "Purged directory via helper container");
        Ok(())
    }
}

/// Arguments for `docker run` creating one app container
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        "-p".to_string(),
        format!("{}:{}:{}", spec.host_ip, spec.host_port, spec.internal_port),
        "-v".to_string(),
        format!("{}:{}", spec.source_dir.display(), spec.workdir),
        "-w".to_string(),
        spec.workdir.clone(),
    ];
    for var in &spec.env {
        args.push("-e".to_string());
        args.push(var.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(spec.image.clone());
    args.extend(spec.shell_command());
    args
}

fn classify_failure(stderr: &str, args: &[String]) -> RuntimeError {
    let message = stderr.trim();
    let lower = message.to_lowercase();

    if lower.contains("no such container") || lower.contains("no such object") {
        let target = args.last().cloned().unwrap_or_default();
        RuntimeError::NotFound(target)
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("permission denied while trying to connect")
        || lower.contains("a password is required")
        || lower.contains("incorrect password")
    {
        RuntimeError::Unavailable(message.to_string())
    } else {
        let op = args.first().map(String::as_str).unwrap_or("docker");
        RuntimeError::Command(format!("docker {}: {}", op, message))
    }
}

/// `docker run -d` prints the id last, after any pull progress
fn container_id_from_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
}

fn parse_inspect(json: &str, container: &str) -> Result<ContainerState, RuntimeError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| RuntimeError::Command(format!("unreadable inspect output: {}", e)))?;

    let info = value
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;

    let state = &info["State"];
    let text = |v: &serde_json::Value| v.as_str().map(str::to_string);

    let host_port = first_host_port(&info["NetworkSettings"]["Ports"])
        .or_else(|| first_host_port(&info["HostConfig"]["PortBindings"]));

    Ok(ContainerState {
        id: text(&info["Id"]).unwrap_or_default(),
        running: state["Running"].as_bool().unwrap_or(false),
        status: text(&state["Status"]).unwrap_or_else(|| "unknown".to_string()),
        started_at: text(&state["StartedAt"]),
        finished_at: text(&state["FinishedAt"]),
        host_port,
    })
}

fn first_host_port(ports: &serde_json::Value) -> Option<u16> {
    ports
        .as_object()?
        .values()
        .filter_map(|bindings| bindings.as_array())
        .flatten()
        .filter_map(|b| b["HostPort"].as_str())
        .find_map(|p| p.parse().ok())
}

/// Host ports from `docker ps --format '{{.Ports}}'` output.
///
/// Accepts entries like `127.0.0.1:3100->3000/tcp`, `:::3100->3000/tcp` and
/// ranges like `0.0.0.0:8000-8002->8000-8002/tcp`; unpublished entries such as
/// `3000/tcp` are skipped.
pub fn parse_published_ports(output: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();

    for entry in output.lines().flat_map(|l| l.split(',')) {
        let Some((host, _)) = entry.trim().split_once("->") else {
            continue;
        };
        let port_part = host.rsplit_once(':').map(|(_, p)| p).unwrap_or(host);

        match port_part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u16>(), end.parse::<u16>()) {
                    ports.extend(start..=end);
                }
            }
            None => {
                if let Ok(port) = port_part.parse::<u16>() {
                    ports.insert(port);
                }
            }
        }
    }

    ports
}

/// Interleave stdout and stderr lines by their timestamp prefix, keeping the
/// last `tail` lines. Lines without a timestamp inherit the previous one.
fn merge_log_streams(stdout: &str, stderr: &str, tail: usize) -> String {
    fn stamped(stream: &str) -> Vec<(Option<DateTime<Utc>>, &str)> {
        let mut last = None;
        stream
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let ts = line
                    .split_once(' ')
                    .and_then(|(ts, _)| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| ts.with_timezone(&Utc));
                if ts.is_some() {
                    last = ts;
                }
                (last, line)
            })
            .collect()
    }

    let mut lines = stamped(stdout);
    lines.extend(stamped(stderr));
    lines.sort_by_key(|(ts, _)| *ts);

    let skip = lines.len().saturating_sub(tail);
    let mut out = String::new();
    for (_, line) in lines.into_iter().skip(skip) {
        out.push_str(line);
        out.push('\n');
    }
    out
}
