//! Supervision of the external operation under test.
//!
//! The operation runs as a detached child process bound to one actor and
//! one target relation. Its line-oriented output stream is pumped into a
//! timestamped sink file. Termination escalates SIGTERM → grace period →
//! SIGKILL, mirroring how the harness would be torn down by hand.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::Actor;
use crate::config::{DatabaseConfig, OperationConfig};
use crate::error::{HarnessError, HarnessResult};

// ── Invocation spec ──────────────────────────────────────────────────────

/// Fully-resolved invocation of the operation-under-test CLI.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Password handed to the child via the environment, never argv.
    pub password: String,
    pub sink: PathBuf,
    pub grace_period: Duration,
}

impl OperationSpec {
    /// Build the invocation for one actor and one target relation.
    pub fn build(
        db: &DatabaseConfig,
        operation: &OperationConfig,
        actor: &Actor,
        target: &str,
    ) -> Self {
        let mut args = vec![
            "--host".to_string(),
            db.host.clone(),
            "--port".to_string(),
            db.port.to_string(),
            "--dbname".to_string(),
            db.dbname.clone(),
            "--username".to_string(),
            actor.user.clone(),
            "--table".to_string(),
            target.to_string(),
        ];
        args.extend(operation.args.iter().cloned());
        Self {
            program: operation.program.clone(),
            args,
            password: actor.password.clone(),
            sink: operation.sink.clone(),
            grace_period: operation.grace_period(),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────

/// Launches the operation and exposes liveness + termination.
#[derive(Debug)]
pub struct OperationSupervisor {
    child: Child,
    pid: u32,
    grace_period: Duration,
    pumps: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl OperationSupervisor {
    /// Spawn the operation with stdout/stderr captured to the sink file.
    pub fn spawn(spec: &OperationSpec) -> HarnessResult<Self> {
        if let Some(parent) = spec.sink.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let sink = Arc::new(Mutex::new(BufWriter::new(File::create(&spec.sink)?)));

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .env("PGPASSWORD", &spec.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                HarnessError::Setup(format!("cannot launch '{}': {e}", spec.program))
            })?;

        let pid = child.id().ok_or_else(|| {
            HarnessError::Setup(format!("'{}' exited before it could be observed", spec.program))
        })?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump("stdout", stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump("stderr", stderr, Arc::clone(&sink)));
        }

        info!(
            "operation launched: {} (pid {pid}), sink {}",
            spec.program,
            spec.sink.display()
        );
        Ok(Self {
            child,
            pid,
            grace_period: spec.grace_period,
            pumps,
            exit_status: None,
        })
    }

    /// Whether the operation is still running. Non-blocking.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                warn!("liveness check on pid {} failed: {e}", self.pid);
                false
            }
        }
    }

    /// Exit status, if the operation has finished.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait().ok().flatten();
        }
        self.exit_status
    }

    /// Wait up to `timeout` for a natural exit.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("wait on pid {} failed: {e}", self.pid);
                None
            }
            Err(_) => None,
        }
    }

    /// Terminate the operation. Graceful sends SIGTERM and polls liveness
    /// through the configured grace period before escalating to SIGKILL;
    /// forced goes straight to SIGKILL.
    pub async fn terminate(&mut self, graceful: bool) {
        if !self.is_alive() {
            self.drain_pumps().await;
            return;
        }

        if graceful {
            send_signal(self.pid, false);
            let grace_end = Instant::now() + self.grace_period;
            while Instant::now() < grace_end {
                if !self.is_alive() {
                    info!("operation (pid {}) exited after SIGTERM", self.pid);
                    self.drain_pumps().await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            warn!(
                "operation (pid {}) survived {:?} grace period, escalating",
                self.pid, self.grace_period
            );
        }

        if let Err(e) = self.child.kill().await {
            warn!("SIGKILL of pid {} failed: {e}", self.pid);
        }
        self.exit_status = self.child.try_wait().ok().flatten();
        self.drain_pumps().await;
    }

    async fn drain_pumps(&mut self) {
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
    }
}

fn spawn_pump<R>(stream: &'static str, reader: R, sink: Arc<Mutex<BufWriter<File>>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "operation", "{stream}: {line}");
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            if let Ok(mut sink) = sink.lock() {
                let _ = writeln!(sink, "{stamp} [{stream}] {line}");
                let _ = sink.flush();
            }
        }
    })
}

/// Signal via the `kill` binary; keeps the crate free of unsafe code.
fn send_signal(pid: u32, force: bool) -> bool {
    let signal = if force { "KILL" } else { "TERM" };
    match std::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .output()
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!("failed to send {signal} to pid {pid}: {e}");
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper_spec(sink: &Path, secs: u32) -> OperationSpec {
        OperationSpec {
            program: "sleep".to_string(),
            args: vec![secs.to_string()],
            password: String::new(),
            sink: sink.to_path_buf(),
            grace_period: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_spec_build_includes_connection_and_target() {
        let db = DatabaseConfig {
            host: "10.0.0.5".into(),
            port: 5433,
            dbname: "isolation_test".into(),
            connect_timeout_secs: 10,
        };
        let operation = OperationConfig {
            args: vec!["--no-order".into()],
            ..OperationConfig::default()
        };
        let actor = Actor {
            name: "a1".into(),
            user: "a1".into(),
            password: "s1".into(),
            can_invoke: true,
        };
        let spec = OperationSpec::build(&db, &operation, &actor, "app.accounts");
        assert_eq!(spec.program, "pg_repack");
        let joined = spec.args.join(" ");
        assert!(joined.contains("--host 10.0.0.5"));
        assert!(joined.contains("--port 5433"));
        assert!(joined.contains("--dbname isolation_test"));
        assert!(joined.contains("--username a1"));
        assert!(joined.contains("--table app.accounts"));
        assert!(joined.ends_with("--no-order"));
        assert_eq!(spec.password, "s1");
    }

    #[tokio::test]
    async fn test_liveness_and_forced_termination() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let mut supervisor = OperationSupervisor::spawn(&sleeper_spec(&sink, 30)).unwrap();
        assert!(supervisor.is_alive());
        supervisor.terminate(false).await;
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn test_graceful_termination_within_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let mut supervisor = OperationSupervisor::spawn(&sleeper_spec(&sink, 30)).unwrap();
        supervisor.terminate(true).await;
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn test_sigterm_immune_child_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let spec = OperationSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
            password: String::new(),
            sink,
            grace_period: Duration::from_secs(1),
        };
        let mut supervisor = OperationSupervisor::spawn(&spec).unwrap();
        assert!(supervisor.is_alive());
        supervisor.terminate(true).await;
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn test_natural_exit_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let mut supervisor = OperationSupervisor::spawn(&sleeper_spec(&sink, 0)).unwrap();
        let status = supervisor.wait_with_timeout(Duration::from_secs(5)).await;
        assert!(status.is_some_and(|s| s.success()));
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn test_output_is_captured_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let spec = OperationSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo copy phase starting".to_string()],
            password: String::new(),
            sink: sink.clone(),
            grace_period: Duration::from_secs(1),
        };
        let mut supervisor = OperationSupervisor::spawn(&spec).unwrap();
        supervisor.wait_with_timeout(Duration::from_secs(5)).await;
        supervisor.terminate(false).await;
        let captured = std::fs::read_to_string(&sink).unwrap();
        assert!(captured.contains("copy phase starting"));
        assert!(captured.contains("[stdout]"));
    }

    #[tokio::test]
    async fn test_missing_program_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("operation.log");
        let spec = OperationSpec {
            program: "definitely-not-a-real-binary".to_string(),
            args: vec![],
            password: String::new(),
            sink,
            grace_period: Duration::from_secs(1),
        };
        let err = OperationSupervisor::spawn(&spec).unwrap_err();
        assert!(matches!(err, HarnessError::Setup(_)));
    }
}
