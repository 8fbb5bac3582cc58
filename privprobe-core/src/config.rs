//! Scenario configuration.
//!
//! One immutable `ScenarioConfig` is loaded up front and handed to every
//! component; nothing in the harness mutates it after validation. Values
//! come from a TOML file, with a small set of `PRIVPROBE_*` environment
//! overrides for credentials and endpoints so config files never need to
//! carry secrets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

// ── Sections ─────────────────────────────────────────────────────────────

/// Connection endpoint for the database under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database the scenario runs in (created by `provision`).
    #[serde(default = "default_dbname")]
    pub dbname: String,
    /// Per-connection timeout for probes and polls.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Superuser credentials used only by provision/teardown and catalog polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database to connect to for CREATE/DROP DATABASE.
    #[serde(default = "default_maintenance_db")]
    pub maintenance_db: String,
}

/// One credentialed database identity used to execute probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    pub name: String,
    /// Login role; defaults to the actor name.
    #[serde(default)]
    pub user: Option<String>,
    pub password: String,
    /// Whether provisioning grants this actor the capability to invoke the
    /// operation under test.
    #[serde(default)]
    pub can_invoke: bool,
}

impl ActorConfig {
    pub fn login_user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.name)
    }
}

/// The relation the operation under test rewrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_schema")]
    pub schema: String,
    #[serde(default = "default_target_table")]
    pub table: String,
    /// Actor name that owns the schema and relation.
    pub owner: String,
    #[serde(default = "default_row_count")]
    pub row_count: i64,
    /// Storage density hint; low values force page splits under load.
    #[serde(default = "default_fillfactor")]
    pub fillfactor: u8,
}

impl TargetConfig {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Background write load driven against the target while the operation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Concurrent writer sessions.
    #[serde(default = "default_writers")]
    pub writers: u32,
    /// Upper bound on workload runtime.
    #[serde(default = "default_workload_duration_secs")]
    pub duration_secs: u64,
    /// Row-identifier domain [1, N] for uniform random single-row updates.
    #[serde(default = "default_row_count")]
    pub row_domain: i64,
}

impl WorkloadConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            writers: default_writers(),
            duration_secs: default_workload_duration_secs(),
            row_domain: default_row_count(),
        }
    }
}

/// The external operation under test and the artifacts it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Program invoked to run the operation (e.g. `pg_repack`).
    #[serde(default = "default_operation_program")]
    pub program: String,
    /// Extra flags appended after the connection/target arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extension installed by provisioning.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Schema the operation creates its transient artifacts in.
    #[serde(default = "default_artifact_schema")]
    pub artifact_schema: String,
    /// Role granted to `can_invoke` actors, when the extension gates
    /// invocation on role membership.
    #[serde(default)]
    pub capability_role: Option<String>,
    /// File the operation's stdout/stderr stream is captured to.
    #[serde(default = "default_sink")]
    pub sink: PathBuf,
    /// Grace period between SIGTERM and SIGKILL on termination.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl OperationConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            program: default_operation_program(),
            args: Vec::new(),
            extension: default_extension(),
            artifact_schema: default_artifact_schema(),
            capability_role: None,
            sink: default_sink(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// Poll cadence. Fixed interval, bounded attempts, no backoff: the latency
/// profile of the operation's phase transitions is flat, so backoff only
/// delays detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Persisted line-oriented run log; `None` disables the file sink.
    #[serde(default = "default_run_log")]
    pub run_log: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            run_log: default_run_log(),
        }
    }
}

/// Immutable top-level configuration for one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
    pub target: TargetConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub operation: OperationConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub log: LogSettings,
}

// ── Defaults ─────────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5432
}
fn default_dbname() -> String {
    "privprobe".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_admin_user() -> String {
    "postgres".to_string()
}
fn default_maintenance_db() -> String {
    "postgres".to_string()
}
fn default_target_schema() -> String {
    "app".to_string()
}
fn default_target_table() -> String {
    "accounts".to_string()
}
fn default_row_count() -> i64 {
    10_000_000
}
fn default_fillfactor() -> u8 {
    50
}
fn default_writers() -> u32 {
    2
}
fn default_workload_duration_secs() -> u64 {
    600
}
fn default_operation_program() -> String {
    "pg_repack".to_string()
}
fn default_extension() -> String {
    "pg_repack".to_string()
}
fn default_artifact_schema() -> String {
    "repack".to_string()
}
fn default_sink() -> PathBuf {
    PathBuf::from("privprobe-operation.log")
}
fn default_grace_period_secs() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_poll_max_attempts() -> u32 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_run_log() -> Option<PathBuf> {
    Some(PathBuf::from("privprobe-run.log"))
}

// ── Loading ──────────────────────────────────────────────────────────────

impl ScenarioConfig {
    /// Load from a TOML file, apply environment overrides, and validate.
    /// Non-fatal validation warnings are returned to the caller, which is
    /// responsible for surfacing them once logging is up.
    pub fn load(path: &Path) -> HarnessResult<(Self, Vec<String>)> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env_overrides();
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    pub fn from_toml(raw: &str) -> HarnessResult<Self> {
        toml::from_str(raw).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Credentials and endpoints may come from the environment so config
    /// files checked into a repo never carry secrets.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PRIVPROBE_DB_HOST") {
            self.database.host = host;
        }
        if let Ok(port) = std::env::var("PRIVPROBE_DB_PORT")
            && let Ok(port) = port.parse()
        {
            self.database.port = port;
        }
        if let Ok(password) = std::env::var("PRIVPROBE_ADMIN_PASSWORD") {
            self.admin.password = password;
        }
        if let Ok(program) = std::env::var("PRIVPROBE_OPERATION_PROGRAM") {
            self.operation.program = program;
        }
    }

    /// Structural validation. Hard errors abort startup; warnings are
    /// surfaced but non-fatal.
    pub fn validate(&self) -> HarnessResult<Vec<String>> {
        let mut warnings = Vec::new();

        if self.actors.is_empty() {
            return Err(HarnessError::Config("no actors configured".into()));
        }

        let owner = self
            .actors
            .iter()
            .find(|a| a.name == self.target.owner)
            .ok_or_else(|| {
                HarnessError::Config(format!(
                    "target owner '{}' is not a configured actor",
                    self.target.owner
                ))
            })?;
        if !owner.can_invoke {
            return Err(HarnessError::Config(format!(
                "target owner '{}' must have can_invoke = true",
                owner.name
            )));
        }
        if !self
            .actors
            .iter()
            .any(|a| a.can_invoke && a.name != self.target.owner)
        {
            return Err(HarnessError::Config(
                "scenario needs a capability-holding actor that is not the owner".into(),
            ));
        }
        if !self.actors.iter().any(|a| !a.can_invoke) {
            return Err(HarnessError::Config(
                "scenario needs a capability-lacking actor".into(),
            ));
        }

        if self.target.row_count < 1 {
            return Err(HarnessError::Config("target.row_count must be >= 1".into()));
        }
        if !(10..=100).contains(&self.target.fillfactor) {
            return Err(HarnessError::Config(
                "target.fillfactor must be in 10..=100".into(),
            ));
        }
        if self.workload.writers == 0 {
            return Err(HarnessError::Config("workload.writers must be >= 1".into()));
        }
        if self.polling.max_attempts == 0 {
            return Err(HarnessError::Config(
                "polling.max_attempts must be >= 1".into(),
            ));
        }

        if self.workload.row_domain > self.target.row_count {
            warnings.push(format!(
                "workload.row_domain ({}) exceeds target.row_count ({}); some updates will match no row",
                self.workload.row_domain, self.target.row_count
            ));
        }
        if self.workload.duration_secs < 10 {
            warnings.push(format!(
                "workload duration of {} is short; the operation may outlive the write load",
                humantime::format_duration(self.workload.duration()),
            ));
        }

        Ok(warnings)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [database]
            dbname = "isolation_test"

            [admin]
            user = "postgres"
            password = "pg"

            [[actors]]
            name = "a1"
            password = "s1"
            can_invoke = true

            [[actors]]
            name = "a2"
            password = "s2"
            can_invoke = true

            [[actors]]
            name = "a3"
            password = "s3"

            [target]
            owner = "a1"
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.database.host, "127.0.0.1");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.target.row_count, 10_000_000);
        assert_eq!(config.target.fillfactor, 50);
        assert_eq!(config.workload.writers, 2);
        assert_eq!(config.workload.duration_secs, 600);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.max_attempts, 60);
        assert_eq!(config.operation.artifact_schema, "repack");
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_target_qualified_name() {
        let config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.target.qualified_name(), "app.accounts");
    }

    #[test]
    fn test_actor_login_user_defaults_to_name() {
        let config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.actors[0].login_user(), "a1");
    }

    #[test]
    fn test_validation_rejects_missing_owner_actor() {
        let mut config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        config.target.owner = "nobody".to_string();
        assert!(matches!(
            config.validate(),
            Err(HarnessError::Config(msg)) if msg.contains("nobody")
        ));
    }

    #[test]
    fn test_validation_rejects_owner_without_capability() {
        let mut config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        config.actors[0].can_invoke = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_capability_lacking_actor() {
        let mut config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        config.actors[2].can_invoke = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_fillfactor() {
        let mut config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        config.target.fillfactor = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_warns_on_row_domain_overrun() {
        let mut config = ScenarioConfig::from_toml(minimal_toml()).unwrap();
        config.target.row_count = 1_000;
        config.workload.row_domain = 10_000;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("row_domain"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let (config, warnings) = ScenarioConfig::load(&path).unwrap();
        assert_eq!(config.database.dbname, "isolation_test");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_load_returns_warnings_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        let mut toml = minimal_toml().to_string();
        toml.push_str("row_count = 1000\n\n[workload]\nrow_domain = 10000\n");
        std::fs::write(&path, toml).unwrap();
        let (_, warnings) = ScenarioConfig::load(&path).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("row_domain"));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = ScenarioConfig::load(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
