//! Black-box privilege-isolation harness for online table-rewrite
//! operations.
//!
//! The harness provisions a target relation and three credentialed
//! actors, drives a concurrent write load, supervises the external
//! rewrite operation, polls the catalog for its phase transitions, and
//! probes the operation's transient artifacts (intermediate copy and
//! change log) from every actor in both the pre-commit and post-commit
//! windows. Each probe feeds one named test case; the aggregate verdict
//! is the run's exit code.

pub mod actor;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod poller;
pub mod probe;
pub mod provision;
pub mod report;
pub mod scenario;
pub mod supervisor;
pub mod workload;

pub use actor::{Actor, ActorRole, CredentialRegistry};
pub use config::ScenarioConfig;
pub use error::{HarnessError, HarnessResult};
pub use probe::ProbeOutcome;
pub use provision::Provisioner;
pub use report::ScenarioReport;
pub use scenario::{Phase, ScenarioRunner, Verdict, case_table};
