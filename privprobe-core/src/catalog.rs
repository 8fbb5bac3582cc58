//! Transient-artifact naming and the catalog predicates the poller
//! composes.
//!
//! Phase detection is a best-effort approximation from outside: the
//! operation's real internal state machine is not introspectable, so
//! "change log visible + a matching backend actively writing" stands in for
//! the copy phase, and "intermediate copy visible" stands in for commit.
//! Neither signal is assumed to map 1:1 to the operation's internal phases.

use tokio_postgres::Client;

use crate::error::HarnessResult;
use crate::poller::PredicateOutcome;

// ── Artifact naming ──────────────────────────────────────────────────────

/// Side-effect objects created by the operation under test, named
/// deterministically from the target relation's OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// The rewritten copy of the target relation.
    IntermediateCopy,
    /// The change log capturing writes that land during the copy.
    ChangeLog,
}

impl ArtifactKind {
    fn stem(&self) -> &'static str {
        match self {
            Self::IntermediateCopy => "table",
            Self::ChangeLog => "log",
        }
    }

    /// Schema-qualified object name, e.g. `repack.log_16411`.
    pub fn object_name(&self, artifact_schema: &str, target_oid: u32) -> String {
        format!("{artifact_schema}.{}_{target_oid}", self.stem())
    }

    /// Bare relation name, e.g. `log_16411`.
    pub fn relation_name(&self, target_oid: u32) -> String {
        format!("{}_{target_oid}", self.stem())
    }

    /// LIKE pattern matching this artifact's relation name. The underscore
    /// is escaped so it matches literally.
    pub fn name_pattern(&self, target_oid: u32) -> String {
        format!("{}\\_{target_oid}", self.stem())
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IntermediateCopy => write!(f, "intermediate_copy"),
            Self::ChangeLog => write!(f, "change_log"),
        }
    }
}

// ── Catalog monitor ──────────────────────────────────────────────────────

/// Read-only catalog queries over a persistent admin session.
pub struct CatalogMonitor<'a> {
    client: &'a Client,
}

impl<'a> CatalogMonitor<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// OID of a relation, or `None` if it does not exist (or is not
    /// visible to the session).
    pub async fn relation_oid(&self, schema: &str, relation: &str) -> HarnessResult<Option<u32>> {
        let row = self
            .client
            .query_opt(
                "SELECT c.oid \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &relation],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, u32>(0)))
    }

    /// Whether an artifact has appeared in catalog metadata. Query errors
    /// degrade to `Unknown` so a transient catalog hiccup does not abort
    /// the poll.
    pub async fn artifact_visible(
        &self,
        artifact_schema: &str,
        kind: ArtifactKind,
        target_oid: u32,
    ) -> HarnessResult<PredicateOutcome> {
        let relation = kind.relation_name(target_oid);
        match self
            .client
            .query_one(
                "SELECT EXISTS (\
                     SELECT 1 FROM pg_catalog.pg_class c \
                     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                     WHERE n.nspname = $1 AND c.relname = $2)",
                &[&artifact_schema, &relation],
            )
            .await
        {
            Ok(row) => {
                if row.get::<_, bool>(0) {
                    Ok(PredicateOutcome::Satisfied)
                } else {
                    Ok(PredicateOutcome::NotYet)
                }
            }
            Err(e) if e.is_closed() => Err(e.into()),
            Err(e) => {
                tracing::debug!("artifact visibility query failed, treating as unknown: {e}");
                Ok(PredicateOutcome::Unknown)
            }
        }
    }

    /// Whether some backend is actively writing into the intermediate
    /// copy. Combined with change-log visibility this approximates "copy
    /// phase in progress".
    pub async fn copy_write_active(
        &self,
        artifact_schema: &str,
        target_oid: u32,
    ) -> HarnessResult<bool> {
        let pattern = format!(
            "%{artifact_schema}.{}%",
            ArtifactKind::IntermediateCopy.name_pattern(target_oid)
        );
        let row = self
            .client
            .query_one(
                "SELECT count(*) \
                 FROM pg_catalog.pg_stat_activity \
                 WHERE state = 'active' \
                   AND pid <> pg_backend_pid() \
                   AND query LIKE $1",
                &[&pattern],
            )
            .await?;
        Ok(row.get::<_, i64>(0) > 0)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_object_names_derive_from_oid() {
        assert_eq!(
            ArtifactKind::IntermediateCopy.object_name("repack", 16411),
            "repack.table_16411"
        );
        assert_eq!(
            ArtifactKind::ChangeLog.object_name("repack", 16411),
            "repack.log_16411"
        );
    }

    #[test]
    fn test_name_pattern_escapes_underscore() {
        assert_eq!(
            ArtifactKind::ChangeLog.name_pattern(42),
            "log\\_42"
        );
        assert_eq!(
            ArtifactKind::IntermediateCopy.name_pattern(42),
            "table\\_42"
        );
    }

    #[test]
    fn test_artifact_kind_display() {
        assert_eq!(
            ArtifactKind::IntermediateCopy.to_string(),
            "intermediate_copy"
        );
        assert_eq!(ArtifactKind::ChangeLog.to_string(), "change_log");
    }
}
