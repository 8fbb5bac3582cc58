//! Credentialed access probes.
//!
//! A probe opens a fresh connection as the given actor, attempts a bounded
//! read against one object, and classifies the outcome. The connection
//! attempt is part of the classification, which is why probes never reuse
//! cached sessions; the session is dropped on every exit path.

use std::sync::Arc;

use tokio_postgres::error::SqlState;
use tracing::debug;

use crate::actor::{Actor, CredentialRegistry};
use crate::catalog::ArtifactKind;

// ── Classification ───────────────────────────────────────────────────────

/// Classification of a credentialed read attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ProbeOutcome {
    /// The read succeeded; zero rows still counts as allowed.
    Allowed { rows: u64 },
    /// Connection, authorization, or permission failure.
    Denied {
        sqlstate: Option<String>,
        detail: String,
    },
    /// The object was not observable at evaluation time (not yet created,
    /// or already cleaned up). Feeds a skipped verdict, never a failure.
    Missing,
}

impl ProbeOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed { rows } => write!(f, "ALLOWED (rows={rows})"),
            Self::Denied { sqlstate, .. } => match sqlstate {
                Some(code) => write!(f, "DENIED ({code})"),
                None => write!(f, "DENIED"),
            },
            Self::Missing => write!(f, "MISSING"),
        }
    }
}

/// Map a database error to a probe outcome. Undefined objects are the one
/// family that means "not observable" rather than "refused".
fn classify_sqlstate(code: &SqlState, detail: String) -> ProbeOutcome {
    if *code == SqlState::UNDEFINED_TABLE
        || *code == SqlState::UNDEFINED_SCHEMA
        || *code == SqlState::UNDEFINED_OBJECT
    {
        return ProbeOutcome::Missing;
    }
    ProbeOutcome::Denied {
        sqlstate: Some(code.code().to_string()),
        detail,
    }
}

fn classify_error(err: &tokio_postgres::Error) -> ProbeOutcome {
    match err.code() {
        Some(code) => classify_sqlstate(code, err.to_string()),
        // No SQLSTATE: connection-level refusal (network, TLS, shutdown).
        None => ProbeOutcome::Denied {
            sqlstate: None,
            detail: err.to_string(),
        },
    }
}

// ── Metadata visibility ──────────────────────────────────────────────────

/// Catalog-level name visibility. Informational only: catalog rows are
/// world-readable in the engine under test, so `visible = true` is
/// expected and is not itself a security boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetadataVisibility {
    pub visible: bool,
    pub resolved: Option<String>,
}

// ── Probe ────────────────────────────────────────────────────────────────

/// Executes credentialed reads and metadata lookups.
pub struct AccessProbe {
    registry: Arc<CredentialRegistry>,
}

impl AccessProbe {
    pub fn new(registry: Arc<CredentialRegistry>) -> Self {
        Self { registry }
    }

    /// Attempt a bounded read (one row at most) against `object` as
    /// `actor` and classify the outcome. Never returns an error: every
    /// failure mode is part of the classification.
    pub async fn probe(&self, actor: &Actor, object: &str) -> ProbeOutcome {
        let session = match self.registry.connect(actor).await {
            Ok(session) => session,
            Err(e) => {
                debug!("probe connect as {} failed: {e}", actor.name);
                return classify_error(&e);
            }
        };

        let query = format!("SELECT 1 FROM {object} LIMIT 1");
        let outcome = match session.client.query(&query, &[]).await {
            Ok(rows) => ProbeOutcome::Allowed {
                rows: rows.len() as u64,
            },
            Err(e) => classify_error(&e),
        };
        drop(session);
        outcome
    }

    /// Check catalog-level name visibility of an artifact as `actor`.
    /// Failures degrade to "not visible" — this probe asserts nothing.
    pub async fn probe_metadata_visibility(
        &self,
        actor: &Actor,
        artifact_schema: &str,
        kind: ArtifactKind,
        target_oid: u32,
    ) -> MetadataVisibility {
        let session = match self.registry.connect(actor).await {
            Ok(session) => session,
            Err(e) => {
                debug!("metadata probe connect as {} failed: {e}", actor.name);
                return MetadataVisibility {
                    visible: false,
                    resolved: None,
                };
            }
        };

        let pattern = kind.name_pattern(target_oid);
        let resolved = session
            .client
            .query_opt(
                "SELECT n.nspname || '.' || c.relname \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname LIKE $2 \
                 ORDER BY c.relname LIMIT 1",
                &[&artifact_schema, &pattern],
            )
            .await
            .ok()
            .flatten()
            .map(|row| row.get::<_, String>(0));
        drop(session);

        MetadataVisibility {
            visible: resolved.is_some(),
            resolved,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
