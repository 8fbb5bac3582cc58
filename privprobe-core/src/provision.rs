//! Fixture provisioning and teardown.
//!
//! `provision` builds the whole scenario from a clean cluster: database,
//! login roles, extension, capability grants, target schema and relation,
//! and the seed data. `teardown` removes everything it created. Both are
//! idempotent so an aborted run never wedges the next one.

use std::sync::Arc;

use tracing::info;

use crate::actor::{Actor, CredentialRegistry, PgSession};
use crate::config::ScenarioConfig;
use crate::error::{HarnessError, HarnessResult};

// ── SQL quoting ──────────────────────────────────────────────────────────

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a literal, doubling embedded quotes.
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

// ── Statement builders ───────────────────────────────────────────────────

fn create_role_sql(actor: &Actor) -> String {
    format!(
        "CREATE ROLE {} LOGIN PASSWORD {}",
        quote_ident(&actor.user),
        quote_literal(&actor.password)
    )
}

fn create_table_sql(schema: &str, table: &str, fillfactor: u8) -> String {
    // Row identifiers are bigint end to end; the workload binds them as
    // such. A low fillfactor leaves page slack so concurrent updates stay
    // on-page during the copy.
    format!(
        "CREATE TABLE {}.{} (id bigint PRIMARY KEY, padding text) WITH (fillfactor = {fillfactor})",
        quote_ident(schema),
        quote_ident(table)
    )
}

fn seed_sql(schema: &str, table: &str) -> String {
    format!(
        "INSERT INTO {}.{} (id, padding) \
         SELECT g, md5(random()::text) FROM generate_series(1, $1::bigint) g",
        quote_ident(schema),
        quote_ident(table)
    )
}

// ── Provisioner ──────────────────────────────────────────────────────────

/// Builds and destroys the scenario fixtures with admin credentials.
pub struct Provisioner {
    config: ScenarioConfig,
    registry: Arc<CredentialRegistry>,
}

impl Provisioner {
    pub fn new(config: ScenarioConfig) -> HarnessResult<Self> {
        let registry = Arc::new(CredentialRegistry::from_config(&config)?);
        Ok(Self { config, registry })
    }

    async fn admin_session(&self, dbname: &str) -> HarnessResult<PgSession> {
        self.registry
            .connect_to(self.registry.admin(), dbname)
            .await
            .map_err(|e| {
                HarnessError::Setup(format!("cannot connect as admin to '{dbname}': {e}"))
            })
    }

    /// Provision the full scenario. Any pre-existing scenario database or
    /// actor roles are dropped first.
    pub async fn provision(&self) -> HarnessResult<()> {
        let dbname = &self.config.database.dbname;
        let maintenance = self.admin_session(&self.config.admin.maintenance_db).await?;

        // Database first so no role is still referenced by its objects.
        maintenance
            .client
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                quote_ident(dbname)
            ))
            .await?;
        for actor in self.registry.actors() {
            maintenance
                .client
                .batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_ident(&actor.user)))
                .await?;
            maintenance.client.batch_execute(&create_role_sql(actor)).await?;
            info!("role {} created", actor.user);
        }
        maintenance
            .client
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(dbname)))
            .await?;
        info!("database {dbname} created");
        drop(maintenance);

        let admin = self.admin_session(dbname).await?;
        admin
            .client
            .batch_execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {}",
                quote_ident(&self.config.operation.extension)
            ))
            .await?;
        info!("extension {} installed", self.config.operation.extension);

        // When the extension gates invocation on a role, membership is the
        // capability under test.
        if let Some(capability_role) = &self.config.operation.capability_role {
            for actor in self.registry.actors().iter().filter(|a| a.can_invoke) {
                admin
                    .client
                    .batch_execute(&format!(
                        "GRANT {} TO {}",
                        quote_ident(capability_role),
                        quote_ident(&actor.user)
                    ))
                    .await?;
                info!("granted {capability_role} to {}", actor.user);
            }
        }

        let target = &self.config.target;
        let owner = self
            .registry
            .get(&target.owner)
            .ok_or_else(|| HarnessError::Setup(format!("owner actor '{}' missing", target.owner)))?;
        admin
            .client
            .batch_execute(&format!(
                "CREATE SCHEMA {} AUTHORIZATION {}",
                quote_ident(&target.schema),
                quote_ident(&owner.user)
            ))
            .await?;
        drop(admin);

        // The table and its rows are created as the owner so ownership is
        // genuine rather than granted after the fact.
        let session = self.registry.connect(owner).await.map_err(|e| {
            HarnessError::Setup(format!("cannot connect as owner {}: {e}", owner.name))
        })?;
        session
            .client
            .batch_execute(&create_table_sql(&target.schema, &target.table, target.fillfactor))
            .await?;
        info!(
            "seeding {} with {} rows (fillfactor {})",
            target.qualified_name(),
            target.row_count,
            target.fillfactor
        );
        session
            .client
            .execute(&seed_sql(&target.schema, &target.table), &[&target.row_count])
            .await?;
        session.client.batch_execute("ANALYZE").await?;
        info!("provisioned {}", target.qualified_name());
        Ok(())
    }

    /// Drop the scenario database and every actor role.
    pub async fn teardown(&self) -> HarnessResult<()> {
        let maintenance = self.admin_session(&self.config.admin.maintenance_db).await?;
        maintenance
            .client
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                quote_ident(&self.config.database.dbname)
            ))
            .await?;
        for actor in self.registry.actors() {
            maintenance
                .client
                .batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_ident(&actor.user)))
                .await?;
        }
        info!("teardown complete: {} dropped", self.config.database.dbname);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("accounts"), "\"accounts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_doubles_embedded_quotes() {
        assert_eq!(quote_literal("s3cret"), "'s3cret'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_create_role_sql_quotes_credentials() {
        let actor = Actor {
            name: "a1".into(),
            user: "a1".into(),
            password: "p'w".into(),
            can_invoke: true,
        };
        assert_eq!(
            create_role_sql(&actor),
            "CREATE ROLE \"a1\" LOGIN PASSWORD 'p''w'"
        );
    }

    #[test]
    fn test_create_table_sql_carries_fillfactor() {
        let sql = create_table_sql("app", "accounts", 50);
        assert!(sql.contains("\"app\".\"accounts\""));
        assert!(sql.contains("id bigint PRIMARY KEY"));
        assert!(sql.contains("fillfactor = 50"));
    }

    #[test]
    fn test_seed_sql_is_parameterised() {
        let sql = seed_sql("app", "accounts");
        assert!(sql.contains("generate_series(1, $1::bigint)"));
        assert!(!sql.contains("10000000"));
    }
}
