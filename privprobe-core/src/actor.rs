//! Credentialed actors and the connection registry.
//!
//! The registry resolves the three scenario roles from configuration and
//! owns connection-string construction. Probes always open fresh
//! connections; long-lived monitoring sessions go through `SessionCache`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::config::{DatabaseConfig, ScenarioConfig};
use crate::error::{HarnessError, HarnessResult};

// ── Actors ───────────────────────────────────────────────────────────────

/// Role an actor plays in the reference scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorRole {
    /// Owns the target relation and invokes the operation under test.
    Owner,
    /// Holds the invocation capability but does not own the target.
    Peer,
    /// Holds no invocation capability.
    Bystander,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Peer => write!(f, "peer"),
            Self::Bystander => write!(f, "bystander"),
        }
    }
}

/// A credentialed database identity, immutable for the harness run.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub user: String,
    pub password: String,
    pub can_invoke: bool,
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Holds per-actor connection parameters plus the admin identity used for
/// provisioning and catalog polls.
#[derive(Debug, Clone)]
pub struct CredentialRegistry {
    db: DatabaseConfig,
    actors: Vec<Actor>,
    owner_name: String,
    admin: Actor,
}

impl CredentialRegistry {
    pub fn from_config(config: &ScenarioConfig) -> HarnessResult<Self> {
        let actors: Vec<Actor> = config
            .actors
            .iter()
            .map(|a| Actor {
                name: a.name.clone(),
                user: a.login_user().to_string(),
                password: a.password.clone(),
                can_invoke: a.can_invoke,
            })
            .collect();

        if !actors.iter().any(|a| a.name == config.target.owner) {
            return Err(HarnessError::Config(format!(
                "owner actor '{}' not present in registry",
                config.target.owner
            )));
        }

        Ok(Self {
            db: config.database.clone(),
            actors,
            owner_name: config.target.owner.clone(),
            admin: Actor {
                name: "admin".to_string(),
                user: config.admin.user.clone(),
                password: config.admin.password.clone(),
                can_invoke: true,
            },
        })
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.db
    }

    pub fn admin(&self) -> &Actor {
        &self.admin
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn get(&self, name: &str) -> Option<&Actor> {
        self.actors.iter().find(|a| a.name == name)
    }

    /// Resolve a scenario role to its configured actor.
    pub fn by_role(&self, role: ActorRole) -> HarnessResult<&Actor> {
        let found = match role {
            ActorRole::Owner => self.get(&self.owner_name),
            ActorRole::Peer => self
                .actors
                .iter()
                .find(|a| a.can_invoke && a.name != self.owner_name),
            ActorRole::Bystander => self.actors.iter().find(|a| !a.can_invoke),
        };
        found.ok_or_else(|| HarnessError::Setup(format!("no actor fills the {role} role")))
    }

    /// Key/value connection string for one actor against one database.
    pub fn conn_string(&self, actor: &Actor, dbname: &str) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout={}",
            self.db.host,
            self.db.port,
            actor.user,
            actor.password,
            dbname,
            self.db.connect_timeout_secs,
        )
    }

    /// Open a session as `actor` against the scenario database.
    pub async fn connect(&self, actor: &Actor) -> Result<PgSession, tokio_postgres::Error> {
        self.connect_to(actor, &self.db.dbname).await
    }

    /// Open a session as `actor` against an arbitrary database (used by
    /// provisioning against the maintenance database).
    pub async fn connect_to(
        &self,
        actor: &Actor,
        dbname: &str,
    ) -> Result<PgSession, tokio_postgres::Error> {
        let conn_string = self.conn_string(actor, dbname);
        let (client, connection) = tokio_postgres::connect(&conn_string, NoTls).await?;
        let actor_name = actor.name.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection for actor {actor_name} closed: {e}");
            }
        });
        Ok(PgSession { client, driver })
    }
}

/// A live session plus its connection driver task. Dropping the session
/// closes the client and reaps the driver, so no path can leak a
/// connection.
pub struct PgSession {
    pub client: Client,
    driver: JoinHandle<()>,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ── Session cache ────────────────────────────────────────────────────────

/// Persistent per-actor sessions for polling. Probes deliberately bypass
/// this cache: a probe's connection outcome is part of its classification.
pub struct SessionCache {
    registry: Arc<CredentialRegistry>,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<PgSession>>>,
}

impl SessionCache {
    pub fn new(registry: Arc<CredentialRegistry>) -> Self {
        Self {
            registry,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_connect(&self, actor: &Actor) -> HarnessResult<Arc<PgSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&actor.name) {
            // A session that died mid-run is replaced rather than reused.
            if !session.client.is_closed() {
                return Ok(Arc::clone(session));
            }
            warn!("cached session for {} was closed; reconnecting", actor.name);
            sessions.remove(&actor.name);
        }
        let session = Arc::new(self.registry.connect(actor).await.map_err(|e| {
            HarnessError::Setup(format!("cannot connect as {}: {e}", actor.name))
        })?);
        sessions.insert(actor.name.clone(), Arc::clone(&session));
        Ok(session)
    }

    pub async fn close_all(&self) {
        self.sessions.lock().await.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;

    fn registry() -> CredentialRegistry {
        let config = ScenarioConfig::from_toml(
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
                user = "alt_login"
                password = "s2"
                can_invoke = true

                [[actors]]
                name = "a3"
                password = "s3"

                [target]
                owner = "a1"
            "#,
        )
        .unwrap();
        CredentialRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_role_resolution() {
        let registry = registry();
        assert_eq!(registry.by_role(ActorRole::Owner).unwrap().name, "a1");
        assert_eq!(registry.by_role(ActorRole::Peer).unwrap().name, "a2");
        assert_eq!(registry.by_role(ActorRole::Bystander).unwrap().name, "a3");
    }

    #[test]
    fn test_peer_is_never_the_owner() {
        let registry = registry();
        let peer = registry.by_role(ActorRole::Peer).unwrap();
        assert_ne!(peer.name, registry.by_role(ActorRole::Owner).unwrap().name);
        assert!(peer.can_invoke);
    }

    #[test]
    fn test_conn_string_uses_login_user() {
        let registry = registry();
        let peer = registry.by_role(ActorRole::Peer).unwrap();
        let conn = registry.conn_string(peer, "isolation_test");
        assert!(conn.contains("user=alt_login"));
        assert!(conn.contains("dbname=isolation_test"));
        assert!(conn.contains("connect_timeout=10"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(ActorRole::Owner.to_string(), "owner");
        assert_eq!(ActorRole::Peer.to_string(), "peer");
        assert_eq!(ActorRole::Bystander.to_string(), "bystander");
    }
}
