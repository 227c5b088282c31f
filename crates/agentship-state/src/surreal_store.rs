//! SurrealDB-backed catalog, deployment store and event log
//!
//! Uses the rows in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{AgentRow, ArtifactRow, DeploymentRow, EventRow};
use crate::storage_traits::{
    AgentId, AgentRecord, ArtifactCatalog, ArtifactRecord, ContentDigest, DeploymentId,
    DeploymentRecord, DeploymentStore, EventLog, EventRecord, OwnerId, StorageResult,
};

const DEFAULT_NAMESPACE: &str = "agentship";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".agentship/db";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "agentship")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "agentship")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// SurrealDB-backed implementation of [`ArtifactCatalog`], [`DeploymentStore`]
/// and [`EventLog`].
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealStore connected (in-memory)");
        Ok(store)
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    /// Connect to SurrealDB Cloud with credentials.
    pub async fn connect_cloud(config: &CloudConfig) -> crate::Result<Self> {
        use surrealdb::opt::auth::{Database, Root};

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(endpoint = %config.endpoint, "SurrealStore connected (cloud)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Order: cloud credentials, then `SURREALDB_URL`, then local
    /// persistence under `.agentship/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::connect_cloud(&config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let store = Self::connect(&url).await?;
            info!("SurrealStore connected ({})", url);
            return Ok(store);
        }

        std::fs::create_dir_all(LOCAL_DB_PATH)?;
        let url = format!("surrealkv://{LOCAL_DB_PATH}");
        info!(
            "No cloud config or SURREALDB_URL found, using local persistence: {}",
            url
        );
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn select_rows<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        key: &'static str,
        value: String,
    ) -> StorageResult<Vec<T>> {
        let mut res = self
            .db
            .query(sql)
            .bind((key, value))
            .await
            .map_err(backend)?;
        res.take(0).map_err(backend)
    }

    async fn fetch_deployment_row(&self, did: &str) -> StorageResult<DeploymentRow> {
        let rows: Vec<DeploymentRow> = self
            .select_rows(
                "SELECT * FROM deployments WHERE deployment_id = $did",
                "did",
                did.to_string(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::DeploymentNotFound {
                deployment_id: did.to_string(),
            })
    }
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_unique_violation(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

#[async_trait]
impl ArtifactCatalog for SurrealStore {
    async fn record(&self, artifact: &ArtifactRecord) -> StorageResult<ArtifactRecord> {
        let created: Result<Option<ArtifactRow>, _> = self
            .db
            .create("artifacts")
            .content(ArtifactRow::from_record(artifact))
            .await;
        match created {
            Ok(_) => {
                debug!(artifact = %artifact.hash.short(), "artifact recorded");
                Ok(artifact.clone())
            }
            // First record wins
            Err(e) if is_unique_violation(&e) => ArtifactCatalog::get(self, &artifact.hash).await,
            Err(e) => Err(backend(e)),
        }
    }

    async fn get(&self, hash: &ContentDigest) -> StorageResult<ArtifactRecord> {
        let rows: Vec<ArtifactRow> = self
            .select_rows(
                "SELECT * FROM artifacts WHERE hash = $hash",
                "hash",
                hash.as_str().to_string(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound {
                digest: hash.as_str().to_string(),
            })?
            .into_record()
    }

    async fn find_by_build_key(
        &self,
        build_key: &ContentDigest,
    ) -> StorageResult<Option<ArtifactRecord>> {
        let rows: Vec<ArtifactRow> = self
            .select_rows(
                "SELECT * FROM artifacts WHERE build_key = $key ORDER BY created_at ASC LIMIT 1",
                "key",
                build_key.as_str().to_string(),
            )
            .await?;
        rows.into_iter().next().map(ArtifactRow::into_record).transpose()
    }

    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM artifacts ORDER BY created_at DESC")
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ArtifactRow::into_record).collect()
    }
}

#[async_trait]
impl DeploymentStore for SurrealStore {
    async fn put_agent(&self, agent: &AgentRecord) -> StorageResult<()> {
        let row = AgentRow::from_record(agent)?;
        let existing: Vec<AgentRow> = self
            .select_rows(
                "SELECT * FROM agents WHERE agent_id = $aid",
                "aid",
                agent.agent_id.0.clone(),
            )
            .await?;

        if existing.is_empty() {
            let _created: Option<AgentRow> = self
                .db
                .create("agents")
                .content(row)
                .await
                .map_err(backend)?;
        } else {
            self.db
                .query("UPDATE agents CONTENT $row WHERE agent_id = $aid")
                .bind(("row", row))
                .bind(("aid", agent.agent_id.0.clone()))
                .await
                .map_err(backend)?
                .check()
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<AgentRecord> {
        let rows: Vec<AgentRow> = self
            .select_rows(
                "SELECT * FROM agents WHERE agent_id = $aid",
                "aid",
                agent_id.0.clone(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::AgentNotFound {
                agent_id: agent_id.0.clone(),
            })?
            .into_record()
    }

    async fn list_agents(&self, owner: Option<&OwnerId>) -> StorageResult<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = match owner {
            Some(owner) => {
                self.select_rows(
                    "SELECT * FROM agents WHERE owner_id = $owner ORDER BY created_at DESC",
                    "owner",
                    owner.0.clone(),
                )
                .await?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM agents ORDER BY created_at DESC")
                    .await
                    .map_err(backend)?;
                res.take(0).map_err(backend)?
            }
        };
        rows.into_iter().map(AgentRow::into_record).collect()
    }

    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()> {
        debug!(deployment_id = %deployment.deployment_id, "inserting deployment");
        let created: Result<Option<DeploymentRow>, _> = self
            .db
            .create("deployments")
            .content(DeploymentRow::from_record(deployment))
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateDeployment {
                deployment_id: deployment.deployment_id.0.clone(),
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()> {
        let current = self
            .fetch_deployment_row(&deployment.deployment_id.0)
            .await?
            .into_record()?;
        if current.status.is_terminal() {
            return Err(StorageError::ImmutableDeployment {
                deployment_id: current.deployment_id.0,
                status: current.status.as_str().to_string(),
            });
        }

        self.db
            .query("UPDATE deployments CONTENT $row WHERE deployment_id = $did")
            .bind(("row", DeploymentRow::from_record(deployment)))
            .bind(("did", deployment.deployment_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> StorageResult<DeploymentRecord> {
        self.fetch_deployment_row(&deployment_id.0)
            .await?
            .into_record()
    }

    async fn list_deployments(&self, agent_id: &AgentId) -> StorageResult<Vec<DeploymentRecord>> {
        let rows: Vec<DeploymentRow> = self
            .select_rows(
                "SELECT * FROM deployments WHERE agent_id = $aid ORDER BY created_at ASC",
                "aid",
                agent_id.0.clone(),
            )
            .await?;
        rows.into_iter().map(DeploymentRow::into_record).collect()
    }

    async fn list_live_deployments(&self) -> StorageResult<Vec<DeploymentRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM deployments \
                 WHERE status IN ['pending', 'building', 'launching', 'running'] \
                 ORDER BY created_at ASC",
            )
            .await
            .map_err(backend)?;
        let rows: Vec<DeploymentRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(DeploymentRow::into_record).collect()
    }
}

#[async_trait]
impl EventLog for SurrealStore {
    async fn append(&self, event: &EventRecord) -> StorageResult<()> {
        let created: Result<Option<EventRow>, _> = self
            .db
            .create("events")
            .content(EventRow::from_record(event))
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateEvent {
                deployment_id: event.deployment_id.0.clone(),
                seq: event.seq,
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn history(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> StorageResult<Vec<EventRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM events WHERE deployment_id = $did AND seq >= $from \
                 ORDER BY seq ASC",
            )
            .bind(("did", deployment_id.0.clone()))
            .bind(("from", from_seq))
            .await
            .map_err(backend)?;
        let rows: Vec<EventRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(EventRow::into_record).collect())
    }

    async fn last_seq(&self, deployment_id: &DeploymentId) -> StorageResult<u64> {
        let rows: Vec<EventRow> = self
            .select_rows(
                "SELECT * FROM events WHERE deployment_id = $did ORDER BY seq DESC LIMIT 1",
                "did",
                deployment_id.0.clone(),
            )
            .await?;
        Ok(rows.first().map(|r| r.seq).unwrap_or(0))
    }
}
