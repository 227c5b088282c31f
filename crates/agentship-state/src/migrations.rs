//! SurrealDB schema migrations and initialization
//!
//! Defines every table with its unique constraints and lookup indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all agentship tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing agentship SurrealDB schema");

    init_agents_table(db).await?;
    init_deployments_table(db).await?;
    init_events_table(db).await?;
    init_artifacts_table(db).await?;

    info!("agentship schema initialization complete");
    Ok(())
}

/// Initialize `agents` table
///
/// Schema:
/// ```text
/// TABLE agents {
///   agent_id:          STRING (unique)
///   owner_id:          STRING (indexed)
///   name:              STRING
///   description:       STRING?
///   desired:           OBJECT?
///   active_deployment: STRING?
///   created_at:        DATETIME
///   updated_at:        DATETIME
///   terminated_at:     DATETIME?
/// }
/// ```
async fn init_agents_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agents table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agents SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_agent_id ON TABLE agents COLUMNS agent_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_agent_owner ON TABLE agents COLUMNS owner_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `deployments` table
///
/// Constraints:
/// - `deployment_id` is unique
/// - terminal rows are immutable (enforced via app logic)
async fn init_deployments_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing deployments table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS deployments SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_deployment_id ON TABLE deployments COLUMNS deployment_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_deployment_agent ON TABLE deployments COLUMNS agent_id;
        DEFINE INDEX IF NOT EXISTS idx_deployment_status ON TABLE deployments COLUMNS status;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `events` table
///
/// Constraints:
/// - `(deployment_id, seq)` is unique; this is what keeps sequences gap-free
///   and duplicate-free when two writers race
/// - rows are never updated or deleted
async fn init_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS events SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_event_seq ON TABLE events COLUMNS deployment_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_event_kind ON TABLE events COLUMNS kind;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `artifacts` table
///
/// Constraints:
/// - `hash` is unique (artifacts are immutable)
/// - `build_key` is indexed for cache lookups
async fn init_artifacts_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing artifacts table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_artifact_hash ON TABLE artifacts COLUMNS hash UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_build_key ON TABLE artifacts COLUMNS build_key;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
