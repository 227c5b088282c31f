//! agentship - deploy and supervise agent workloads
//!
//! ## Commands
//!
//! - `snapshot`: store a source directory, print its digest
//! - `deploy`: build, launch and supervise an agent in the foreground
//! - `scale`: roll out the agent's current source with new limits
//! - `status` / `events`: inspect one deployment
//! - `cancel` / `terminate`: stop a deployment or a whole agent
//! - `agents` / `history` / `artifacts`: list persisted state

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use agentship_build::{BuildConfig, BuildEngine, SourceSnapshot};
use agentship_core::telemetry::init_tracing;
use agentship_core::{
    ends_deployment, CancelOutcome, Controller, ControllerConfig, ControllerError,
    DeploymentRequest, ProcessBackend,
};
use agentship_state::{
    AgentId, ArtifactCatalog, ContentDigest, DeploymentId, DeploymentRecord, DeploymentStatus,
    EventRecord, FsCasStore, OwnerId, ResourceLimits, SurrealStore,
};

#[derive(Parser)]
#[command(name = "agentship")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, deploy and supervise AI agent workloads", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Content-addressed blob directory
    #[arg(long, global = true, env = "AGENTSHIP_CAS_DIR", default_value = ".agentship/cas")]
    cas_dir: PathBuf,

    /// Owner identity attached to requests
    #[arg(long, global = true, env = "AGENTSHIP_OWNER", default_value = "local")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a source directory and print its digest
    Snapshot {
        /// Directory holding the agent's source
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Deploy an agent and supervise it until Ctrl-C
    Deploy {
        /// Source directory, or digest of a stored snapshot
        #[arg(default_value = ".")]
        source: String,

        /// Framework hint (langgraph, langchain, crewai, autogpt, custom)
        #[arg(short, long)]
        framework: String,

        /// Existing agent id (a new agent is created when omitted)
        #[arg(short, long)]
        agent: Option<String>,

        /// Display name for a new agent
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        limits: LimitArgs,

        /// Environment variables passed to the agent (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_env_var)]
        env: Vec<(String, String)>,
    },

    /// Redeploy the agent's current source with new limits
    Scale {
        /// Agent id
        agent: String,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Show the status of a deployment
    Status {
        deployment: String,

        /// Print the full record as JSON
        #[arg(long = "as-json")]
        as_json: bool,
    },

    /// Print the events of a deployment
    Events {
        deployment: String,

        /// First sequence number to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Keep printing new events until the deployment ends
        #[arg(short, long)]
        follow: bool,
    },

    /// Cancel a deployment
    Cancel { deployment: String },

    /// Tear down everything an agent runs and retire the agent
    Terminate { agent: String },

    /// List agents
    Agents {
        /// Only agents in this state (idle, serving, terminated)
        #[arg(long)]
        status: Option<String>,

        /// Agents of every owner
        #[arg(long)]
        all: bool,
    },

    /// List the deployments of an agent, oldest first
    History { agent: String },

    /// List built artifacts, newest first
    Artifacts,
}

#[derive(clap::Args, Clone, Copy)]
struct LimitArgs {
    /// Memory ceiling in MiB
    #[arg(long, default_value = "512")]
    memory_mb: u32,

    /// CPU quota in millicores
    #[arg(long, default_value = "1000")]
    cpu_millis: u32,

    /// Number of instances
    #[arg(long, default_value = "1")]
    replicas: u32,
}

impl From<LimitArgs> for ResourceLimits {
    fn from(args: LimitArgs) -> Self {
        ResourceLimits {
            memory_mb: args.memory_mb,
            cpu_millis: args.cpu_millis,
            replicas: args.replicas.max(1),
        }
    }
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    #[serde(flatten)]
    deployment: &'a DeploymentRecord,
    active: bool,
    last_seq: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let owner = OwnerId(cli.owner.clone());
    match cli.command {
        Commands::Snapshot { ref path } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let digest = submit_dir(&ctx.builder, path).await?;
            println!("{digest}");
            Ok(())
        }
        Commands::Deploy {
            ref source,
            ref framework,
            ref agent,
            ref name,
            limits,
            ref env,
        } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let controller = ctx.supervisor().await?;
            let source = resolve_source(&ctx.builder, source).await?;
            let agent_id = agent
                .clone()
                .map(AgentId)
                .unwrap_or_else(AgentId::generate);
            let mut request = DeploymentRequest::new(agent_id, owner, source, framework.clone())
                .with_limits(limits.into())
                .with_env(env.iter().cloned().collect::<BTreeMap<_, _>>());
            if let Some(name) = name {
                request = request.with_name(name.clone());
            }
            let id = controller.request_deployment(request).await?;
            println!("Deployment {id} requested");
            supervise(&controller, &id).await
        }
        Commands::Scale { ref agent, limits } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let controller = ctx.supervisor().await?;
            let id = controller
                .scale(&AgentId(agent.clone()), limits.into())
                .await?;
            println!("Deployment {id} requested");
            supervise(&controller, &id).await
        }
        Commands::Status {
            ref deployment,
            as_json,
        } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            cmd_status(&ctx.inspector(), deployment, as_json).await
        }
        Commands::Events {
            ref deployment,
            from,
            follow,
        } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            cmd_events(&ctx.inspector(), deployment, from, follow).await
        }
        Commands::Cancel { ref deployment } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let id = DeploymentId(deployment.clone());
            match ctx.inspector().cancel_deployment(&id).await? {
                CancelOutcome::Cancelled => println!("Deployment {id} cancelled"),
                CancelOutcome::AlreadyFinal(status) => {
                    println!("Deployment {id} already {status}")
                }
            }
            Ok(())
        }
        Commands::Terminate { ref agent } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let record = ctx
                .inspector()
                .terminate_agent(&AgentId(agent.clone()))
                .await?;
            println!("Agent {} terminated", record.agent_id);
            Ok(())
        }
        Commands::Agents { ref status, all } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            let filter = if all { None } else { Some(&owner) };
            cmd_agents(&ctx.inspector(), filter, status.as_deref()).await
        }
        Commands::History { ref agent } => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            cmd_history(&ctx.inspector(), &AgentId(agent.clone())).await
        }
        Commands::Artifacts => {
            let ctx = Workspace::open(&cli.cas_dir).await?;
            cmd_artifacts(&ctx.builder).await
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Stores and engines shared by every command.
struct Workspace {
    store: SurrealStore,
    cas: Arc<FsCasStore>,
    builder: BuildEngine,
}

impl Workspace {
    async fn open(cas_dir: &Path) -> Result<Self> {
        let store = SurrealStore::from_env()
            .await
            .context("Failed to connect to agentship database")?;
        let cas = Arc::new(
            FsCasStore::new(cas_dir)
                .with_context(|| format!("Failed to open blob store at {}", cas_dir.display()))?,
        );
        let builder = BuildEngine::new(cas.clone(), Arc::new(store.clone()))
            .with_config(BuildConfig::from_env());
        Ok(Self {
            store,
            cas,
            builder,
        })
    }

    /// Controller that owns the local process backend. Reconciles first, so
    /// deployments left behind by an earlier run are settled.
    async fn supervisor(&self) -> Result<Controller> {
        let controller = Controller::start(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            self.builder.clone(),
            Arc::new(ProcessBackend::new(self.cas.clone())),
            ControllerConfig::from_env(),
        )
        .await
        .context("Failed to reconcile persisted deployments")?;
        Ok(controller)
    }

    /// Controller for reading and stopping state; does not reconcile, so
    /// deployments supervised by another process are left alone.
    fn inspector(&self) -> Controller {
        Controller::new(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            self.builder.clone(),
            Arc::new(ProcessBackend::new(self.cas.clone())),
            ControllerConfig::from_env(),
        )
    }
}

async fn submit_dir(builder: &BuildEngine, path: &Path) -> Result<ContentDigest> {
    let snapshot = SourceSnapshot::from_dir(path)
        .with_context(|| format!("Failed to read source directory {}", path.display()))?;
    if snapshot.is_empty() {
        bail!("{} contains no files", path.display());
    }
    let digest = builder.submit_snapshot(&snapshot).await?;
    info!(files = snapshot.len(), digest = %digest, "source snapshot stored");
    Ok(digest)
}

/// A directory is snapshotted; anything else must be a stored digest.
async fn resolve_source(builder: &BuildEngine, source: &str) -> Result<ContentDigest> {
    let path = Path::new(source);
    if path.is_dir() {
        return submit_dir(builder, path).await;
    }
    ContentDigest::try_from(source.to_string())
        .map_err(|e| anyhow!("{source} is neither a directory nor a source digest: {e}"))
}

fn parse_env_var(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// Follow a rollout, keep the deployment monitored once it serves, and
/// cancel it on Ctrl-C.
async fn supervise(controller: &Controller, id: &DeploymentId) -> Result<()> {
    let mut events = controller.stream_events(id, 1).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let stop = CancellationToken::new();
    let mut monitor = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Stopping deployment {id}...");
                stop.cancel();
                controller.cancel_deployment(id).await?;
                break;
            }
            next = events.next() => {
                let Some(event) = next else { break };
                let event = event?;
                print_event(&event);
                if event.kind == "promoted" && monitor.is_none() {
                    println!("Deployment {id} is serving. Press Ctrl-C to stop.");
                    monitor = Some(controller.spawn_monitor(stop.clone()));
                }
                if ends_deployment(&event) {
                    stop.cancel();
                    break;
                }
            }
        }
    }
    if let Some(monitor) = monitor {
        monitor.await.context("monitor task panicked")?;
    }

    let record = controller.status(id).await?.deployment;
    outcome(&record)
}

fn outcome(record: &DeploymentRecord) -> Result<()> {
    match record.status {
        DeploymentStatus::Failed => Err(ControllerError::from_failed(record)
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("deployment {} failed", record.deployment_id))),
        DeploymentStatus::RolledBack => bail!(
            "deployment {} rolled back: {}",
            record.deployment_id,
            record.failure_reason.as_deref().unwrap_or("runtime crash")
        ),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn cmd_status(controller: &Controller, deployment: &str, as_json: bool) -> Result<()> {
    let snapshot = controller
        .status(&DeploymentId(deployment.to_string()))
        .await?;
    let d = &snapshot.deployment;

    if as_json {
        let output = StatusOutput {
            deployment: d,
            active: snapshot.active,
            last_seq: snapshot.last_seq,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Deployment: {}", d.deployment_id);
    println!("Agent:      {}", d.agent_id);
    println!("Status:     {}{}", d.status, if snapshot.active { " (active)" } else { "" });
    println!("Framework:  {}", d.framework_hint);
    println!("Source:     {}", d.source.short());
    if let Some(artifact) = &d.artifact {
        println!("Artifact:   {}", artifact.short());
    }
    if let Some(handle) = &d.backend_handle {
        println!("Handle:     {handle}");
    }
    println!(
        "Limits:     {} MiB, {}m CPU, {} replica(s)",
        d.limits.memory_mb, d.limits.cpu_millis, d.limits.replicas
    );
    if let Some(reason) = &d.failure_reason {
        println!("Reason:     {reason}");
    }
    println!("Events:     {}", snapshot.last_seq);
    println!("Updated:    {}", d.updated_at.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

async fn cmd_events(controller: &Controller, deployment: &str, from: u64, follow: bool) -> Result<()> {
    let id = DeploymentId(deployment.to_string());
    let mut next = from.max(1);
    loop {
        let events = controller.history(&id, next).await?;
        let mut ended = false;
        for event in &events {
            print_event(event);
            ended |= ends_deployment(event);
            next = event.seq + 1;
        }
        if !follow || ended {
            return Ok(());
        }
        if events.is_empty() && controller.status(&id).await?.deployment.status.is_terminal() {
            return Ok(());
        }
        // Another process may be writing; poll the persisted log.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn cmd_agents(
    controller: &Controller,
    owner: Option<&OwnerId>,
    status: Option<&str>,
) -> Result<()> {
    let agents = controller.list_agents(owner, status).await?;
    if agents.is_empty() {
        println!("No agents");
        return Ok(());
    }
    for agent in agents {
        let active = agent
            .active_deployment
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<10}  {:<24}  {}",
            agent.agent_id,
            agent.status_label(),
            agent.name,
            active
        );
    }
    Ok(())
}

async fn cmd_history(controller: &Controller, agent: &AgentId) -> Result<()> {
    let deployments = controller.list_deployments(agent).await?;
    if deployments.is_empty() {
        println!("No deployments for {agent}");
        return Ok(());
    }
    for d in deployments {
        println!(
            "{}  {:<11}  {}  {}{}",
            d.deployment_id,
            d.status.as_str(),
            d.created_at.format("%Y-%m-%d %H:%M:%S"),
            d.framework_hint,
            d.failure_reason
                .map(|r| format!("  ({r})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_artifacts(builder: &BuildEngine) -> Result<()> {
    let artifacts = builder.catalog().list().await?;
    if artifacts.is_empty() {
        println!("No artifacts");
        return Ok(());
    }
    for a in artifacts {
        println!(
            "{}  {:<10}  {:>8} B  source {}  {}",
            a.hash.short(),
            a.framework,
            a.size,
            a.source.short(),
            a.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_event(event: &EventRecord) {
    let payload = match &event.payload {
        serde_json::Value::Object(map) if map.is_empty() => String::new(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    println!(
        "{:>4}  {}  {:<22}  {}",
        event.seq,
        event.timestamp.format("%H:%M:%S%.3f"),
        event.kind,
        payload
    );
}
