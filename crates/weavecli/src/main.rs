use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use weavecore::{
    Credential, CredentialCipher, CredentialVault, EventKind, ExecutionEvent, JsonMap, NodeSpec,
    WorkflowGraph, XChaChaCipher,
};
use weavegateway::{CredentialInjector, FederatedGateway, GatewayConfig, ServerRegistry};
use weaveruntime::{
    CheckpointStore, EngineConfig, ExecutionHandle, ExecutionReport, ExecutionRequest,
    ExecutionStatus, FileCheckpointStore, MemoryCheckpointStore, NodeRegistry, WeaveRuntime,
};

#[derive(Parser)]
#[command(name = "weave", version)]
#[command(about = "Weave workflow engine CLI", long_about = None)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct IdentityArgs {
    /// Encrypted credential records (JSON array) of the executing user
    #[arg(short, long, env = "WEAVE_CREDENTIALS")]
    credentials: Option<PathBuf>,

    #[arg(short, long, env = "WEAVE_USER_ID", default_value = "local")]
    user_id: String,

    /// Base64 key the credential records were encrypted with
    #[arg(long, env = "WEAVE_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,
}

#[derive(Args)]
struct EngineArgs {
    /// MCP server registry (JSON); the built-in servers when omitted
    #[arg(short, long, env = "WEAVE_SERVERS")]
    servers: Option<PathBuf>,

    /// Persist checkpoints here so the run can be resumed
    #[arg(long, env = "WEAVE_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, env = "WEAVE_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        workflow: PathBuf,

        /// Inputs for the root nodes as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Continue an interrupted execution from its checkpoints
    Resume {
        execution_id: Uuid,

        /// The workflow file the execution was started from
        #[arg(short, long)]
        workflow: PathBuf,

        #[arg(short, long)]
        input: Option<String>,

        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Check a workflow file for cycles, dangling edges and unknown node types
    Validate {
        #[arg(short, long)]
        workflow: PathBuf,
    },

    /// List available node types
    Nodes,

    /// List MCP servers and whether the user's credentials unlock them
    Servers {
        #[arg(short, long, env = "WEAVE_SERVERS")]
        servers: Option<PathBuf>,

        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// Produce an encrypted credential record
    Encrypt {
        /// Credential type, e.g. github_token
        #[arg(short = 't', long = "type")]
        credential_type: String,

        /// Secret fields as a JSON object, e.g. '{"token": "..."}'
        #[arg(short, long)]
        data: String,

        #[arg(short, long, env = "WEAVE_USER_ID", default_value = "local")]
        user_id: String,

        /// Bind the record to one MCP server
        #[arg(long)]
        server_id: Option<String>,

        #[arg(long, env = "WEAVE_ENCRYPTION_KEY", hide_env_values = true)]
        encryption_key: String,
    },

    /// Generate a credential encryption key
    Keygen,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            workflow,
            input,
            identity,
            engine,
        } => run_workflow(&workflow, input, &identity, &engine).await,
        Commands::Resume {
            execution_id,
            workflow,
            input,
            identity,
            engine,
        } => resume_workflow(execution_id, &workflow, input, &identity, &engine).await,
        Commands::Validate { workflow } => validate_workflow(&workflow),
        Commands::Nodes => list_nodes(),
        Commands::Servers { servers, identity } => list_servers(servers.as_deref(), &identity),
        Commands::Encrypt {
            credential_type,
            data,
            user_id,
            server_id,
            encryption_key,
        } => encrypt_credential(credential_type, &data, user_id, server_id, &encryption_key),
        Commands::Keygen => {
            println!("{}", XChaChaCipher::generate_key());
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(&output),
    }
}

fn load_workflow(path: &Path) -> Result<WorkflowGraph> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a valid workflow", path.display()))
}

fn parse_inputs(input: Option<String>) -> Result<JsonMap> {
    match input {
        None => Ok(JsonMap::new()),
        Some(raw) => match serde_json::from_str(&raw).context("input is not valid JSON")? {
            Value::Object(map) => Ok(map),
            _ => bail!("Input must be a JSON object"),
        },
    }
}

fn load_vault(identity: &IdentityArgs) -> Result<CredentialVault> {
    let Some(path) = &identity.credentials else {
        return Ok(CredentialVault::empty(&identity.user_id));
    };
    let Some(key) = &identity.encryption_key else {
        bail!("--encryption-key (or WEAVE_ENCRYPTION_KEY) is required to read {}", path.display());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials {}", path.display()))?;
    let records: Vec<Credential> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a list of credential records", path.display()))?;
    let cipher = XChaChaCipher::from_base64(key).context("invalid encryption key")?;
    Ok(CredentialVault::new(&identity.user_id, records, Arc::new(cipher)))
}

fn load_servers(path: Option<&Path>) -> Result<ServerRegistry> {
    match path {
        Some(path) => ServerRegistry::from_file(path)
            .with_context(|| format!("failed to load servers from {}", path.display())),
        None => Ok(ServerRegistry::defaults()),
    }
}

fn node_registry(gateway: Arc<FederatedGateway>) -> Result<NodeRegistry> {
    let mut builder = NodeRegistry::builder();
    weavenodes::register_all(&mut builder, gateway).context("failed to register nodes")?;
    Ok(builder.build())
}

async fn build_runtime(engine: &EngineArgs) -> Result<WeaveRuntime> {
    let servers = load_servers(engine.servers.as_deref())?;
    let gateway = Arc::new(FederatedGateway::new(servers, GatewayConfig::default()));

    let checkpoints: Arc<dyn CheckpointStore> = match &engine.checkpoint_dir {
        Some(dir) => Arc::new(
            FileCheckpointStore::open(dir)
                .await
                .with_context(|| format!("cannot use checkpoint dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    let mut config = EngineConfig::default();
    if let Some(limit) = engine.max_concurrency {
        config.max_concurrency = limit;
    }
    Ok(WeaveRuntime::with_store(node_registry(gateway)?, checkpoints, config))
}

async fn run_workflow(
    path: &Path,
    input: Option<String>,
    identity: &IdentityArgs,
    engine: &EngineArgs,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", path.display());
    let workflow = load_workflow(path)?;
    let request = ExecutionRequest::new(&identity.user_id)
        .with_credentials(load_vault(identity)?)
        .with_inputs(parse_inputs(input)?);

    let runtime = build_runtime(engine).await?;
    let workflow = runtime.register_workflow(workflow).await?;
    print_workflow(&workflow);

    let mut events = runtime.subscribe_events();
    let handle = runtime.start_workflow(workflow.id, request).await?;
    println!("   Execution ID: {}", handle.execution_id());
    println!();
    let events = tokio::spawn(print_events(handle.execution_id(), events));
    finish(handle, events, engine).await
}

async fn resume_workflow(
    execution_id: Uuid,
    path: &Path,
    input: Option<String>,
    identity: &IdentityArgs,
    engine: &EngineArgs,
) -> Result<()> {
    if engine.checkpoint_dir.is_none() {
        bail!("resume needs --checkpoint-dir (or WEAVE_CHECKPOINT_DIR)");
    }
    let workflow = load_workflow(path)?;
    let request = ExecutionRequest::new(&identity.user_id)
        .with_credentials(load_vault(identity)?)
        .with_inputs(parse_inputs(input)?);

    let runtime = build_runtime(engine).await?;
    let workflow = runtime.register_workflow(workflow).await?;
    println!("🔄 Resuming execution {execution_id}");
    print_workflow(&workflow);
    println!();

    let mut events = runtime.subscribe_events();
    let handle = runtime.resume(execution_id, request).await.with_context(|| {
        format!(
            "cannot resume {execution_id}; it must have been started from workflow {} version {}",
            workflow.id, workflow.version
        )
    })?;
    let events = tokio::spawn(print_events(handle.execution_id(), events));
    finish(handle, events, engine).await
}

fn print_workflow(workflow: &WorkflowGraph) {
    println!("📋 Workflow: {}", workflow.name.as_deref().unwrap_or("(unnamed)"));
    println!("   ID: {} (version {})", workflow.id, workflow.version);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
}

async fn finish(
    handle: ExecutionHandle,
    events: tokio::task::JoinHandle<()>,
    engine: &EngineArgs,
) -> Result<()> {
    let report = handle.wait().await?;

    // The printer stops on the summary event; give it a moment to drain.
    if tokio::time::timeout(std::time::Duration::from_millis(200), events)
        .await
        .is_err()
    {
        tracing::debug!("Event printer did not finish in time");
    }

    print_report(&report);
    match report.status {
        ExecutionStatus::Completed => Ok(()),
        ExecutionStatus::Paused if engine.checkpoint_dir.is_some() => {
            println!();
            println!("Resume it with:");
            println!("  weave resume {} --workflow <file> --checkpoint-dir <dir>", report.execution_id);
            Ok(())
        }
        status => bail!("execution {} {}", report.execution_id, status),
    }
}

async fn print_events(execution_id: Uuid, mut events: tokio::sync::broadcast::Receiver<ExecutionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.execution_id == execution_id => {
                let done = event.kind == EventKind::Complete;
                print_event(&event);
                if done {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => println!("     … {missed} events dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn text<'a>(data: &'a Value, field: &str) -> &'a str {
    data.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn print_event(event: &ExecutionEvent) {
    let data = &event.data;
    let Some(node_id) = event.node_id.as_deref() else {
        match (event.kind, event.status()) {
            (EventKind::Complete, Some("completed")) => println!("✨ Workflow completed"),
            (EventKind::Complete, status) => println!("💥 Workflow {}", status.unwrap_or("failed")),
            (_, Some("running")) => println!("▶️  Workflow started"),
            (_, Some("paused")) => println!("⏸️  Workflow paused"),
            _ => {}
        }
        return;
    };

    match event.status() {
        Some("running") => println!("  ⚡ Starting node: {} ({})", node_id, text(data, "node_type")),
        Some("completed") => println!("  ✅ Node {node_id} completed"),
        Some("failed") => println!("  ❌ Node {} failed: {}", node_id, text(&data["error"], "message")),
        Some("retrying") => println!(
            "  🔁 Node {} retrying (attempt {}) in {}ms: {}",
            node_id,
            data["attempt"],
            data["delay_ms"],
            text(&data["error"], "message")
        ),
        Some("skipped") => println!("  ⏭️  Node {} skipped: {}", node_id, text(data, "reason")),
        Some("cancelled") => println!("  🛑 Node {node_id} cancelled"),
        Some(_) => {}
        None => match text(data, "event") {
            "info" => println!("     ℹ️  [{}] {}", node_id, text(data, "message")),
            "warning" => println!("     ⚠️  [{}] {}", node_id, text(data, "message")),
            "progress" => match data.get("message").and_then(Value::as_str) {
                Some(msg) => println!("     📊 [{}] {}% - {}", node_id, data["percent"], msg),
                None => println!("     📊 [{}] {}%", node_id, data["percent"]),
            },
            _ => {}
        },
    }
}

fn print_report(report: &ExecutionReport) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", report.execution_id);
    println!("   Trace ID: {}", report.trace_id);
    println!("   Status: {}", report.status);
    println!(
        "   Completed: {}/{} nodes in {}ms",
        report.outputs.len(),
        report.state.node_states.len(),
        report.duration_ms
    );

    if !report.failures.is_empty() {
        println!();
        println!("❌ Failures:");
        for failure in &report.failures {
            println!(
                "   {} [{}] {}",
                failure.node_id, failure.error.code, failure.error.message
            );
        }
    }

    if !report.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, outputs) in &report.outputs {
            if outputs.is_empty() {
                continue;
            }
            println!("   Node {node_id}:");
            for (key, value) in outputs {
                println!("     {key}: {value}");
            }
        }
    }
}

fn validate_workflow(path: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", path.display());
    let workflow = load_workflow(path)?;

    let gateway = Arc::new(FederatedGateway::new(
        ServerRegistry::defaults(),
        GatewayConfig::default(),
    ));
    let runtime = WeaveRuntime::new(node_registry(gateway)?);
    let graph = runtime
        .executor()
        .validate(&workflow)
        .with_context(|| format!("{} is not runnable", path.display()))?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name.as_deref().unwrap_or("(unnamed)"));
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!("   Order: {}", graph.topological_order().join(" → "));
    Ok(())
}

fn list_nodes() -> Result<()> {
    println!("📦 Available Node Types:");
    println!();

    let gateway = Arc::new(FederatedGateway::new(
        ServerRegistry::defaults(),
        GatewayConfig::default(),
    ));
    let registry = node_registry(gateway)?;
    for node_type in registry.list_node_types() {
        let Some(definition) = registry.definition(node_type) else {
            continue;
        };
        println!("  • {} ({}, {:?})", node_type, definition.category, definition.kind);
        println!("    {}", definition.description);
    }
    Ok(())
}

fn list_servers(path: Option<&Path>, identity: &IdentityArgs) -> Result<()> {
    let registry = load_servers(path)?;
    let vault = load_vault(identity)?;
    let available: Vec<&str> = registry
        .list_available(&vault.credential_types())
        .into_iter()
        .map(|s| s.server_id.as_str())
        .collect();

    println!("🌐 MCP Servers (user {}):", identity.user_id);
    println!();
    for server in registry.list_all() {
        let marker = if !server.enabled {
            "⛔"
        } else if available.contains(&server.server_id.as_str()) {
            "✅"
        } else {
            "🔒"
        };
        println!("  {} {} ({}, {})", marker, server.server_id, server.name, server.transport);
        if let Some(credential_type) = &server.credential_type {
            println!("    credential: {credential_type}");
        }
        if !server.tools.is_empty() {
            println!("    tools: {}", server.tools.join(", "));
        }
    }
    Ok(())
}

fn encrypt_credential(
    credential_type: String,
    data: &str,
    user_id: String,
    mcp_server_id: Option<String>,
    key: &str,
) -> Result<()> {
    let fields: JsonMap = serde_json::from_str(data).context("--data must be a JSON object")?;
    let missing = CredentialInjector::default().validate_credential(&credential_type, &fields);
    if !missing.is_empty() {
        bail!("{credential_type} credentials need: {}", missing.join(", "));
    }

    let cipher = XChaChaCipher::from_base64(key).context("invalid encryption key")?;
    let plaintext = serde_json::to_vec(&fields)?;
    let record = Credential {
        id: Uuid::new_v4().to_string(),
        user_id,
        credential_type,
        encrypted_payload: cipher.encrypt(&plaintext).context("encryption failed")?,
        mcp_server_id,
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowGraph::new("Example HTTP Workflow");
    workflow.add_node(NodeSpec::new("fetch", "http.request").with_config("method", "GET"));
    workflow.add_node(NodeSpec::new("log", "debug.log"));
    workflow.connect_ports("fetch", "body", "log", "message");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json).with_context(|| format!("failed to write {}", output.display()))?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weave run --workflow {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );
    Ok(())
}
