//! # Switchyard CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a control plane, optionally from a JSON config file
//! switchyard control -b 0.0.0.0:7600 --config switchyard.json --state-file /var/lib/switchyard/state.json
//!
//! # Run a demo database balancer that registers with it
//! switchyard module -c 127.0.0.1:7600 -t dblb -b 127.0.0.1:9200 --capability postgres:5432
//!
//! # Raw JSON-RPC call (stdout is the JSON result only)
//! switchyard call 127.0.0.1:7600 route_connection -p '{"pattern": "postgres:5432"}'
//!
//! # Control plane status
//! switchyard status 127.0.0.1:7600
//! ```
//!
//! Addresses are `host:port`; an `http://` prefix is accepted and ignored.

use anyhow::Result;
use argh::FromArgs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use switchyard_agent::{AgentConfig, AgentServer, ModuleAgent, StaticModule};
use switchyard_client::{ControlPlaneClient, HttpModuleClient};
use switchyard_common::{ModuleType, TrafficPattern};
use switchyard_control::{ControlPlane, ControlPlaneConfig, HttpServer};

/// Checks that `address` looks like `host:port`, with or without a scheme.
fn validate_address(address: &str, description: &str) -> Result<()> {
    let bare = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address)
        .trim_end_matches('/');
    match bare.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(anyhow::anyhow!(
            "Invalid {}: '{}' must be host:port",
            description,
            address
        )),
    }
}

#[derive(FromArgs)]
/// Switchyard - control plane for load-balancer modules
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Control(ControlArgs),
    Module(ModuleArgs),
    Call(CallArgs),
    Status(StatusArgs),
}

/// Arguments for running a control plane.
///
/// Flags override the matching fields of `--config`.
#[derive(FromArgs)]
#[argh(subcommand, name = "control")]
/// run the control plane
struct ControlArgs {
    /// JSON config file
    #[argh(option)]
    config: Option<PathBuf>,

    /// address to serve JSON-RPC on (default from config, 127.0.0.1:7600)
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// interval modules are asked to heartbeat at, in milliseconds
    #[argh(option, long = "heartbeat-interval-ms")]
    heartbeat_interval_ms: Option<u64>,

    /// file routes, policies and deployments are persisted to
    #[argh(option, long = "state-file")]
    state_file: Option<PathBuf>,
}

/// Arguments for running a demo module instance.
///
/// The instance answers the module contract from in-memory state and keeps
/// itself registered with the control plane until interrupted.
#[derive(FromArgs)]
#[argh(subcommand, name = "module")]
/// run a demo module instance
struct ModuleArgs {
    /// control plane address
    #[argh(option, short = 'c', long = "control-plane")]
    control_plane: String,

    /// module type, long or short form (alb, dblb, ailb, media, nlb, egress)
    #[argh(option, short = 't', long = "type")]
    module_type: ModuleType,

    /// address to serve the module contract on
    #[argh(option, short = 'b', default = "\"127.0.0.1:0\".into()")]
    bind: String,

    /// address registered with the control plane; defaults to the bound address
    #[argh(option)]
    advertise: Option<String>,

    /// version label
    #[argh(option, default = "\"v1\".into()")]
    version: String,

    /// traffic pattern this instance accepts; repeatable, defaults per type
    #[argh(option, long = "capability")]
    capabilities: Vec<TrafficPattern>,

    /// priority answered to CanHandle for covered patterns (0-100)
    #[argh(option, default = "50")]
    priority: u8,

    /// load reported in heartbeats (0.0-1.0)
    #[argh(option, default = "0.0")]
    load: f64,
}

/// Arguments for a single raw JSON-RPC call.
///
/// Prints the raw JSON result to stdout, so output can be piped to `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a JSON-RPC method
struct CallArgs {
    /// control plane or module address
    #[argh(positional)]
    address: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// JSON params
    #[argh(option, short = 'p', long = "params", default = "\"{}\".into()")]
    params: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// print control plane status
struct StatusArgs {
    /// control plane address
    #[argh(positional)]
    address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and status print JSON to stdout; keep it clean
    if matches!(cli.command, Commands::Control(_) | Commands::Module(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Control(args) => run_control(args).await,
        Commands::Module(args) => run_module(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Status(args) => run_status(args).await,
    }
}

fn control_config(args: &ControlArgs) -> Result<ControlPlaneConfig> {
    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(ms) = args.heartbeat_interval_ms {
        config.heartbeat.interval_ms = ms;
    }
    if let Some(path) = &args.state_file {
        config.state_file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn run_control(args: ControlArgs) -> Result<()> {
    let config = control_config(&args)?;
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.bind_addr, e))?;

    tracing::info!("Starting Switchyard control plane");
    if let Some(path) = &config.state_file {
        tracing::info!("Persisting state to {}", path.display());
    }
    tracing::info!(
        "Routes: {}, scaling policies: {}",
        config.routes.len(),
        config.scaling_policies.len()
    );

    let control = Arc::new(
        ControlPlane::builder(config, Arc::new(HttpModuleClient::new()))
            .start()
            .await?,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    HttpServer::new(Arc::clone(&control))
        .serve(listener, shutdown_signal())
        .await?;

    control.shutdown();
    Ok(())
}

async fn run_module(args: ModuleArgs) -> Result<()> {
    validate_address(&args.control_plane, "control plane address")?;
    if args.priority > 100 {
        anyhow::bail!("priority must be between 0 and 100, got {}", args.priority);
    }

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", args.bind, e))?;
    let local = listener.local_addr()?;
    let advertise = args.advertise.unwrap_or_else(|| local.to_string());
    validate_address(&advertise, "advertised address")?;

    let module = Arc::new(StaticModule::new(args.module_type, args.version.clone(), args.capabilities));
    module.set_priority(args.priority);
    module.set_load(args.load);
    tracing::info!(
        "Starting {} module {} on {} (advertised as {})",
        args.module_type,
        args.version,
        local,
        advertise
    );

    let mut config = AgentConfig::new(args.control_plane, args.module_type, advertise, args.version);
    config.capabilities = module.capabilities().to_vec();
    let agent = Arc::new(ModuleAgent::new(config, module.clone()));

    let server = tokio::spawn(AgentServer::new(module).serve(listener, shutdown_signal()));
    let heartbeats = Arc::clone(&agent).spawn();

    let served = server.await;
    heartbeats.abort();
    if let Err(e) = agent.deregister().await {
        tracing::warn!("Failed to deregister: {}", e);
    }
    served??;
    Ok(())
}

/// Executes the `call` subcommand. No tracing output, only the result.
async fn run_call(args: CallArgs) -> Result<()> {
    validate_address(&args.address, "address")?;

    let params: serde_json::Value =
        serde_json::from_str(&args.params).map_err(|e| anyhow::anyhow!("Invalid JSON in params: {}", e))?;

    let client = ControlPlaneClient::new(args.address).with_timeout(Duration::from_millis(args.timeout_ms));
    let result = client.call(&args.method, params).await?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn run_status(args: StatusArgs) -> Result<()> {
    validate_address(&args.address, "address")?;
    let status = ControlPlaneClient::new(args.address).get_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
