//! FlexBlock CSI plugin
//!
//! Runs the identity service plus the controller and/or node services over
//! the JSON RPC transport.

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flexblock_csi::{
    ArrayConfig, ArrayGatewayRef, ControllerService, DriverConfig, IdentityService, LinuxHost,
    Mode, NodeService, RequestContext, RestGateway, RpcMetrics, RpcServer, RpcState,
    SimulatedArray, SimulatedArrayConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// FlexBlock CSI - container storage plugin for block storage arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Services to run
    #[arg(long, env = "CSI_MODE", value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// RPC bind address
    #[arg(long, env = "CSI_LISTEN_ADDR", default_value = "0.0.0.0:9808")]
    listen_addr: String,

    /// Plugin name reported to the orchestrator
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = flexblock_csi::config::DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Array gateway URL
    #[arg(long, env = "ARRAY_ENDPOINT", default_value = "")]
    endpoint: String,

    /// Array user
    #[arg(long, env = "ARRAY_USER", default_value = "")]
    username: String,

    /// Array password
    #[arg(long, env = "ARRAY_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Array system name or ID
    #[arg(long, env = "ARRAY_SYSTEM_NAME", default_value = "")]
    system_name: String,

    /// Skip TLS verification of the gateway certificate
    #[arg(long, env = "ARRAY_INSECURE")]
    insecure: bool,

    /// YAML file with array connection fields; overrides the flags above
    #[arg(long, env = "ARRAY_CONFIG")]
    array_config: Option<PathBuf>,

    /// Root directory of private mount points
    #[arg(long, env = "CSI_PRIVATE_MOUNT_DIR", default_value = "/var/lib/kubelet/plugins/flexblock.csi/disks")]
    private_mount_dir: PathBuf,

    /// Host GUID to use instead of asking the host agent
    #[arg(long, env = "CSI_HOST_GUID")]
    host_guid: Option<String>,

    /// Thick-provision volumes unless the request says otherwise
    #[arg(long, env = "CSI_THICK_PROVISIONING")]
    thick_provisioning: bool,

    /// Deleting a snapshot deletes its whole consistency group
    #[arg(long, env = "CSI_SNAPSHOT_CG_DELETE")]
    snapshot_cg_delete: bool,

    /// Include snapshots in volume listings
    #[arg(long, env = "CSI_LIST_VOLUMES_SNAPSHOTS")]
    list_volumes_snapshots: bool,

    /// Probe on first use instead of failing unprobed calls
    #[arg(long, env = "CSI_AUTO_PROBE", default_value_t = true, action = ArgAction::Set)]
    auto_probe: bool,

    /// Probe before serving and exit if the probe fails
    #[arg(long, env = "CSI_PROBE_ON_START")]
    probe_on_start: bool,

    /// Use an in-memory array instead of a gateway
    #[arg(long, env = "CSI_SIMULATE")]
    simulate: bool,

    /// Deadline for requests without a timeout header, in seconds
    #[arg(long, env = "CSI_REQUEST_TIMEOUT", default_value = "120")]
    request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    async fn into_config(self) -> anyhow::Result<DriverConfig> {
        let mut config = DriverConfig {
            driver_name: self.driver_name,
            mode: self.mode,
            listen_addr: self
                .listen_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid listen address {}", self.listen_addr))?,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            probe_on_start: self.probe_on_start,
            simulate: self.simulate,
            ..Default::default()
        };

        config.array.endpoint = self.endpoint;
        config.array.username = self.username;
        config.array.password = self.password;
        config.array.system_name = self.system_name;
        config.array.insecure = self.insecure;
        if let Some(path) = &self.array_config {
            ArrayConfig::load(path)
                .await
                .with_context(|| format!("loading array config {}", path.display()))?
                .apply(&mut config.array);
        }

        config.controller.default_thick_provisioning = self.thick_provisioning;
        config.controller.enable_snapshot_cg_delete = self.snapshot_cg_delete;
        config.controller.auto_probe = self.auto_probe;
        config.controller.list_volumes_snapshots = self.list_volumes_snapshots;

        config.node.private_mount_dir = self.private_mount_dir;
        config.node.host_guid = self.host_guid;
        config.node.auto_probe = self.auto_probe;

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.log_json);

    let config = args.into_config().await?;

    info!("Starting FlexBlock CSI plugin");
    info!("  Version: {}", flexblock_csi::VERSION);
    info!("  Driver: {}", config.driver_name);
    info!("  Mode: {}", config.mode);
    info!("  Listen: {}", config.listen_addr);
    info!("  Simulated array: {}", config.simulate);

    let controller = if config.mode.runs_controller() {
        let array = build_array(&config)?;
        Some(Arc::new(ControllerService::new(config.controller.clone(), array)))
    } else {
        None
    };

    let node = if config.mode.runs_node() {
        let host = Arc::new(LinuxHost::new(config.host.clone()));
        Some(Arc::new(NodeService::new(config.node.clone(), host)))
    } else {
        None
    };

    let identity = Arc::new(IdentityService::new(
        config.driver_name.clone(),
        controller.clone(),
        node.clone(),
    ));

    let shutdown = CancellationToken::new();

    if config.probe_on_start {
        let ctx = RequestContext::child_of(&shutdown).with_timeout(config.request_timeout);
        identity.probe(&ctx).await.context("startup probe failed")?;
        info!("Startup probe succeeded");
    }

    let state = RpcState {
        identity,
        controller,
        node,
        metrics: RpcMetrics::new().context("registering metrics")?,
        shutdown: shutdown.clone(),
        default_timeout: config.request_timeout,
    };

    tokio::spawn(wait_for_signal(shutdown));

    RpcServer::new(config.listen_addr, state)
        .run()
        .await
        .context("RPC server failed")?;

    info!("Plugin shutdown complete");
    Ok(())
}

fn build_array(config: &DriverConfig) -> anyhow::Result<ArrayGatewayRef> {
    if config.simulate {
        let array = Arc::new(SimulatedArray::new(SimulatedArrayConfig::default()));
        array.add_pool("pool1");
        if let Some(guid) = &config.node.host_guid {
            array.add_host(guid, "127.0.0.1");
        }
        warn!("Using simulated array with storage pool pool1");
        return Ok(array);
    }
    let gateway = RestGateway::new(config.array.clone()).context("creating array gateway client")?;
    Ok(Arc::new(gateway))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, json: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
