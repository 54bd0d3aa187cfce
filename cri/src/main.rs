//! Image CRI Shim - CRI ImageService proxy binary.
//!
//! Listens on the shim socket, speaks the CRI version of the backing
//! runtime and redirects image pulls toward the configured mirror.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use image_cri_shim_core::{AuthStore, ShimConfig, VERSION};

use image_cri_shim::allowlist::{AllowList, AllowListRefresher};
use image_cri_shim::cache::RewriteCache;
use image_cri_shim::client::{ConnectOptions, PeerSocket, RuntimeClient};
use image_cri_shim::registry::OciTagLister;
use image_cri_shim::rewrite::ReferenceRewriter;
use image_cri_shim::server::{ServerOptions, ShimServer};

const DEFAULT_CONFIG_PATH: &str = "/etc/image-cri-shim.yaml";

/// Image CRI Shim
#[derive(Parser, Debug)]
#[command(name = "image-cri-shim", about = "CRI image shim", version)]
struct Args {
    /// Path to the YAML configuration file [default: /etc/image-cri-shim.yaml].
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket the shim listens on; overrides `shimSocket`.
    #[arg(long)]
    shim_socket: Option<PathBuf>,

    /// Backing runtime image socket; overrides `criSocket`.
    #[arg(long)]
    cri_socket: Option<PathBuf>,

    /// Wait for the backing runtime socket to appear.
    #[arg(long)]
    wait: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(config.debug, args.log_json);

    tracing::info!(
        version = VERSION,
        shim_socket = %config.shim_socket.display(),
        cri_socket = %config.cri_socket.display(),
        "Starting image CRI shim"
    );

    let auth = Arc::new(AuthStore::new(config.pre_process()?));
    for registry in auth.sorted_registries() {
        tracing::info!(
            registry = %registry.domain,
            priority = registry.priority,
            offline = registry.offline,
            insecure = registry.insecure,
            "Registry configured"
        );
    }

    let peer: Arc<Mutex<Option<PeerSocket>>> = Arc::new(Mutex::new(None));
    let observed = peer.clone();
    let client = Arc::new(
        RuntimeClient::new(
            &config.cri_socket,
            ConnectOptions {
                wait: config.wait,
                ..Default::default()
            },
        )
        .with_dial_hook(Arc::new(move |socket: &PeerSocket| {
            *observed.lock() = Some(socket.clone());
        })),
    );
    client
        .connect()
        .await
        .context("failed to connect to backing runtime")?;

    match client.version().await {
        Ok(version) => tracing::info!(
            runtime = %version.runtime_name,
            runtime_version = %version.runtime_version,
            api_version = %version.runtime_api_version,
            "Backing runtime"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to query backing runtime version"),
    }

    let allow_list = Arc::new(AllowList::new());
    let refresher = if config.allow_list.dir.as_os_str().is_empty() {
        None
    } else {
        AllowListRefresher::new(
            allow_list.clone(),
            &config.allow_list.dir,
            config.allow_list.interval(),
        )
        .start()
    };

    let prober = Arc::new(OciTagLister::new(
        config.probe_timeout(),
        auth.sorted_registries(),
    ));
    let rewriter = Arc::new(
        ReferenceRewriter::new(
            auth.clone(),
            allow_list,
            prober,
            RewriteCache::new(config.cache.capacity(), config.cache.ttl()),
        )
        .with_digest_compat(config.digest_compat),
    );

    let mut server = ShimServer::new(ServerOptions {
        socket: config.shim_socket.clone(),
        permissions: config.socket_permissions,
    })?;
    if let Err(e) = bring_up(&mut server, &config, &client, &rewriter, &peer).await {
        let _ = server.stop().await;
        return Err(e);
    }

    shutdown_signal().await?;
    tracing::info!("Shutting down");

    server.stop().await?;
    if let Some(handle) = refresher {
        handle.abort();
    }
    let stats = rewriter.cache().stats();
    tracing::info!(
        hits = stats.image_hits,
        misses = stats.image_misses,
        evictions = stats.image_evictions,
        "Rewrite cache statistics"
    );
    Ok(())
}

async fn bring_up(
    server: &mut ShimServer,
    config: &ShimConfig,
    client: &Arc<RuntimeClient>,
    rewriter: &Arc<ReferenceRewriter>,
    peer: &Mutex<Option<PeerSocket>>,
) -> anyhow::Result<()> {
    server.bind()?;
    if config.socket_permissions.is_none() {
        let mirrored = peer.lock().as_ref().map(PeerSocket::permissions);
        match mirrored {
            Some(permissions) => server.apply_permissions(permissions)?,
            None => tracing::warn!("Runtime socket ownership unknown, keeping defaults"),
        }
    }

    server
        .negotiate(client, config.timeout())
        .await
        .context("CRI version negotiation failed")?;
    server.register_image_service(client.clone(), rewriter.clone())?;
    server.start().await?;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<ShimConfig> {
    let mut config = match &args.config {
        Some(path) => ShimConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ShimConfig::load(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => ShimConfig::default(),
    };

    if let Some(socket) = &args.shim_socket {
        config.shim_socket = socket.clone();
    }
    if let Some(socket) = &args.cri_socket {
        config.cri_socket = socket.clone();
    }
    if args.wait {
        config.wait = true;
    }
    Ok(config)
}

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
