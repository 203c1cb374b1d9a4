//! keywarden - clustered PGP key custody

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keywarden::{
    cluster::{ClusterSync, KubernetesDiscovery, PeerDiscovery, StaticDiscovery},
    config::{Args, LogFormat},
    custodial_keys::{KeyCustodian, KeyRing, SecretEscrow},
    directory::{HkpDirectory, NoDirectory, PublicKeyDirectory},
    server::{self, AppState},
    storage::DiskBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  keywarden - clustered key custody");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    match args.internal_listen {
        Some(addr) => info!("Internal listen: {}", addr),
        None => info!("Internal listen: shared with public"),
    }
    info!("Key folder: {}", args.private_key_folder.display());
    info!("Key server: {}", args.sks_server.as_deref().unwrap_or("none"));
    info!("======================================");

    // Key storage and public key lookup
    let backend = Arc::new(
        DiskBackend::new(args.private_key_folder.clone(), args.key_prefix.clone()).await?,
    );
    let directory: Arc<dyn PublicKeyDirectory> = match &args.sks_server {
        Some(server) => Arc::new(HkpDirectory::new(server.clone(), args.directory_timeout())?),
        None => Arc::new(NoDirectory),
    };
    let keyring = Arc::new(KeyRing::new(args.keyring_config(), directory));
    let custodian = Arc::new(KeyCustodian::new(args.custodian_config(), keyring, backend));
    custodian.load_keys().await;

    // A node without the master key still serves already unlocked keys,
    // but a master key that is present and broken is fatal.
    let escrow = match SecretEscrow::new(&args.escrow_config()).await {
        Ok(escrow) => Arc::new(escrow),
        Err(e) => {
            error!("Secret escrow failed to start: {}", e);
            std::process::exit(1);
        }
    };
    if escrow.is_degraded() {
        warn!("Running without a master key - passphrases will not be shared with peers");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let sync_task = match discovery(&args).await? {
        Some(discovery) => {
            let sync = Arc::new(ClusterSync::new(
                args.sync_config(),
                discovery,
                Arc::clone(&escrow),
                Arc::clone(&custodian),
            )?);
            Some(sync.spawn(stop_rx))
        }
        None => {
            info!("No cluster configured, passphrase sync disabled");
            None
        }
    };

    let state = Arc::new(AppState::new(args, custodian, escrow));

    let mut exit_code = 0;
    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                exit_code = 1;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    // Let an in-flight sync cycle finish
    let _ = stop_tx.send(true);
    if let Some(task) = sync_task {
        if let Err(e) = task.await {
            warn!("Cluster sync task ended abnormally: {}", e);
        }
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("keywarden={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Kubernetes when a service account is mounted, else the static peer list.
async fn discovery(args: &Args) -> anyhow::Result<Option<Arc<dyn PeerDiscovery>>> {
    if KubernetesDiscovery::in_cluster() {
        match KubernetesDiscovery::connect(
            args.cluster_port(),
            args.ignore_kubernetes_ca,
            args.sync_config().request_timeout,
        )
        .await
        {
            Ok(discovery) => return Ok(Some(Arc::new(discovery))),
            Err(e) => warn!("Kubernetes discovery unavailable: {}", e),
        }
    }

    match args.static_peers() {
        Some(peers) => {
            let discovery = StaticDiscovery::parse(args.cluster_self_id(), peers)?;
            info!("Static cluster peers: {}", peers);
            Ok(Some(Arc::new(discovery)))
        }
        None => Ok(None),
    }
}
