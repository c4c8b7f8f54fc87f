// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use ethers::providers::{Http, Middleware, Provider};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kernel_delegate::backend::{LocalRelay, Orchestrator, ProgressHub, RpcBundler};
use kernel_delegate::client::{DelegatedKeyManager, HttpRelay, ManagerConfig, RelayApi, SoftwareWatch};
use kernel_delegate::config::{Config, RelayMode};
use kernel_delegate::rpc::{WalletApiServer, WalletRpcImpl};
use kernel_delegate::types::KeyRole;
use kernel_delegate::userop::{EntryPoint, EntryPointReader, KernelRpc, MemoryKeyStore, UserOpSigner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Config::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let provider = Arc::new(Provider::<Http>::try_from(config.eth_rpc_url.as_str())?);
    config.check_chain_id(provider.get_chainid().await?)?;

    let entry_point: Arc<dyn EntryPointReader> =
        Arc::new(EntryPoint::new(provider.clone(), config.entry_point));
    let keystore = MemoryKeyStore::from_hex(KeyRole::Root, &config.root_key)?;
    let owner = match (config.owner, keystore.address(KeyRole::Root)) {
        (Some(owner), _) | (None, Some(owner)) => owner,
        (None, None) => anyhow::bail!("no owner address configured"),
    };
    let signer = UserOpSigner::new(entry_point.clone(), Arc::new(keystore));

    let relay = build_relay(&config, provider, entry_point).await?;
    match relay.health().await {
        Ok(true) => info!("Relay is healthy"),
        Ok(false) => warn!("Relay reported unhealthy"),
        Err(e) => warn!("Relay health check failed: {}", e),
    }

    let manager = Arc::new(DelegatedKeyManager::new(
        ManagerConfig {
            kernel_address: config.kernel_address,
            owner,
            channel: Some(config.channel()?),
        },
        relay,
        signer,
        Arc::new(SoftwareWatch::new()),
    ));

    let server_addr: SocketAddr = config.rpc_server_addr.parse()?;
    info!(
        "Starting delegated key RPC server on {} for kernel {:?}",
        server_addr, config.kernel_address
    );
    let server_handle = start_server(server_addr, WalletRpcImpl::new(manager)).await?;

    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn build_relay(
    config: &Config,
    provider: Arc<Provider<Http>>,
    entry_point: Arc<dyn EntryPointReader>,
) -> anyhow::Result<Arc<dyn RelayApi>> {
    match config.relay()? {
        RelayMode::Remote { url, timeout } => {
            info!("Using relay at {}", url);
            Ok(Arc::new(HttpRelay::new(url, timeout)?))
        }
        RelayMode::Embedded {
            bundler_url,
            paymaster_url,
            modules,
        } => {
            let mut bundler =
                RpcBundler::new(Provider::<Http>::try_from(bundler_url.as_str())?, config.entry_point);
            if let Some(paymaster_url) = paymaster_url {
                bundler = bundler.with_paymaster(Provider::<Http>::try_from(paymaster_url.as_str())?);
            }

            let hub = Arc::new(ProgressHub::new());
            let listener = TcpListener::bind(&config.progress_addr).await?;
            tokio::spawn(hub.clone().serve(listener));

            let orchestrator = Orchestrator::new(
                entry_point,
                Arc::new(KernelRpc::new(provider)),
                Arc::new(bundler),
                hub,
                modules,
            );
            info!("Running relay in-process against bundler {}", bundler_url);
            Ok(Arc::new(LocalRelay::new(Arc::new(orchestrator))))
        }
    }
}

async fn start_server(server_addr: SocketAddr, wallet_rpc: WalletRpcImpl) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    let server_handle = server.start(wallet_rpc.into_rpc());

    Ok(server_handle)
}
