// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use zk_entrypoint::account::{CallExecutor, ValueTransferExecutor};
use zk_entrypoint::clock::{Clock, SystemClock};
use zk_entrypoint::config::Args;
use zk_entrypoint::paymaster::VerifyingPaymaster;
use zk_entrypoint::registry::Registry;
use zk_entrypoint::rpc::{EntryPointRpcImpl, EntryPointRpcServer};
use zk_entrypoint::verifier::DigestVerifier;
use zk_entrypoint::EntryPoint;

const TRANSFER_GAS: u64 = 21_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.entry_point_config();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(Registry::new());

    // Optional built-in sponsor
    let paymaster = match &args.private_key {
        Some(private_key) => {
            let mut paymaster = VerifyingPaymaster::new(
                private_key,
                args.paymaster_address.unwrap_or_default(),
                config.address,
                config.chain_id,
                clock.clone(),
            )?;
            if args.paymaster_address.is_none() {
                paymaster.paymaster_address = paymaster.signer();
            }
            let paymaster = Arc::new(paymaster);
            registry.register_paymaster(paymaster.paymaster_address, paymaster.clone());
            Some(paymaster)
        }
        None => None,
    };

    let verifier = Arc::new(DigestVerifier::new(args.verifier_domain()?));
    let entry_point = Arc::new(EntryPoint::new(config, registry, verifier, clock));
    let executor: Arc<dyn CallExecutor> = Arc::new(ValueTransferExecutor::new(TRANSFER_GAS));

    // Create the JSON-RPC server
    let server_addr: SocketAddr = args.rpc_server_addr.parse()?;
    let rpc = EntryPointRpcImpl::new(entry_point, executor, paymaster);

    info!("Starting entry point RPC server on {}", server_addr);

    // Start the JSON-RPC server
    let server_handle = start_server(server_addr, rpc).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    rpc: EntryPointRpcImpl,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    let server_handle = server.start(rpc.into_rpc());

    Ok(server_handle)
}
