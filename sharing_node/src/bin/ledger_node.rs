use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use sharing_node::api::{ledger::create_router, LedgerState};
use sharing_node::bridges::HttpStateSink;
use sharing_node::ledger::{CredentialRegistry, InMemoryRail, PricingRule};
use sharing_node::{EscrowLedger, NodeConfig, RequestLedger, SyncBridge};

#[derive(Parser)]
#[clap(name = "ledger_node")]
#[clap(about = "Escrow ledger node for resource-sharing requests")]
struct Args {
    /// Configuration file (YAML); defaults apply when it is missing
    #[clap(long, default_value = "config/sharing.yaml")]
    config_path: PathBuf,

    /// Override the listen address
    #[clap(long)]
    listen_addr: Option<String>,

    /// Override the middleware base URL status changes are pushed to
    #[clap(long)]
    middleware_url: Option<String>,

    /// Do not relay status changes to the middleware
    #[clap(long)]
    no_relay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = NodeConfig::load(Some(args.config_path.as_path()))
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    if let Some(listen_addr) = args.listen_addr {
        config.ledger.listen_addr = listen_addr;
    }
    if let Some(middleware_url) = args.middleware_url {
        config.bridge.middleware_url = middleware_url;
    }

    info!("Starting ledger node");
    info!("Ledger address: {:?}", config.ledger.address);
    info!("Owner: {:?}", config.ledger.owner);

    let pricing = PricingRule::new(config.ledger.rate_per_minute_wei()?);
    let ledger = Arc::new(EscrowLedger::new(
        config.ledger.address,
        config.ledger.owner,
        pricing,
        Arc::new(InMemoryRail::new()),
    ));
    let credentials = CredentialRegistry::from_entries(&config.ledger.credentials);
    if !credentials.identifies(config.ledger.owner) {
        warn!("No credential maps to the owner; requests cannot be confirmed over HTTP");
    }

    let bridge = if args.no_relay {
        info!("Relay to the middleware disabled");
        None
    } else {
        let sink = HttpStateSink::new(
            &config.bridge.middleware_url,
            config.bridge.request_timeout(),
        )?;
        let bridge = Arc::new(SyncBridge::new(
            Arc::new(sink),
            config.bridge.retry_policy(),
        ));
        bridge.spawn_relay(ledger.subscribe());
        info!("Relaying status changes to {}", config.bridge.middleware_url);
        Some(bridge)
    };

    let app = create_router(LedgerState {
        ledger: ledger.clone(),
        credentials: Arc::new(credentials),
    });

    let listener = tokio::net::TcpListener::bind(&config.ledger.listen_addr).await?;
    info!("Ledger API listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    if let Some(bridge) = bridge {
        bridge.shutdown();
    }
    info!("Ledger node stopped with {} requests on record", ledger.len());
    Ok(())
}
