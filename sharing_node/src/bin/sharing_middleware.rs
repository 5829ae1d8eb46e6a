use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use sharing_node::agent::AgentClient;
use sharing_node::api::{self, LedgerState, MiddlewareState};
use sharing_node::config::StorageBackend;
use sharing_node::ledger::{CredentialRegistry, InMemoryRail, PricingRule};
use sharing_node::middleware::{
    LedgerGateway, LocalLedgerGateway, NodeServerClient, RequestService, ServiceSink,
};
use sharing_node::orchestrator::RestorationScheduler;
use sharing_node::storage::{MemoryRequestStore, SledRequestStore};
use sharing_node::{
    EscrowLedger, LifecycleOrchestrator, NodeConfig, RequestLedger, RequestStore, SyncBridge,
};

#[derive(Parser)]
#[clap(name = "sharing_middleware")]
#[clap(about = "Request mirror and lifecycle orchestrator for resource-sharing requests")]
struct Args {
    /// Configuration file (YAML); defaults apply when it is missing
    #[clap(long, default_value = "config/sharing.yaml")]
    config_path: PathBuf,

    /// Override the listen address
    #[clap(long)]
    listen_addr: Option<String>,

    /// Override the ledger node API URL
    #[clap(long)]
    node_server_url: Option<String>,

    /// Override the network control agent URL
    #[clap(long)]
    agent_url: Option<String>,

    /// Keep the request mirror in memory
    #[clap(long)]
    in_memory: bool,

    /// Host the escrow ledger in this process instead of calling a ledger node
    #[clap(long)]
    embedded_ledger: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = NodeConfig::load(Some(args.config_path.as_path()))
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    if let Some(listen_addr) = args.listen_addr {
        config.middleware.listen_addr = listen_addr;
    }
    if let Some(node_server_url) = args.node_server_url {
        config.middleware.node_server_url = node_server_url;
    }
    if let Some(agent_url) = args.agent_url {
        config.agent.url = agent_url;
    }
    if args.in_memory {
        config.storage.backend = StorageBackend::Memory;
    }

    info!("Starting sharing middleware");
    info!("Agent: {} (gNB {})", config.agent.url, config.agent.gnb_id);

    let store: Arc<dyn RequestStore> = match config.storage.backend {
        StorageBackend::Memory => {
            info!("Request mirror kept in memory");
            Arc::new(MemoryRequestStore::new())
        }
        StorageBackend::Sled => {
            info!("Request mirror at {}", config.storage.data_dir);
            Arc::new(
                SledRequestStore::open(&config.storage.data_dir)
                    .with_context(|| format!("opening {}", config.storage.data_dir))?,
            )
        }
    };

    let agent = Arc::new(AgentClient::new(&config.agent)?);
    let mut orchestrator =
        LifecycleOrchestrator::new(store.clone(), agent.clone(), config.agent.default_plmn.clone());
    let restoration = if config.agent.restore_after_duration {
        let scheduler = Arc::new(RestorationScheduler::new(store.clone(), agent));
        orchestrator = orchestrator.with_restoration(scheduler.clone());
        Some(scheduler)
    } else {
        None
    };
    let orchestrator = Arc::new(orchestrator);

    let embedded = if args.embedded_ledger {
        let pricing = PricingRule::new(config.ledger.rate_per_minute_wei()?);
        let ledger: Arc<dyn RequestLedger> = Arc::new(EscrowLedger::new(
            config.ledger.address,
            config.ledger.owner,
            pricing,
            Arc::new(InMemoryRail::new()),
        ));
        Some(ledger)
    } else {
        None
    };
    let credentials = CredentialRegistry::from_entries(&config.ledger.credentials);

    let gateway: Arc<dyn LedgerGateway> = match &embedded {
        Some(ledger) => {
            info!("Escrow ledger embedded at {:?}", ledger.address());
            Arc::new(LocalLedgerGateway::new(ledger.clone(), credentials.clone()))
        }
        None => {
            info!("Forwarding requests to {}", config.middleware.node_server_url);
            Arc::new(NodeServerClient::new(
                &config.middleware.node_server_url,
                std::time::Duration::from_secs(config.middleware.request_timeout_secs),
            )?)
        }
    };

    let service = Arc::new(RequestService::new(store.clone(), gateway, orchestrator));

    let mut bridge = None;
    if let Some(ledger) = embedded {
        let relay = Arc::new(SyncBridge::new(
            Arc::new(ServiceSink::new(service.clone())),
            config.bridge.retry_policy(),
        ));
        relay.spawn_relay(ledger.subscribe());

        let ledger_app = api::ledger::create_router(LedgerState {
            ledger,
            credentials: Arc::new(credentials),
        });
        let ledger_listener = tokio::net::TcpListener::bind(&config.ledger.listen_addr).await?;
        info!("Ledger API listening on {}", ledger_listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(ledger_listener, ledger_app.into_make_service()).await {
                log::error!("Ledger API stopped: {}", e);
            }
        });
        bridge = Some(relay);
    }

    let app = api::middleware::create_router(MiddlewareState { service });
    let listener = tokio::net::TcpListener::bind(&config.middleware.listen_addr).await?;
    info!("Middleware API listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    if let Some(bridge) = bridge {
        bridge.shutdown();
    }
    if let Some(scheduler) = restoration {
        info!("Dropping {} pending restorations", scheduler.pending());
        scheduler.shutdown();
    }
    Ok(())
}
