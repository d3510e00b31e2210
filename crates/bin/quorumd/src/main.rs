use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use quorum_node::embedding::{Embedder, HashingEmbedder, HttpEmbedder};
use quorum_node::queue::{enqueue_json, SledQueue, WorkQueue};
use quorum_node::registry::{NodeRegistry, StoreRegistry};
use quorum_node::store::{KvStore, SledStore};
use quorum_node::task::TaskRequest;
use quorum_node::transport::{GossipTransport, WakuClient};
use quorum_node::worker::{self, shutdown_channel};
use quorum_node::{Aggregator, Config, Monitor, Publisher};
use quorum_primitives::KeyPair;

#[derive(Parser, Debug)]
#[command(name = "quorumd")]
#[command(about = "quorum task network node", long_about = None)]
struct Args {
    /// toml config file
    #[arg(long, short, env = "QUORUM_CONFIG")]
    config: Option<PathBuf>,

    /// waku relay rest endpoint
    #[arg(long, env = "QUORUM_GOSSIP_URL")]
    gossip_url: Option<String>,

    /// node private key, hex
    #[arg(long, env = "QUORUM_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// sled database directory
    #[arg(long, env = "QUORUM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// embedding service endpoint
    #[arg(long, env = "QUORUM_EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run the monitor, publisher and aggregator workers
    Run,
    /// generate a fresh node key
    Keygen,
    /// print the address of the configured key
    Address,
    /// queue a task request (the node must not hold the database)
    Enqueue {
        #[arg(long)]
        prompt: String,
        /// task id; generated by the publisher when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// check the gossip relay
    Health,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(url) = &self.gossip_url {
            config.gossip_url = url.clone();
        }
        if let Some(key) = &self.private_key {
            config.private_key = Some(key.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(url) = &self.embedding_url {
            config.embedding_url = Some(url.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorumd=info,quorum_node=info".into()),
        )
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Keygen => {
            let key = KeyPair::generate();
            println!("private key: {}", key.secret_hex());
            println!("public key:  {}", key.public_key_hex());
            println!("address:     {}", key.address());
            Ok(())
        }
        Command::Address => {
            let config = args.load_config()?;
            println!("{}", config.keypair()?.address());
            Ok(())
        }
        Command::Enqueue { prompt, id } => {
            let config = args.load_config()?;
            let queue = SledQueue::open(&config.data_dir)
                .with_context(|| format!("opening {}", config.data_dir.display()))?;
            let request = TaskRequest {
                id: id.clone(),
                prompt: prompt.clone(),
            }
            .validated()?;
            enqueue_json(&queue, &config.channels.synthesis, &request).await?;
            queue.flush()?;
            info!("queued task request on {}", config.channels.synthesis);
            Ok(())
        }
        Command::Health => {
            let config = args.load_config()?;
            let relay = WakuClient::from_config(&config)?;
            if relay.health_check().await? {
                println!("relay at {} is healthy", config.gossip_url);
                Ok(())
            } else {
                bail!("relay at {} is not healthy", config.gossip_url)
            }
        }
        Command::Run => run(args.load_config()?).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let key = config.keypair().context("`run` needs a node key")?;

    info!("starting quorumd");
    info!("  address: {}", key.address());
    info!("  relay: {}", config.gossip_url);
    info!("  database: {}", config.data_dir.display());
    info!("  quorum size: {}, fpr {}", config.quorum_size, config.false_positive_rate);
    info!("  membership gate: {:?}", config.membership_gate);

    let relay = WakuClient::from_config(&config)?;
    if !relay.health_check().await? {
        warn!("relay at {} is not healthy yet, workers will retry", config.gossip_url);
    }
    let transport: Arc<dyn GossipTransport> = Arc::new(relay);

    let db = sled::open(&config.data_dir)
        .with_context(|| format!("opening {}", config.data_dir.display()))?;
    let queue: Arc<dyn WorkQueue> = Arc::new(SledQueue::from_db(db.clone())?);
    let sled_store = Arc::new(SledStore::from_db(&db)?);
    let registry: Arc<dyn NodeRegistry> =
        Arc::new(StoreRegistry::new(sled_store.clone(), config.node_ttl_secs));
    let store: Arc<dyn KvStore> = sled_store;

    let embedder: Arc<dyn Embedder> = match &config.embedding_url {
        Some(url) => {
            info!("  embeddings: {}", url);
            Arc::new(HttpEmbedder::new(url, config.request_timeout())?)
        }
        None => {
            warn!("no embedding service configured, using the local hashing embedder");
            Arc::new(HashingEmbedder::default())
        }
    };

    let (shutdown_handle, shutdown) = shutdown_channel();
    let mut workers = JoinSet::new();

    for _ in 0..config.workers.monitor {
        let monitor = Monitor::new(&config, key.clone(), transport.clone(), registry.clone());
        workers.spawn(worker::run_monitor(monitor, shutdown.clone()));
    }
    for _ in 0..config.workers.publisher {
        let publisher = Publisher::new(
            &config,
            key.clone(),
            transport.clone(),
            queue.clone(),
            store.clone(),
            registry.clone(),
        );
        workers.spawn(worker::run_publisher(publisher, shutdown.clone()));
    }
    for _ in 0..config.workers.aggregator {
        let aggregator = Aggregator::new(
            &config,
            transport.clone(),
            queue.clone(),
            store.clone(),
            embedder.clone(),
        );
        workers.spawn(worker::run_aggregator(aggregator, shutdown.clone()));
    }
    info!(
        "spawned {} monitor, {} publisher, {} aggregator workers",
        config.workers.monitor, config.workers.publisher, config.workers.aggregator
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, finishing current cycles");
        }
        Some(res) = workers.join_next() => {
            if let Err(e) = res {
                error!("worker exited unexpectedly: {}", e);
            }
        }
    }
    shutdown_handle.trigger();

    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!("worker failed: {}", e);
        }
    }
    db.flush_async().await?;
    info!("quorumd stopped");
    Ok(())
}
