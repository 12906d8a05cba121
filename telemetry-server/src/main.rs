//! Telemetry sync server binary.
//!
//! Usage:
//!   # Blog API as the story store
//!   telemetry-server --api https://blog.example --token $TOKEN
//!
//!   # Local RocksDB store
//!   telemetry-server --store rocks --rocks-path ./stories
//!
//!   # Ephemeral, for local testing (stories are created on first push)
//!   telemetry-server --store memory --seed 1

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::info;

use telemetry_collab::{
    HttpStoreConfig, HttpStoryStore, MemoryStoryStore, RocksStoryStore, RoomConfig, ServerConfig,
    StoreConfig, StoryRecord, StoryStore, SyncServer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Http,
    Rocks,
    Memory,
}

/// Real-time collaborative editing server for blog stories.
#[derive(Parser, Debug)]
#[command(name = "telemetry-server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TELEMETRY_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Where stories are loaded from and saved to
    #[arg(long, value_enum, default_value_t = StoreKind::Http)]
    store: StoreKind,

    /// Base URL of the blog API (http store)
    #[arg(long, env = "TELEMETRY_HOST", default_value = "http://localhost:3000")]
    api: String,

    /// Bearer token for the blog API
    #[arg(long, env = "TELEMETRY_TOKEN")]
    token: Option<String>,

    /// Database directory (rocks store)
    #[arg(long, default_value = "./telemetry_data")]
    rocks_path: String,

    /// Empty stories to create at startup (memory store)
    #[arg(long)]
    seed: Vec<String>,

    /// Quiet period before a change is saved, in milliseconds
    #[arg(long, default_value_t = 1000)]
    debounce_ms: u64,

    /// Longest a change may wait to be saved, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    max_wait_ms: u64,

    /// Delay before retrying a failed save, in milliseconds
    #[arg(long, default_value_t = 5000)]
    retry_ms: u64,

    /// How long an empty room stays open, in seconds
    #[arg(long, default_value_t = 0)]
    idle_timeout_secs: u64,

    /// Seconds between heartbeat pings
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

fn open_store(args: &Args) -> Result<Arc<dyn StoryStore>, Box<dyn std::error::Error>> {
    Ok(match args.store {
        StoreKind::Http => {
            let mut config = HttpStoreConfig::new(args.api.clone());
            config.token = args.token.clone();
            info!("using blog API at {}", config.base_url);
            Arc::new(HttpStoryStore::new(config)?)
        }
        StoreKind::Rocks => {
            let config = StoreConfig {
                path: args.rocks_path.clone().into(),
                ..StoreConfig::default()
            };
            let store = RocksStoryStore::open(config)?;
            info!(
                "using RocksDB at {} ({} stories)",
                args.rocks_path,
                store.list_documents()?.len()
            );
            Arc::new(store)
        }
        StoreKind::Memory => {
            let store = MemoryStoryStore::new();
            for id in &args.seed {
                store.insert(id.clone(), StoryRecord::default());
            }
            info!("using in-memory store ({} seeded stories)", args.seed.len());
            Arc::new(store)
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let store = open_store(&args)?;

    let config = ServerConfig {
        bind_addr: args.bind.clone(),
        heartbeat_interval_secs: args.heartbeat_secs,
        room: RoomConfig {
            persist_debounce: Duration::from_millis(args.debounce_ms),
            persist_max_wait: Duration::from_millis(args.max_wait_ms),
            persist_retry: Duration::from_millis(args.retry_ms),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            ..RoomConfig::default()
        },
        ..ServerConfig::default()
    };

    let server = SyncServer::new(config, store);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
