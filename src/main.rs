use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use realm_server::config::ServerConfig;
use realm_server::game::constants::net::PROTOCOL_VERSION;
use realm_server::game::definitions::Definitions;
use realm_server::game::persistence::JsonFileStore;
use realm_server::game::region::Region;
use realm_server::game::scheduler::{start_scheduler, Scheduler};
use realm_server::game::snapshot;
use realm_server::game::systems::ai::AiTask;
use realm_server::game::systems::autosave::AutosaveTask;
use realm_server::game::systems::regen::RegenTask;
use realm_server::game::systems::respawn::RespawnTask;
use realm_server::game::world::World;
use realm_server::metrics::{self, Metrics};
use realm_server::net::dos_protection::Admission;
use realm_server::net::game_session::ServerContext;
use realm_server::net::session::SessionDirectory;
use realm_server::net::transport::GameServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Realm Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}, max_users={}, data_dir={}",
        config.game_addr(),
        config.max_users,
        config.data_dir.display()
    );

    // Static data
    let definitions = Arc::new(Definitions::load_or_empty(&config.definitions_path()));
    let cache = if cfg!(feature = "region_cache") {
        config.region_cache.as_deref()
    } else {
        None
    };
    let mut region_data = snapshot::load_regions(&config.regions_dir(), cache)?;
    let mut regions = Vec::with_capacity(region_data.len());
    for mut data in region_data.drain(..) {
        let dropped = snapshot::resolve_definitions(&mut data, definitions.as_ref());
        if dropped > 0 {
            warn!("Region {} lost {} stale references", data.id, dropped);
        }
        regions.push(Region::from_data(data)?);
    }
    if regions.is_empty() {
        warn!("No regions loaded from {}", config.regions_dir().display());
    }

    // Shared state
    let metrics = Arc::new(Metrics::new());
    let sessions = Arc::new(SessionDirectory::new(metrics.clone()));
    let region_count = regions.len();
    let world = Arc::new(World::new(
        regions,
        definitions,
        sessions.clone(),
        config.world_settings(),
    ));
    let spawned = world.spawn_static_npcs();
    metrics
        .regions_loaded
        .store(region_count as u64, Ordering::Relaxed);
    info!("World ready: {} regions, {} NPCs", region_count, spawned);

    let store = Arc::new(JsonFileStore::open(config.characters_dir())?);

    // Periodic tasks
    let mut scheduler = Scheduler::new(config.scheduler_tick);
    scheduler.register(AiTask::new(config.ai_tick, rand::random()));
    scheduler.register(RegenTask::new(config.regen_tick, rand::random()));
    scheduler.register(RespawnTask::new(config.scheduler_tick, rand::random()));
    scheduler.register(AutosaveTask::new(config.autosave_period, store.clone()));
    let scheduler = Arc::new(Mutex::new(scheduler));
    let scheduler_task = start_scheduler(
        world.clone(),
        scheduler,
        config.scheduler_tick,
        metrics.clone(),
    );

    let metrics_clone = metrics.clone();
    let world_clone = world.clone();
    let metrics_addr = config.metrics_addr();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, world_clone, metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let ctx = Arc::new(ServerContext {
        world: world.clone(),
        store: store.clone(),
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        protocol_version: PROTOCOL_VERSION,
    });
    let server = GameServer::bind(config.game_addr(), ctx, Admission::new(config.admission())).await?;
    info!("Server ready on {}", server.local_addr()?);

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Cleanup
    scheduler_task.abort();
    for session in sessions.sessions() {
        sessions.kick(session.index, "Server is shutting down.");
    }
    let final_save = tokio::task::spawn_blocking(move || {
        AutosaveTask::new(config.autosave_period, store).run_once(&world)
    })
    .await?;
    info!("Final save: {} characters ({} failed)", final_save.0, final_save.1);
    info!("Server stopped");

    Ok(())
}
