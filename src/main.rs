use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use messaging_engine::bus::redis::RedisBus;
use messaging_engine::bus::memory::InProcessBus;
use messaging_engine::bus::EventBus;
use messaging_engine::cache::TypingCache;
use messaging_engine::config::Config;
use messaging_engine::db;
use messaging_engine::error::{AppError, AppResult};
use messaging_engine::gateway;
use messaging_engine::logging;
use messaging_engine::services::{sweeper, ConversationService, ServiceLimits};
use messaging_engine::state::AppState;
use messaging_engine::store::postgres::PgConversationStore;

#[tokio::main]
async fn main() -> AppResult<()> {
    logging::init_tracing();

    let config = Config::from_env()?;
    let pool = db::init_pool(&config.database_url).await?;
    db::MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| AppError::StartServer(format!("migrations failed: {e}")))?;
    info!("database ready");

    let store = Arc::new(PgConversationStore::new(pool));
    let typing = Arc::new(TypingCache::new(Duration::from_secs(config.typing_ttl_secs)));

    let bus: Arc<dyn EventBus> = match &config.redis_url {
        Some(redis_url) => {
            let bus = Arc::new(RedisBus::new(redis_url)?);
            let listener = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.run_listener().await {
                    error!("redis listener exited: {e}");
                }
            });
            info!("event fan-out via redis");
            bus
        }
        None => {
            info!("event fan-out in process only");
            Arc::new(InProcessBus::new())
        }
    };

    let service = Arc::new(ConversationService::new(
        store,
        bus.clone(),
        typing,
        ServiceLimits::from_config(&config),
    ));

    sweeper::spawn(
        service.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );

    let state = AppState {
        service,
        bus,
        config: Arc::new(config.clone()),
    };
    let app = gateway::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::StartServer(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "messaging engine listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    Ok(())
}
