use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_api::collab::{MemoryAuth, MemoryDirectory, MemoryPersistence};
use gateway_api::config::Config;
use gateway_api::gateway::fanout::{FanoutBus, LocalBus, RedisBus};
use gateway_api::gateway::router::{run_fanout_dispatcher, run_presence_reporter, EventRouter};
use gateway_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let port = config.port;

    let bus: Arc<dyn FanoutBus> = match &config.redis_url {
        Some(url) => {
            let bus = RedisBus::connect(
                url,
                Duration::from_millis(config.fanout_backoff_base_ms),
                Duration::from_millis(config.fanout_backoff_cap_ms),
            )
            .await
            .expect("fanout broker unreachable at startup");
            tracing::info!(process_id = %config.process_id, "using redis fanout bus");
            Arc::new(bus)
        }
        None => {
            tracing::info!(process_id = %config.process_id, "no REDIS_URL, using in-memory fanout bus");
            Arc::new(LocalBus::new())
        }
    };

    // In-memory collaborators. Production embeds this crate as a library and
    // injects real auth/directory/persistence services here.
    let auth = Arc::new(MemoryAuth::new());
    if let (Ok(token), Ok(user)) = (std::env::var("DEV_TOKEN"), std::env::var("DEV_USER")) {
        auth.issue(&token, &user);
        tracing::warn!(%user, "dev credential issued from environment");
    }
    let directory = Arc::new(MemoryDirectory::new());
    let persistence = Arc::new(MemoryPersistence::new());

    let router = Arc::new(EventRouter::new(
        config.clone(),
        bus,
        auth,
        directory,
        persistence,
    ));

    tokio::spawn(run_fanout_dispatcher(router.clone()));
    tokio::spawn(run_presence_reporter(router.clone()));

    let state = AppState { router };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(gateway_api::gateway::server::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gateway-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
