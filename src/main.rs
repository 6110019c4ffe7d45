use std::{sync::Arc, time::Duration};

use axum::Router;
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use tollgate::config::CONFIG;
use tollgate::controller::create_router;
use tollgate::database::{rate_limit, Db};
use tollgate::proxy::dispatch::Dispatcher;
use tollgate::proxy::recorder::UsageRecorder;
use tollgate::registry::ModelRegistry;
use tollgate::state::AppState;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_new(&CONFIG.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = Db::connect(&CONFIG.db_url).expect("failed to open database");
    let registry = Arc::new(ModelRegistry::load(&CONFIG.models_path).expect("failed to load model catalog"));
    let dispatcher = Arc::new(
        Dispatcher::from_config(registry.clone(), &CONFIG.providers, CONFIG.proxy.as_deref())
            .expect("failed to build dispatcher"),
    );
    let recorder = UsageRecorder::start(db.clone());

    let state = AppState {
        db,
        registry,
        dispatcher,
        recorder,
    };

    // Expired windows are never read again; sweep them in the background.
    let janitor_db = state.db.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let cutoff = Utc::now().timestamp_millis() - 2 * rate_limit::WINDOW_MS;
            match rate_limit::prune(&janitor_db, cutoff) {
                Ok(removed) if removed > 0 => {
                    tracing::debug!("pruned {} stale rate limit windows", removed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("rate limit window prune failed: {}", e),
            }
        }
    });

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    tracing::info!("server start at {}{}", &addr, &CONFIG.base_path);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    axum::serve(
        listener,
        Router::new()
            .nest(&CONFIG.base_path, create_router())
            .with_state(state)
            .into_make_service(),
    )
    .await
    .expect("failed to start server");
}
