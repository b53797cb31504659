pub mod config;
pub mod error;
pub mod escalation;
pub mod matcher;
pub mod prompting;
pub mod provider;
pub mod realtime;
pub mod resolver;
pub mod routes;
pub mod rules;
pub mod session;
pub mod store;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::provider::{CompletionProvider, OpenAiProvider};
use crate::realtime::RealtimeHub;
use crate::rules::RuleCache;
use crate::session::SessionCoordinator;
use crate::store::{MemoryStore, PgStore, Store};
use crate::types::AppState;

/// Wire the engine together around the given store and provider. Exposed so
/// tests can inject the in-memory store and a scripted provider.
pub fn build_state(
    config: Config,
    store: Arc<dyn Store>,
    provider: Arc<dyn CompletionProvider>,
) -> Arc<AppState> {
    let hub = Arc::new(RealtimeHub::new());
    let rules = Arc::new(RuleCache::new(store.clone(), config.rule_cache_ttl));
    let coordinator = Arc::new(SessionCoordinator::new(
        store.clone(),
        hub.clone(),
        rules.clone(),
        provider.clone(),
        config.clone(),
    ));
    Arc::new(AppState {
        config,
        store,
        provider,
        rules,
        hub,
        coordinator,
    })
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("connecting to Postgres store");
            Arc::new(PgStore::connect(url).await?)
        }
        None => {
            tracing::warn!("no DATABASE_URL configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(config.provider_timeout + Duration::from_secs(2))
        .build()?;
    let provider: Arc<dyn CompletionProvider> =
        Arc::new(OpenAiProvider::new(client, &config.provider_base_url));

    let port = config.port;
    let state = build_state(config, store, provider);
    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "reply server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
