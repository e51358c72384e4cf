use std::sync::Arc;

use anyhow::Result;
use axum::{routing::post, Router};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cosmos_client::CosmosClient;
use geocode_client::GeocodeClient;
use grok_client::GrokClient;
use originmap_common::Config;
use originmap_import::store::CosmosStore;
use originmap_import::traits::DisabledLogoImporter;
use originmap_import::Importer;

mod routes;

pub struct AppState {
    pub importer: Importer,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("originmap=info".parse()?))
        .init();

    let config = Config::from_env();

    let cosmos = CosmosClient::new(&config.cosmos_endpoint, &config.cosmos_key);
    let store = Arc::new(CosmosStore::new(
        cosmos,
        &config.cosmos_database,
        &config.cosmos_companies_container,
    ));
    let upstream = Arc::new(GrokClient::new(&config.grok_url, &config.grok_api_key));
    let geocoder = Arc::new(GeocodeClient::new(
        config.geocode_url.clone(),
        config.geocode_api_key.clone(),
    ));

    let importer = Importer::new(
        store,
        upstream,
        geocoder,
        Arc::new(DisabledLogoImporter),
        config.hard_cap_ms,
        config.quality.clone(),
        config.resume_auth_configured(),
    );

    let state = Arc::new(AppState { importer });

    // One endpoint, two path aliases — the older clients still post to
    // /api/import/one.
    let app = Router::new()
        .route("/api/import/start", post(routes::import_start))
        .route("/api/import/one", post(routes::import_start))
        .route("/", axum::routing::get(|| async { "ok" }))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!(addr = addr.as_str(), "originmap import API listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
