//! Crop Mapping Pipeline: Binary Entrypoint
//! Boots the Axum HTTP server with the fetch-bands pipeline and the progress websocket.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter `cropmap_pipeline=info,pipeline=info,warn`, overridable via `RUST_LOG`.
/// `PIPELINE_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cropmap_pipeline=info,pipeline=info,warn"));

    let json = std::env::var("PIPELINE_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    // Shuttle may already have installed a global subscriber.
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let router = cropmap_pipeline::app()
        .await
        .map_err(shuttle_runtime::Error::Custom)?;

    Ok(router.into())
}
