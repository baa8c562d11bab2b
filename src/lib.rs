pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod registry;
pub mod seed;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{EavError, EavResult, FieldError, RegistrationError, StoreError};
pub use logic::{AttributeView, EavService};

// Export all model types
pub use model::*;

pub use registry::{EavRegistry, EntityDescriptor, FieldDescriptor, RegisterOptions};

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::AppConfig;

/// Router for a store, ready to serve.
pub fn build_router<S: Store + 'static>(service: EavService<S>) -> axum::Router {
    routes::create_router().with_state(Arc::new(service))
}

async fn serve_with<S: Store + 'static>(
    store: Arc<S>,
    registry: Arc<EavRegistry>,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let service = EavService::new(store, registry, config.eav.max_retries);

    // Load seed data for demonstration (optional)
    if config.eav.load_seed_data {
        log::info!("Loading seed data...");
        seed::load_seed_data(&service).await?;
        log::info!("Seed data loaded successfully");
    }

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    log::info!("EAV server running on http://{}", bind_address);

    axum::serve(listener, build_router(service)).await?;

    Ok(())
}

/// Build the registry, open the configured store and serve until shutdown.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let registry = Arc::new(config.registry()?);
    for entity in registry.iter() {
        log::info!(
            "EAV enabled on '{}' (accessor '{}')",
            entity.name(),
            entity.accessor()
        );
    }

    if config.database.in_memory {
        log::warn!("Using the in-memory store; data is lost on shutdown");
        let store = MemoryStore::with_enum_value_floor(config.eav.enum_value_sequence_floor);
        return serve_with(Arc::new(store), registry, &config).await;
    }

    log::info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let postgres_store = PostgresStore::new(
        &database_url,
        config.database.max_connections.unwrap_or(20),
    )
    .await?;

    log::info!("Running database migrations...");
    postgres_store
        .migrate()
        .await
        .context("running migrations")?;

    serve_with(Arc::new(postgres_store), registry, &config).await
}
