use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod admin;
mod booking;
mod config;
mod error;
mod inbound;
mod lifecycle;
mod middleware;
mod models;
mod payment;
mod repositories;
mod routes;
mod square;
mod state;
#[cfg(test)]
mod testing;
mod topics;
mod validation;

use common::database::{health_check, init_pool};
use common::mqtt::{MqttGateway, OfflinePublisher, Publisher};
use tokio::net::TcpListener;

use crate::{
    booking::BookingBroker,
    config::PortalConfig,
    inbound::InboundRouter,
    lifecycle::LifecycleEngine,
    middleware::AdminAuth,
    repositories::SqliteSessionStore,
    square::SquareClient,
    state::{AppState, SquareInfo},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting EV portal");

    let config = PortalConfig::load()?;

    // Initialize database connection pool
    let pool = init_pool(&config.database).await?;
    if health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }
    let store = SqliteSessionStore::new(pool);
    store.init_schema().await?;

    // Payment processor
    let mut square = SquareClient::new(config.square.clone(), config.timeouts.processor)?;
    if square.config().location_id.is_empty() {
        match square.fetch_first_location_id().await {
            Ok(location_id) => {
                info!("Using Square location {}", location_id);
                square.set_location_id(location_id);
            }
            Err(e) => warn!("Could not resolve a Square location, card payments will fail: {}", e),
        }
    }
    let square_info = SquareInfo {
        app_id: square.config().app_id.clone(),
        location_id: square.config().location_id.clone(),
        sdk_url: square.config().sdk_url().to_string(),
    };

    // Message bus
    let (bus, event_loop) = match &config.mqtt {
        Some(mqtt) => {
            let (gateway, event_loop) = MqttGateway::connect(mqtt, topics::subscriptions(&config.home_id));
            let bus: Arc<dyn Publisher> = Arc::new(gateway);
            (bus, Some(event_loop))
        }
        None => {
            let bus: Arc<dyn Publisher> = Arc::new(OfflinePublisher);
            (bus, None)
        }
    };

    let engine = LifecycleEngine::new(
        Arc::new(store),
        Arc::new(square),
        bus.clone(),
        config.timeouts.engine_settings(),
    );
    let booking = BookingBroker::new(bus.clone(), config.timeouts.response, config.charge_cents);

    if let Some(event_loop) = event_loop {
        let inbound = Arc::new(InboundRouter::new(engine.clone(), booking.clone()));
        tokio::spawn(event_loop.run(inbound));
    }

    let admin = config
        .admin
        .enabled
        .then(|| AdminAuth::new(&config.admin.username, &config.admin.password));

    let app_state = AppState {
        engine,
        booking,
        bus,
        home_id: config.home_id.clone(),
        charger_id: config.charger_id.clone(),
        response_timeout: config.timeouts.response,
        square: square_info,
        admin,
    };

    info!("EV portal initialized successfully");

    // Start the web server
    let app = routes::create_router(app_state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("EV portal listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shutting down EV portal");
    Ok(())
}
