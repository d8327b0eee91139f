pub mod availability;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod locks;
pub mod models;
pub mod notifier;
pub mod payments;
pub mod policy;
pub mod pricing;
pub mod testing;
pub mod workers;

use std::time::Instant;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: config::AppConfig,
    pub catalog: catalog::Catalog,
    pub engine: availability::Engine,
    pub machine: booking::StateMachine,
    pub bus: events::EventBus,
    pub started_at: Instant,
}
