use axum::{
    error_handling::HandleErrorLayer,
    routing::{get, post},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Instant;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use slotbook_server::{
    availability, booking::StateMachine, catalog::Catalog, config::AppConfig, db,
    error::BookingError, events::EventBus, handlers, locks::LockManager, notifier,
    payments::{DisabledPayments, HttpPaymentProvider, PaymentProvider}, workers, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = AppConfig::from_env()?;

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    db::run_migrations(&pool, &config.policy_defaults).await?;

    // ── Core wiring ──
    let catalog = Catalog::new(pool.clone(), config.settings_cache_ttl);
    let bus = EventBus::new(256);

    let payments: Arc<dyn PaymentProvider> = match &config.payment_api_url {
        Some(api_url) => Arc::new(HttpPaymentProvider::new(
            api_url.clone(),
            config.payment_shop_id.clone(),
            config.payment_secret_key.clone(),
        )),
        None => {
            tracing::warn!("PAYMENT_API_URL not set — online payments disabled");
            Arc::new(DisabledPayments)
        }
    };

    let notify: Arc<dyn notifier::Notifier> = match &config.notifier_webhook_url {
        Some(url) => Arc::new(notifier::WebhookNotifier::new(url.clone())),
        None => Arc::new(notifier::LogNotifier),
    };

    let machine = StateMachine::new(
        pool.clone(),
        LockManager::new(),
        bus.clone(),
        payments.clone(),
        catalog.clone(),
        config.currency.clone(),
    );
    let engine = availability::Engine::new(catalog.clone(), config.business_timezone);

    // ── Background tasks ──
    workers::spawn_all(
        machine.clone(),
        catalog.clone(),
        bus.clone(),
        payments.clone(),
        workers::WorkerSettings::default(),
    );
    tokio::spawn(notifier::forward_events(bus.clone(), notify));

    // Catalog cache invalidation rides the event bus.
    {
        let bus = bus.clone();
        let catalog = catalog.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if matches!(
                            envelope.event,
                            slotbook_server::events::DomainEvent::CatalogInvalidated
                        ) {
                            catalog.invalidate();
                            tracing::info!("catalog cache invalidated");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Safe side: anything might have changed meanwhile.
                        catalog.invalidate();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        catalog,
        engine,
        machine,
        bus,
        started_at: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Every request carries a deadline; a timed-out request surfaces the
    // stable `timeout` tag and the rolled-back transaction leaves no
    // partial writes.
    let deadline = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|_err: BoxError| async {
            BookingError::Timeout
        }))
        .layer(tower::timeout::TimeoutLayer::new(config.request_timeout));

    // ── Router ──
    let app = Router::new()
        // Health check (no auth required)
        .route("/api/health", get(handlers::health::health))
        // Payment webhook (no auth — the provider sends it)
        .route("/api/payments/webhook", post(handlers::payment::payment_webhook))
        // Catalog + availability
        .route("/api/services", get(handlers::client::list_services))
        .route("/api/staff", get(handlers::client::list_staff))
        .route("/api/availability/days", get(handlers::client::available_days))
        .route("/api/availability/slots", get(handlers::client::slots))
        .route("/api/quote", post(handlers::client::quote))
        .route("/api/slots/check", post(handlers::client::check_slot))
        // Booking lifecycle
        .route("/api/bookings", get(handlers::booking::list))
        .route("/api/bookings/hold", post(handlers::booking::hold))
        .route("/api/bookings/{id}/finalize", post(handlers::booking::finalize))
        .route("/api/bookings/{id}/reschedule", post(handlers::booking::reschedule))
        .route("/api/bookings/{id}/cancel", post(handlers::booking::cancel))
        .route("/api/bookings/{id}/rate", post(handlers::booking::rate))
        // Admin endpoints
        .route("/api/admin/bookings", get(handlers::admin::list_bookings))
        .route("/api/admin/bookings/{id}/cancel", post(handlers::admin::cancel_booking))
        .route("/api/admin/bookings/{id}/done", post(handlers::admin::mark_done))
        .route("/api/admin/bookings/{id}/no-show", post(handlers::admin::mark_no_show))
        .route("/api/admin/catalog/invalidate", post(handlers::admin::invalidate_catalog))
        .layer(deadline)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("slotbook server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
