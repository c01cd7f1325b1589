mod batch;
mod config;
mod feed;
mod handlers;
mod lifecycle;
mod models;
mod presence;
mod projection;
mod reconciler;
mod reminders;
mod routes;
mod store;

use std::sync::Arc;

use axum::http::Method;
use chrono::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use counselconnect_common::AppError;
use counselconnect_database::create_pool;

use crate::config::AvailabilityConfig;
use crate::feed::ChangeFeed;
use crate::lifecycle::SessionLifecycle;
use crate::presence::OnlineStatusController;
use crate::reconciler::Reconciler;
use crate::reminders::{HttpNotifier, ReminderScheduler};
use crate::store::{ScheduleBoard, ScheduleStore};

#[derive(Clone)]
pub struct AppState {
    pub config: AvailabilityConfig,
    pub db_pool: sqlx::PgPool,
    pub store: ScheduleStore,
    pub board: ScheduleBoard,
    pub lifecycle: SessionLifecycle,
    pub presence: OnlineStatusController,
    pub reminders: ReminderScheduler,
    pub feed: ChangeFeed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "counselconnect_availability=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AvailabilityConfig::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Create database connection pool and run migrations
    let db_pool = create_pool(&config.database).await?;
    counselconnect_database::run_migrations(&db_pool).await?;

    // Engine components
    let tolerance = Duration::seconds(config.engine.booking_match_tolerance_secs);
    let store = ScheduleStore::new(db_pool.clone(), tolerance);
    let board = ScheduleBoard::new(store.clone(), config.engine.board_horizon_days);

    let lifecycle = SessionLifecycle::new(db_pool.clone());
    let presence = OnlineStatusController::new(db_pool.clone(), lifecycle.clone());

    let notifier = Arc::new(HttpNotifier::new(config.engine.reminder_endpoint.clone()));
    let reminders = ReminderScheduler::new(
        db_pool.clone(),
        notifier,
        config.engine.reminder_retention_days,
    );

    // Change feed: pump events into the reconciler loop that owns the
    // board's projection. The subscription handle must outlive the server;
    // dropping it tears the pump down.
    let feed = ChangeFeed::new(&config.redis)?;
    let (_feed_subscription, schedule_rx, booking_rx) = feed.subscribe(None).await?;
    let _reconciler_task = Reconciler::new(board.projection(), schedule_rx, booking_rx).spawn();

    // Seed the board after the subscription is live so no event gap opens
    // between fetch and first event.
    let seeded = board.refresh().await?;
    tracing::info!("schedule board seeded with {} slots", seeded);

    // Build application state
    let app_state = AppState {
        config: config.clone(),
        db_pool,
        store,
        board,
        lifecycle,
        presence,
        reminders,
        feed,
    };

    spawn_background_tasks(&app_state);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any);

    // Build the application
    let app = routes::create_routes()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    // Start the server
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port)).await?;

    tracing::info!(
        "Availability service listening on {}:{}",
        config.server.host,
        config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic batch drivers. Each controller guards itself against
/// overlapping runs, so a tick landing during a long run is skipped.
fn spawn_background_tasks(state: &AppState) {
    let presence = state.presence.clone();
    let auto_status_interval = state.config.engine.auto_status_interval_secs;
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(auto_status_interval));
        loop {
            ticker.tick().await;
            match presence.process_auto_online_status().await {
                Ok(summary) => {
                    if summary.online_changed > 0
                        || summary.sessions_started > 0
                        || summary.sessions_completed > 0
                        || summary.sessions_missed > 0
                    {
                        tracing::info!(
                            online_changed = summary.online_changed,
                            sessions_started = summary.sessions_started,
                            sessions_completed = summary.sessions_completed,
                            sessions_missed = summary.sessions_missed,
                            "auto status tick"
                        );
                    }
                }
                Err(AppError::Conflict(_)) => {
                    tracing::warn!("auto status run still in progress, tick skipped");
                }
                Err(e) => tracing::error!("auto status tick failed: {}", e),
            }
        }
    });

    let reminders = state.reminders.clone();
    let reminder_interval = state.config.engine.reminder_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(reminder_interval));
        loop {
            ticker.tick().await;
            match reminders.process_reminder_jobs().await {
                Ok(summary) if summary.processed > 0 => {
                    tracing::info!(sent = summary.sent, failed = summary.failed, "reminder tick");
                }
                Ok(_) => {}
                Err(AppError::Conflict(_)) => {
                    tracing::warn!("reminder run still in progress, tick skipped");
                }
                Err(e) => tracing::error!("reminder tick failed: {}", e),
            }
            if let Err(e) = reminders.cleanup_expired_reminder_jobs().await {
                tracing::error!("reminder cleanup failed: {}", e);
            }
        }
    });

    // The board window rolls with the calendar, so the startup seed goes
    // stale once the process lives past midnight; periodic refetches keep
    // the covered window honest and drop past-date slots.
    let board = state.board.clone();
    let refresh_interval = state.config.engine.board_refresh_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(refresh_interval));
        // The first tick completes immediately; the board was just seeded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match board.refresh().await {
                Ok(count) => tracing::debug!(slots = count, "schedule board refreshed"),
                Err(e) => tracing::error!("board refresh failed: {}", e),
            }
        }
    });
}
