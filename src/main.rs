use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether::auth::JwtService;
use tether::circles_repo::MemoryCirclesRepository;
use tether::cleanup_worker::CleanupWorker;
use tether::config::Config;
use tether::connection::ConnectionContext;
use tether::dispatcher::{OutboundDispatcher, SmtpSettings};
use tether::emergency::EmergencyAlerts;
use tether::geofence_worker::GeofenceWorker;
use tether::hub::Hub;
use tether::kv::MemoryKvStore;
use tether::location_worker::LocationWorker;
use tether::locations_repo::MemoryLocationsRepository;
use tether::messages::MessageRouter;
use tether::notification_worker::NotificationWorker;
use tether::notifications_repo::MemoryNotificationsRepository;
use tether::places_repo::MemoryPlacesRepository;
use tether::users_repo::MemoryUsersRepository;
use tether::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Realtime location-sharing server")]
struct Args {
    /// Path to a TOML config file; defaults and environment overrides
    /// apply when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    tether::metrics::init_metrics_recorder();
    tether::metrics::initialize_metrics();
    let metrics_port = config.server.metrics_port;
    tokio::spawn(async move {
        tether::metrics::start_metrics_server(metrics_port).await;
    });

    let shutdown = CancellationToken::new();

    // Storage behind the repository traits. The in-process stores here are
    // the reference implementation; a deployment wires in its own.
    let locations_repo = Arc::new(MemoryLocationsRepository::new());
    let places_repo = Arc::new(MemoryPlacesRepository::new());
    let circles_repo = Arc::new(MemoryCirclesRepository::new());
    let users_repo = Arc::new(MemoryUsersRepository::new());
    let notifications_repo = Arc::new(MemoryNotificationsRepository::new());
    let kv = Arc::new(MemoryKvStore::new());

    let hub = Hub::spawn(users_repo.clone(), shutdown.clone());

    let dispatcher = match (&config.notify.smtp_server, &config.notify.smtp_username) {
        (Some(server), Some(username)) => {
            let settings = SmtpSettings {
                server: server.clone(),
                port: config.notify.smtp_port,
                username: username.clone(),
                password: config.notify.smtp_password.clone().unwrap_or_default(),
                from_email: config.notify.from_email.clone(),
                from_name: config.notify.from_name.clone(),
            };
            match OutboundDispatcher::with_smtp(settings) {
                Ok(dispatcher) => Arc::new(dispatcher),
                Err(e) => {
                    warn!(error = %e, "SMTP setup failed, falling back to log delivery");
                    Arc::new(OutboundDispatcher::log_only())
                }
            }
        }
        _ => Arc::new(OutboundDispatcher::log_only()),
    };

    let notifications = NotificationWorker::new(
        config.notify.clone(),
        notifications_repo.clone(),
        users_repo.clone(),
        dispatcher,
        hub.clone(),
    )
    .spawn(shutdown.clone());

    let geofence = GeofenceWorker::new(
        config.geofence.clone(),
        places_repo.clone(),
        circles_repo.clone(),
        users_repo.clone(),
        notifications.clone(),
        hub.clone(),
        kv.clone(),
    )
    .spawn(shutdown.clone());

    let location_worker = LocationWorker::new(
        config.location.clone(),
        locations_repo.clone(),
        circles_repo.clone(),
        users_repo.clone(),
        geofence.clone(),
        hub.clone(),
    )
    .spawn(shutdown.clone());

    CleanupWorker::new(
        config.cleanup.clone(),
        config.location.retention_days,
        locations_repo.clone(),
        notifications_repo.clone(),
        kv.clone(),
    )
    .spawn(shutdown.clone());

    let ctx = Arc::new(ConnectionContext {
        hub: hub.clone(),
        validator: Arc::new(JwtService::new(&config.auth.jwt_secret)),
        circles_repo: circles_repo.clone(),
        location_worker: location_worker.clone(),
        messages: Arc::new(MessageRouter::new(hub.clone(), circles_repo.clone())),
        emergency: Arc::new(EmergencyAlerts::new(
            hub.clone(),
            circles_repo,
            users_repo,
            notifications.clone(),
        )),
        ws: config.ws.clone(),
        rate: config.rate.clone(),
        shutdown: shutdown.clone(),
    });

    let state = AppState {
        ctx,
        hub,
        started_at: chrono::Utc::now(),
    };

    // Ctrl+C drains the ingest queues, then cancels everything.
    {
        let shutdown = shutdown.clone();
        let location_worker = location_worker.clone();
        let geofence = geofence.clone();
        let notifications = notifications.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Received shutdown signal, draining queues");
            for i in 1..=60u32 {
                let depth = location_worker.queue_depth()
                    + geofence.queue_depth()
                    + notifications.queue_depth();
                if depth == 0 {
                    info!("All queues drained");
                    break;
                }
                info!(second = i, depth, "Waiting for queues to drain");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            shutdown.cancel();
        });
    }

    web::serve(state, &config.server.bind_addr).await?;
    info!("Server stopped");
    Ok(())
}
