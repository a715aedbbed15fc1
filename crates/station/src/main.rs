mod ambient;
mod bus;
mod calibration;
mod config;
mod history;
mod mqtt;
mod persist;
mod scheduler;
mod station;
mod transport;
mod web;

use anyhow::{Context, Result};
use std::{env, path::Path, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bus::Wuc;
use mqtt::{MqttPublisher, NoopPublisher, Publisher, Topics};
use persist::Snapshot;
use scheduler::Scheduler;
use station::{SharedState, Station};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("start");

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "server.toml".to_string());
    let cfg = config::load(&config_path)?;
    let plant_configs = config::load_plant_configs(&cfg.files.config)?;

    // ── Hardware ────────────────────────────────────────────────────
    let transport = transport::open(&cfg.bus)
        .context("failed to create connection to microcontroller")?;
    let wuc = Arc::new(Wuc::new(transport));
    let ambient = ambient::start(&cfg.bus)
        .await
        .context("failed to start ambient sensor")?;

    // ── Station ─────────────────────────────────────────────────────
    let mut station = Station::new(plant_configs);
    match persist::load(&cfg.files.data)? {
        Some(snapshot) => {
            snapshot.restore_into(&mut station);
            info!(
                path = %cfg.files.data.display(),
                hourly = station.hourly.temperature.len(),
                minute = station.minute.temperature.len(),
                "snapshot restored"
            );
        }
        None => info!(
            path = %cfg.files.data.display(),
            "no snapshot found, starting with empty history"
        ),
    }
    let shared = station.into_shared();

    // ── Publisher ───────────────────────────────────────────────────
    let publisher: Arc<dyn Publisher> = match &cfg.mqtt.server {
        Some(server) => Arc::new(MqttPublisher::connect(&cfg.mqtt, server)),
        None => {
            info!("no mqtt server configured, publishing disabled");
            Arc::new(NoopPublisher)
        }
    };

    // ── Scheduler ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        Arc::clone(&shared),
        Arc::clone(&wuc),
        Arc::clone(&ambient),
        publisher,
        Topics::new(&cfg.mqtt),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // ── Out-of-band saves ───────────────────────────────────────────
    let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let save_state = Arc::clone(&shared);
    let data_path = cfg.files.data.clone();
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            if let Err(e) = save_shared(&save_state, &data_path).await {
                error!("failed to save data: {e:#}");
            }
        }
    });

    // ── Web server ──────────────────────────────────────────────────
    let app = web::router(AppState {
        station: Arc::clone(&shared),
        wuc,
        ambient,
        login: Arc::new(cfg.login.clone()),
        config_path: Arc::new(cfg.files.config.clone()),
    });
    let http = cfg.http.clone();
    let mut web_task = tokio::spawn(async move { web::serve(app, &http).await });

    // ── Run until terminated ────────────────────────────────────────
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let web_exit = tokio::select! {
        _ = sigint.recv() => None,
        _ = sigterm.recv() => None,
        res = &mut web_task => Some(res),
    };

    info!("shutting down");

    // Let a running cycle finish, then keep the scheduler from starting another.
    _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!("scheduler task failed: {e}");
    }

    {
        let st = shared.write().await;
        persist::save(&cfg.files.data, &Snapshot::capture(&st))
            .context("failed to save data at shutdown")?;
    }
    info!("data saved");

    match web_exit {
        None | Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(e),
        Some(Err(e)) => Err(e).context("web server task failed"),
    }
}

/// Snapshot under the shared lock; the scheduler keeps running.
async fn save_shared(shared: &SharedState, path: &Path) -> Result<()> {
    let snapshot = Snapshot::capture(&*shared.read().await);
    persist::save(path, &snapshot)?;
    info!("data saved");
    Ok(())
}
