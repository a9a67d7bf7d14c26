use std::env;

use tokio::signal;
use tokio::sync::watch;

use pushkind_inferq::broker::{Broker, RedisBroker};
use pushkind_inferq::models::config::{DEFAULT_CONFIG_PATH, Settings};
use pushkind_inferq::processing::backend::build_backend;
use pushkind_inferq::processing::scheduler::BatchScheduler;
use pushkind_inferq::retry::{Backoff, retry_broker};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load configuration from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let broker = match RedisBroker::new(&settings.broker) {
        Ok(broker) => broker,
        Err(e) => {
            log::error!("Failed to create broker pool: {e}");
            std::process::exit(1);
        }
    };

    let broker_ref = &broker;
    if let Err(e) = retry_broker(
        Backoff::from_settings(&settings.worker),
        settings.worker.startup_retries,
        "broker ping",
        move || broker_ref.ping(),
    )
    .await
    {
        log::error!(
            "Broker {}:{} unreachable after {} retries: {e}",
            settings.broker.host,
            settings.broker.port,
            settings.worker.startup_retries
        );
        std::process::exit(1);
    }

    let backend = match build_backend(&settings) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("Failed to initialize inference backend: {e}");
            std::process::exit(1);
        }
    };

    let scheduler = BatchScheduler::new(broker.clone(), backend, &settings);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    scheduler.run(shutdown_rx).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, finishing current batch"),
        _ = terminate => log::info!("Received terminate signal, finishing current batch"),
    }
}
