use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use veriface_core::{FaceMatcher, ScrfdDetector};
use veriface_otp::{LogSmsTransport, OtpManager, SmsTransport};

mod config;
mod dbus_interface;
mod engine;
mod orchestrator;
#[cfg(test)]
mod testing;

use config::{BusKind, Config};
use dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "verifaced starting");

    let config = Config::from_env()?;
    tracing::info!(
        bus = ?config.bus,
        model_dir = %config.model_dir.display(),
        workers = config.engine_workers,
        threshold = config.match_threshold,
        multi_face = ?config.multi_face,
        "configuration loaded"
    );

    let scrfd_path = config.scrfd_model_path();
    let matcher_config = config.matcher_config();
    let engine = engine::spawn_engine(config.engine_workers, config.compare_timeout(), || {
        let detector = ScrfdDetector::load(&scrfd_path)?;
        Ok(FaceMatcher::new(Box::new(detector), matcher_config.clone()))
    })?;

    let otp = Arc::new(OtpManager::in_memory(config.otp_config()));
    let sms: Arc<dyn SmsTransport> = Arc::new(LogSmsTransport::new());
    let orchestrator = Arc::new(Orchestrator::new(engine, otp, sms));

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifierService::new(Arc::clone(&orchestrator)))?
        .build()
        .await?;

    let sweeper = tokio::spawn(sweep_expired(Arc::clone(&orchestrator), config.sweep_interval()));

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "verifaced ready");

    tokio::signal::ctrl_c().await?;
    sweeper.abort();
    tracing::info!("verifaced shutting down");

    Ok(())
}

/// Periodically drop expired OTP records.
async fn sweep_expired(orchestrator: Arc<Orchestrator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = orchestrator.sweep();
        tracing::debug!(removed, remaining = orchestrator.active_otps(), "expiry sweep");
    }
}
