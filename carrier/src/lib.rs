//! The carrier relay process: configuration, logging and lifecycle.

use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use carrier_common::{LogConfig, Signal, internal, logging};
use carrier_delivery::{Database, DatabaseConfig, DeliveryConfig, Relay};
use carrier_store::{Storage, StoreConfig};
use serde::Deserialize;
use tokio::sync::broadcast;

#[derive(Debug, Default, Deserialize)]
pub struct Carrier {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(alias = "spool", default)]
    pub storage: StoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Waits for SIGINT or SIGTERM, then tells everything to stop.
#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Carrier {
    /// Reads and checks the RON configuration at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let carrier: Self = ron::from_str(raw)?;
        carrier.delivery.validate()?;
        Ok(carrier)
    }

    /// Opens storage and the database, then delivers until told to stop.
    ///
    /// Workers finish their current transaction and settle their hosts
    /// before this returns; anything undelivered stays queued for the next
    /// start.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.logging);
        internal!("Carrier starting");

        let storage = Arc::new(Storage::new(&self.storage));
        let database = Database::connect(&self.database).await?;
        let relay = Relay::open(self.delivery, database, storage).await?;

        let serve = relay.serve(SHUTDOWN_BROADCAST.subscribe());
        tokio::pin!(serve);

        let ret = tokio::select! {
            r = &mut serve => r.map_err(anyhow::Error::from),
            r = shutdown() => match r {
                Ok(()) => serve.await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            },
        };

        internal!("Shutting down...");
        relay.close().await;

        ret
    }
}
