#![allow(dead_code)]

pub mod mock_server;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use carrier_common::Signal;
use carrier_delivery::{
    Database, DatabaseConfig, DeliveryConfig, DeliveryError, DnsConfig, DnsError,
    MailServerResolver, MxAnswer, MxLookup, MxRecord, Relay,
};
use carrier_store::{BodyId, Storage};
use tempfile::TempDir;
use tokio::{io::AsyncWriteExt, sync::broadcast, task::JoinHandle};

/// Sends every domain to the local mock server.
pub struct Loopback;

#[async_trait]
impl MxLookup for Loopback {
    async fn lookup_mx(&self, _domain: &str) -> Result<MxAnswer, DnsError> {
        Ok(MxAnswer {
            records: vec![MxRecord::new("127.0.0.1.", 10)],
            ttl: 60,
        })
    }
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub storage: Arc<Storage>,
    pub database: Database,
    config: DeliveryConfig,
    shutdown: broadcast::Sender<Signal>,
    dir: Arc<TempDir>,
}

impl Harness {
    /// A relay delivering to `127.0.0.1:port`, with short timers.
    pub async fn new(port: u16, configure: impl FnOnce(&mut DeliveryConfig)) -> Self {
        let mut config = DeliveryConfig {
            hostname: "relay.test".to_string(),
            port,
            poll_interval_secs: 1,
            idle_timeout_secs: 1,
            ..DeliveryConfig::default()
        };
        configure(&mut config);

        Self::open(Arc::new(tempfile::tempdir().unwrap()), config).await
    }

    /// A second relay on the same database file and spool, as another
    /// process would be, with its own connection pool and workers.
    pub async fn peer(&self) -> Self {
        Self::open(Arc::clone(&self.dir), self.config.clone()).await
    }

    async fn open(dir: Arc<TempDir>, config: DeliveryConfig) -> Self {
        let database = Database::connect(&DatabaseConfig {
            path: dir.path().join("carrier.db"),
            ..DatabaseConfig::default()
        })
        .await
        .unwrap();
        let storage = Arc::new(Storage::at(dir.path().join("spool")));

        let resolver = MailServerResolver::with_lookup(Arc::new(Loopback), DnsConfig::default());
        let relay = Relay::with_resolver(
            config.clone(),
            database.clone(),
            Arc::clone(&storage),
            resolver,
        )
        .await
        .unwrap();

        let (shutdown, _) = broadcast::channel(4);
        Self {
            relay: Arc::new(relay),
            storage,
            database,
            config,
            shutdown,
            dir,
        }
    }

    pub async fn body(&self, content: &str) -> BodyId {
        let (mut writer, _) = self.relay.new_body().await.unwrap();
        writer.write_all(content.as_bytes()).await.unwrap();
        writer.commit().await.unwrap()
    }

    /// Runs the dispatcher in the background.
    pub fn serve(&self) -> JoinHandle<Result<(), DeliveryError>> {
        let relay = Arc::clone(&self.relay);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { relay.serve(shutdown).await })
    }

    pub fn shutdown(&self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
    }

    pub async fn body_exists(&self, body: BodyId) -> bool {
        match self.storage.metadata(body).await {
            Ok(_) => true,
            Err(err) if err.is_not_found() => false,
            Err(err) => panic!("unexpected storage error: {err}"),
        }
    }
}

/// Polls `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
