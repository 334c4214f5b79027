use std::sync::Arc;

use carrier_store::Storage;

use crate::{
    config::DeliveryConfig, connector::Connector, db::Database, dns::MailServerResolver,
    queue::QueueStore, registry::HostRegistry,
};

/// Everything a worker needs, shared by the dispatcher and all workers.
#[derive(Debug)]
pub struct DeliveryContext {
    pub config: DeliveryConfig,
    pub registry: HostRegistry,
    pub queue: QueueStore,
    pub storage: Arc<Storage>,
    pub resolver: MailServerResolver,
    pub connector: Connector,
}

impl DeliveryContext {
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        database: &Database,
        storage: Arc<Storage>,
        resolver: MailServerResolver,
    ) -> Self {
        let registry =
            HostRegistry::new(database.clone(), config.lease(), config.max_host_failures);
        let queue = QueueStore::new(database.clone());
        let connector = Connector::new(
            config.hostname.clone(),
            config.port,
            config.accept_invalid_certs,
            config.smtp_timeouts.clone(),
        );

        Self {
            config,
            registry,
            queue,
            storage,
            resolver,
            connector,
        }
    }
}
