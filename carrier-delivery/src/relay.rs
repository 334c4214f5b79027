//! The engine's public face: enqueue, status and the dispatcher loop.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use carrier_common::{Signal, internal};
use carrier_store::{BodyId, BodyWriter, Storage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::{
    config::DeliveryConfig,
    context::DeliveryContext,
    db::Database,
    dispatcher::{Dispatcher, Workers},
    dns::MailServerResolver,
    error::{DeliveryError, MessageError},
    queue::{NewQueueItem, QueueItem},
};

/// Per-host view for the administrative API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    /// A session to the host is open right now.
    pub active: bool,
    /// Seconds since the host's worker last did anything, if one is running.
    pub idle_secs: Option<u64>,
    pub pending: u64,
    pub attempts: u32,
    pub next_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub uptime_secs: u64,
    pub hosts: BTreeMap<String, HostStatus>,
}

impl QueueStatus {
    /// Items queued across all hosts.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.hosts.values().map(|host| host.pending).sum()
    }
}

pub struct Relay {
    ctx: Arc<DeliveryContext>,
    database: Database,
    workers: Workers,
    started: Instant,
}

impl Relay {
    /// Opens the relay with the system DNS resolver.
    pub async fn open(
        config: DeliveryConfig,
        database: Database,
        storage: Arc<Storage>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        let resolver = MailServerResolver::from_system(config.dns.clone())?;
        Self::with_resolver(config, database, storage, resolver).await
    }

    pub async fn with_resolver(
        config: DeliveryConfig,
        database: Database,
        storage: Arc<Storage>,
        resolver: MailServerResolver,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        storage.init().await?;
        internal!(
            "Relay ready as {} (lease {}s, idle timeout {}s, max host failures {})",
            config.hostname,
            config.lease_secs,
            config.idle_timeout_secs,
            config.max_host_failures
        );

        Ok(Self {
            ctx: Arc::new(DeliveryContext::new(config, &database, storage, resolver)),
            database,
            workers: Arc::new(DashMap::new()),
            started: Instant::now(),
        })
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<DeliveryContext> {
        &self.ctx
    }

    /// Starts writing a body. Commit it, then [`enqueue`](Self::enqueue) it.
    pub async fn new_body(&self) -> Result<(BodyWriter, BodyId), DeliveryError> {
        Ok(self.ctx.storage.new_body().await?)
    }

    /// Queues `body` for every recipient, one item per destination host.
    ///
    /// Recipients are grouped by domain, case-insensitively, in the order
    /// hosts first appear. Every address is checked before anything is
    /// queued. All body references are taken before the items are written
    /// in a single transaction, so no host's worker can free the body while
    /// the others are still being queued; on failure nothing stays queued
    /// and the references are given back.
    pub async fn enqueue(
        &self,
        body: BodyId,
        from: &str,
        recipients: &[String],
        owner: Option<&str>,
    ) -> Result<Vec<QueueItem>, DeliveryError> {
        let batch: Vec<NewQueueItem> = group_by_host(recipients)?
            .into_iter()
            .map(|(host, to)| NewQueueItem {
                host,
                from: from.to_string(),
                to,
                body,
                owner: owner.map(str::to_string),
            })
            .collect();
        let count = batch.len() as u64;

        self.ctx.storage.add_references(body, count).await?;

        let items = match self.ctx.queue.insert_all(&batch).await {
            Ok(items) => items,
            Err(err) => {
                self.give_back(body, count).await;
                return Err(err.into());
            }
        };

        for item in &items {
            self.queued(item);
        }
        Ok(items)
    }

    /// Queues `body` for recipients that all live on `host`.
    ///
    /// The body reference is taken before the item is written, so a crash
    /// in between leaks a reference rather than losing a body.
    pub async fn enqueue_for_host(
        &self,
        body: BodyId,
        host: &str,
        from: &str,
        to: Vec<String>,
        owner: Option<&str>,
    ) -> Result<QueueItem, DeliveryError> {
        if to.is_empty() {
            return Err(MessageError::InvalidAddress(format!("no recipients for {host}")).into());
        }

        self.ctx.storage.add(body).await?;

        let new = NewQueueItem {
            host: host.to_ascii_lowercase(),
            from: from.to_string(),
            to,
            body,
            owner: owner.map(str::to_string),
        };
        let item = match self.ctx.queue.insert(&new).await {
            Ok(item) => item,
            Err(err) => {
                self.give_back(body, 1).await;
                return Err(err.into());
            }
        };

        self.queued(&item);
        Ok(item)
    }

    async fn give_back(&self, body: BodyId, count: u64) {
        if let Err(err) = self.ctx.storage.give_back(body, count).await {
            error!(body = %body, "Unable to give back references after failed enqueue: {err}");
        }
    }

    /// Wakes the host's worker, if one is running, for a committed item.
    fn queued(&self, item: &QueueItem) {
        debug!(id = item.id, host = %item.host, body = %item.body, "Queued");
        if let Some(worker) = self.workers.get(&item.host) {
            worker.wake();
        }
    }

    /// Queue depth and worker state per host.
    pub async fn status(&self) -> Result<QueueStatus, DeliveryError> {
        let mut hosts = BTreeMap::new();

        for host in self.ctx.registry.list().await? {
            hosts.insert(
                host.name,
                HostStatus {
                    active: false,
                    idle_secs: None,
                    pending: 0,
                    attempts: host.attempts,
                    next_attempt: host.next_attempt,
                },
            );
        }

        for (host, pending) in self.ctx.queue.pending_by_host().await? {
            if let Some(status) = hosts.get_mut(&host) {
                status.pending = pending;
            }
        }

        for entry in self.workers.iter() {
            let state = entry.value().state();
            if state.is_finished() {
                continue;
            }
            if let Some(status) = hosts.get_mut(entry.key()) {
                status.active = state.is_active();
                status.idle_secs = Some(state.idle_for().as_secs());
            }
        }

        Ok(QueueStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            hosts,
        })
    }

    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.ctx), Arc::clone(&self.workers))
    }

    /// Runs the dispatcher until `shutdown` fires and every worker has
    /// settled.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        self.dispatcher().serve(shutdown).await
    }

    /// Closes the database. Call after [`serve`](Self::serve) returns.
    pub async fn close(&self) {
        self.database.close().await;
        internal!("Relay closed");
    }
}

/// Splits recipients into `(host, recipients)` groups.
fn group_by_host(recipients: &[String]) -> Result<Vec<(String, Vec<String>)>, MessageError> {
    if recipients.is_empty() {
        return Err(MessageError::InvalidAddress("no recipients".to_string()));
    }

    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for recipient in recipients {
        let address = parse_address(recipient)?;
        let host = address
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .ok_or_else(|| MessageError::InvalidAddress(recipient.clone()))?;

        match groups.iter_mut().find(|(existing, _)| *existing == host) {
            Some((_, to)) => to.push(address),
            None => groups.push((host, vec![address])),
        }
    }
    Ok(groups)
}

/// The bare mailbox of a single address, display names and angle brackets
/// stripped.
fn parse_address(raw: &str) -> Result<String, MessageError> {
    let invalid = || MessageError::InvalidAddress(raw.to_string());

    let address = mailparse::addrparse(raw)
        .map_err(|_| invalid())?
        .extract_single_info()
        .ok_or_else(invalid)?
        .addr;

    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(address),
        _ => Err(invalid()),
    }
}
