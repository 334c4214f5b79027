//! Outbound delivery for the carrier relay.
//!
//! This crate provides:
//! - Durable per-host queue items and host leases in SQLite
//! - MX resolution with caching
//! - SMTP session setup with optional STARTTLS
//! - One worker per destination host, driven by a polling dispatcher

mod config;
mod connector;
mod context;
pub mod db;
mod dispatcher;
pub mod dns;
mod error;
pub mod policy;
pub mod queue;
pub mod registry;
mod relay;
mod timeouts;
mod worker;

pub use config::{ConfigError, DeliveryConfig};
pub use connector::{Connector, classify};
pub use context::DeliveryContext;
pub use db::{Database, DatabaseConfig, DatabaseError};
pub use dispatcher::{Dispatcher, WorkerHandle};
pub use dns::{DnsConfig, DnsError, MailServerResolver, MxAnswer, MxLookup, MxRecord};
pub use error::{DeliveryError, FailureLevel, HostError, MessageError, SystemError};
pub use policy::RetryPolicy;
pub use queue::{NewQueueItem, QueueItem, QueueStore};
pub use registry::{Finished, Host, HostRegistry};
pub use relay::{HostStatus, QueueStatus, Relay};
pub use timeouts::SmtpTimeouts;
pub use worker::{Worker, WorkerState};
