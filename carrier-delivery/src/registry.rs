//! Host lease registry.
//!
//! A host row exists while the host has queued items. Whoever holds an
//! unexpired lease on a host is the only party allowed to deliver to it;
//! leases are taken with a single conditional `UPDATE`, so this holds
//! across processes sharing the database.

use std::time::Duration;

use carrier_store::BodyId;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};

use crate::{
    db::{self, Database, DatabaseError},
    policy::RetryPolicy,
};

const TABLE: &str = "hosts";

/// A destination host and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub lock_expires: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    /// Consecutive failed attempts.
    pub attempts: u32,
}

impl Host {
    fn from_row(row: &SqliteRow) -> Result<Self, DatabaseError> {
        Ok(Self {
            name: row.try_get("name")?,
            lock_expires: db::opt_from_millis(TABLE, row.try_get("lock_expires")?)?,
            next_attempt: db::opt_from_millis(TABLE, row.try_get("next_attempt")?)?,
            attempts: db::attempts_from(TABLE, row.try_get("attempts")?)?,
        })
    }

    /// The host accepted a session; forget past failures.
    pub const fn succeeded(&mut self) {
        self.next_attempt = None;
        self.attempts = 0;
    }

    /// The host could not be delivered to; back off.
    pub fn failed(&mut self, policy: &RetryPolicy) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt = Some(policy.next_attempt(self.attempts, db::now()));
    }

    /// Time left on the lease, zero once expired.
    #[must_use]
    pub fn lease_remaining(&self) -> Duration {
        self.lock_expires
            .and_then(|expires| (expires - db::now()).to_std().ok())
            .unwrap_or_default()
    }
}

/// What [`HostRegistry::finished`] did with the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finished {
    /// Items remain; the lease was released and bookkeeping saved.
    Released,
    /// No items remain; the host row was removed.
    Collected,
    /// The host failed too often. All its items were deleted; the caller
    /// owns the returned body references and must release them.
    Purged { bodies: Vec<BodyId> },
}

#[derive(Debug, Clone)]
pub struct HostRegistry {
    db: Database,
    lease: Duration,
    max_failures: u32,
}

impl HostRegistry {
    #[must_use]
    pub const fn new(db: Database, lease: Duration, max_failures: u32) -> Self {
        Self {
            db,
            lease,
            max_failures,
        }
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Leases some host that is neither leased nor backing off.
    ///
    /// Hosts whose backoff expired longest ago go first.
    pub async fn claim(&self) -> Result<Option<Host>, DatabaseError> {
        self.claim_except(&[]).await
    }

    /// Like [`claim`](Self::claim), but never picks a host named in
    /// `busy`, even one whose lease has lapsed. The dispatcher passes the
    /// hosts it still has a worker for.
    pub async fn claim_except(&self, busy: &[String]) -> Result<Option<Host>, DatabaseError> {
        let now = db::now();
        let lease = db::to_millis(self.lease_from(now));
        let now = db::to_millis(now);

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE hosts SET lock_expires = ");
        query
            .push_bind(lease)
            .push(
                " WHERE name = (
                     SELECT name FROM hosts
                     WHERE (lock_expires IS NULL OR lock_expires <= ",
            )
            .push_bind(now)
            .push(") AND (next_attempt IS NULL OR next_attempt <= ")
            .push_bind(now)
            .push(")");

        if !busy.is_empty() {
            query.push(" AND name NOT IN (");
            let mut names = query.separated(", ");
            for name in busy {
                names.push_bind(name.as_str());
            }
            names.push_unseparated(")");
        }

        query.push(
            " ORDER BY COALESCE(next_attempt, 0), name
              LIMIT 1
             )
             RETURNING *",
        );

        let row = query.build().fetch_optional(self.db.pool()).await?;
        row.as_ref().map(Host::from_row).transpose()
    }

    /// Extends the lease on `host`, failing with
    /// [`DatabaseError::LeaseLost`] if someone else holds it now.
    pub async fn renew(&self, host: &mut Host) -> Result<(), DatabaseError> {
        self.renew_holding(host, None).await
    }

    /// Extends the lease on `host` and, in the same transaction, moves the
    /// lock on the item being delivered to the new expiry.
    pub async fn renew_holding(
        &self,
        host: &mut Host,
        item: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let expires = self.lease_from(db::now());
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE hosts SET lock_expires = ?1 WHERE name = ?2 AND lock_expires IS ?3",
        )
        .bind(db::to_millis(expires))
        .bind(&host.name)
        .bind(db::opt_to_millis(host.lock_expires))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::LeaseLost(host.name.clone()));
        }

        if let Some(id) = item {
            sqlx::query("UPDATE queue_items SET lock_expires = ?1 WHERE id = ?2 AND host = ?3")
                .bind(db::to_millis(expires))
                .bind(id)
                .bind(&host.name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        host.lock_expires = Some(expires);
        Ok(())
    }

    /// Saves `host`'s bookkeeping and gives up the lease.
    ///
    /// Hosts over the failure limit are purged along with every item. Hosts
    /// without items are removed. The removal and the item check are one
    /// statement, so an item enqueued concurrently is never orphaned.
    pub async fn finished(&self, host: &Host) -> Result<Finished, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;

        let released = sqlx::query(
            "UPDATE hosts SET lock_expires = NULL, next_attempt = ?1, attempts = ?2
             WHERE name = ?3 AND lock_expires IS ?4",
        )
        .bind(db::opt_to_millis(host.next_attempt))
        .bind(i64::from(host.attempts))
        .bind(&host.name)
        .bind(db::opt_to_millis(host.lock_expires))
        .execute(&mut *tx)
        .await?;

        if released.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::LeaseLost(host.name.clone()));
        }

        if host.attempts > self.max_failures {
            let rows = sqlx::query("DELETE FROM queue_items WHERE host = ?1 RETURNING body")
                .bind(&host.name)
                .fetch_all(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM hosts WHERE name = ?1")
                .bind(&host.name)
                .execute(&mut *tx)
                .await?;

            let bodies = rows
                .iter()
                .map(|row| -> Result<BodyId, DatabaseError> {
                    let body: String = row.try_get("body")?;
                    body.parse().map_err(|e| DatabaseError::Corrupt {
                        table: "queue_items",
                        reason: format!("body reference {body:?}: {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            tx.commit().await?;
            return Ok(Finished::Purged { bodies });
        }

        let collected = sqlx::query(
            "DELETE FROM hosts
             WHERE name = ?1 AND NOT EXISTS (SELECT 1 FROM queue_items WHERE host = ?1)",
        )
        .bind(&host.name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if collected.rows_affected() > 0 {
            Ok(Finished::Collected)
        } else {
            Ok(Finished::Released)
        }
    }

    /// Looks up `name`, inserting a fresh unleased row if it is unknown.
    pub async fn get_or_create(&self, name: &str) -> Result<Host, DatabaseError> {
        let row = sqlx::query(
            "INSERT INTO hosts (name) VALUES (?1)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING *",
        )
        .bind(name)
        .fetch_one(self.db.pool())
        .await?;
        Host::from_row(&row)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Host>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM hosts WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Host::from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Host>, DatabaseError> {
        sqlx::query("SELECT * FROM hosts ORDER BY name")
            .fetch_all(self.db.pool())
            .await?
            .iter()
            .map(Host::from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        db::testing,
        queue::{NewQueueItem, QueueStore},
    };

    const LEASE: Duration = Duration::from_secs(120);

    async fn enqueue(queue: &QueueStore, host: &str) -> BodyId {
        let body = BodyId::generate();
        queue
            .insert(&NewQueueItem {
                host: host.to_string(),
                from: "sender@origin.test".to_string(),
                to: vec![format!("rcpt@{host}")],
                body,
                owner: None,
            })
            .await
            .unwrap();
        body
    }

    #[tokio::test]
    async fn nothing_to_claim() {
        let (_dir, database) = testing::database().await;
        let registry = HostRegistry::new(database, LEASE, 8);
        assert!(registry.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (_dir, database) = testing::database().await;
        let registry = HostRegistry::new(database, LEASE, 8);

        let created = registry.get_or_create("example.test").await.unwrap();
        assert_eq!(
            created,
            Host {
                name: "example.test".to_string(),
                lock_expires: None,
                next_attempt: None,
                attempts: 0,
            }
        );

        let leased = registry.claim().await.unwrap().unwrap();
        let again = registry.get_or_create("example.test").await.unwrap();
        assert_eq!(again.lock_expires, leased.lock_expires);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_leased_host_is_not_claimable() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let host = registry.claim().await.unwrap().unwrap();
        assert_eq!(host.name, "example.test");
        assert!(host.lease_remaining() > Duration::from_secs(100));

        assert!(registry.claim().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = Arc::new(HostRegistry::new(database, LEASE, 8));
        enqueue(&queue, "example.test").await;

        let claims: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.claim().await })
            })
            .collect();

        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, Duration::from_millis(50), 8);
        enqueue(&queue, "example.test").await;

        let mut stale = registry.claim().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = registry.claim().await.unwrap().unwrap();
        assert_eq!(fresh.name, stale.name);

        assert!(matches!(
            registry.renew(&mut stale).await,
            Err(DatabaseError::LeaseLost(_))
        ));
        assert!(matches!(
            registry.finished(&stale).await,
            Err(DatabaseError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let mut host = registry.claim().await.unwrap().unwrap();
        let before = host.lock_expires;
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.renew(&mut host).await.unwrap();

        assert!(host.lock_expires > before);
        assert_eq!(
            registry.get("example.test").await.unwrap().unwrap().lock_expires,
            host.lock_expires
        );
    }

    #[tokio::test]
    async fn renewal_carries_the_item_lock() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let mut host = registry.claim().await.unwrap().unwrap();
        let item = queue.next_for_host(&host.name, db::now()).await.unwrap().unwrap();

        registry.renew_holding(&mut host, Some(item.id)).await.unwrap();

        let locked = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(locked.lock_expires, host.lock_expires);
        assert!(queue.next_for_host(&host.name, db::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn busy_hosts_are_not_taken_over() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, Duration::from_millis(50), 8);
        enqueue(&queue, "example.test").await;

        // The holder's lease lapses while it is still working.
        let mut held = registry.claim().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let busy = vec!["example.test".to_string()];
        assert!(registry.claim_except(&busy).await.unwrap().is_none());

        // So its bookkeeping still lands.
        registry.renew(&mut held).await.unwrap();
        held.failed(&RetryPolicy::default());
        assert_eq!(registry.finished(&held).await.unwrap(), Finished::Released);
        assert_eq!(registry.get("example.test").await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn claim_except_still_finds_other_hosts() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "one.test").await;
        enqueue(&queue, "two.test").await;

        let busy = vec!["one.test".to_string()];
        let host = registry.claim_except(&busy).await.unwrap().unwrap();
        assert_eq!(host.name, "two.test");
        assert!(registry.claim_except(&busy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_backs_off_and_success_resets() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        let policy = RetryPolicy::default();
        enqueue(&queue, "example.test").await;

        let mut host = registry.claim().await.unwrap().unwrap();
        host.failed(&policy);
        assert_eq!(host.attempts, 1);
        assert_eq!(registry.finished(&host).await.unwrap(), Finished::Released);

        // Backing off for thirty minutes.
        assert!(registry.claim().await.unwrap().is_none());
        let saved = registry.get("example.test").await.unwrap().unwrap();
        assert_eq!(saved.attempts, 1);
        assert!(saved.lock_expires.is_none());
        assert!(saved.next_attempt.is_some());

        host.succeeded();
        assert_eq!(host.attempts, 0);
        assert!(host.next_attempt.is_none());
    }

    #[tokio::test]
    async fn drained_host_is_collected() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let host = registry.claim().await.unwrap().unwrap();
        let item = queue.next_for_host(&host.name, db::now()).await.unwrap().unwrap();
        queue.delete(item.id).await.unwrap();

        assert_eq!(registry.finished(&host).await.unwrap(), Finished::Collected);
        assert!(registry.get("example.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_host_is_claimable_again() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let host = registry.claim().await.unwrap().unwrap();
        assert_eq!(registry.finished(&host).await.unwrap(), Finished::Released);
        assert_eq!(
            registry.claim().await.unwrap().map(|h| h.name),
            Some("example.test".to_string())
        );
    }

    #[tokio::test]
    async fn ninth_failure_purges_everything() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        let policy = RetryPolicy::default();
        let mut bodies = vec![
            enqueue(&queue, "dead.test").await,
            enqueue(&queue, "dead.test").await,
        ];
        enqueue(&queue, "alive.test").await;

        let mut host = loop {
            let host = registry.claim().await.unwrap().unwrap();
            if host.name == "dead.test" {
                break host;
            }
        };
        host.attempts = 8;
        host.failed(&policy);

        let Finished::Purged { bodies: mut purged } = registry.finished(&host).await.unwrap() else {
            panic!("expected the host to be purged");
        };
        purged.sort();
        bodies.sort();
        assert_eq!(purged, bodies);

        assert!(registry.get("dead.test").await.unwrap().is_none());
        assert!(queue.for_host("dead.test").await.unwrap().is_empty());
        assert_eq!(queue.for_host("alive.test").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn eighth_failure_is_still_retried() {
        let (_dir, database) = testing::database().await;
        let queue = QueueStore::new(database.clone());
        let registry = HostRegistry::new(database, LEASE, 8);
        enqueue(&queue, "example.test").await;

        let mut host = registry.claim().await.unwrap().unwrap();
        host.attempts = 7;
        host.failed(&RetryPolicy::default());
        assert_eq!(registry.finished(&host).await.unwrap(), Finished::Released);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }
}
