//! Durable queue items, one per (message, destination host).

use carrier_store::BodyId;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, sqlite::SqliteRow};

use crate::db::{self, Database, DatabaseError};

const TABLE: &str = "queue_items";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub created_time: DateTime<Utc>,
    pub lock_expires: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub host: String,
    pub from: String,
    pub to: Vec<String>,
    pub body: BodyId,
    /// Originating account, carried for bookkeeping elsewhere.
    pub owner: Option<String>,
}

/// What the caller supplies to enqueue an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueItem {
    pub host: String,
    pub from: String,
    pub to: Vec<String>,
    pub body: BodyId,
    pub owner: Option<String>,
}

impl QueueItem {
    fn from_row(row: &SqliteRow) -> Result<Self, DatabaseError> {
        let body: String = row.try_get("body")?;
        let body = body.parse().map_err(|e| DatabaseError::Corrupt {
            table: TABLE,
            reason: format!("body reference {body:?}: {e}"),
        })?;
        let to: String = row.try_get("rcpt_to")?;

        Ok(Self {
            id: row.try_get("id")?,
            created_time: db::from_millis(TABLE, row.try_get("created_time")?)?,
            lock_expires: db::opt_from_millis(TABLE, row.try_get("lock_expires")?)?,
            next_attempt: db::opt_from_millis(TABLE, row.try_get("next_attempt")?)?,
            attempts: db::attempts_from(TABLE, row.try_get("attempts")?)?,
            host: row.try_get("host")?,
            from: row.try_get("mail_from")?,
            to: decode_recipients(&to),
            body,
            owner: row.try_get("owner")?,
        })
    }
}

/// Recipients are stored newline-joined; addresses never contain newlines.
fn encode_recipients(to: &[String]) -> String {
    to.join("\n")
}

fn decode_recipients(raw: &str) -> Vec<String> {
    raw.split('\n')
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts an item, creating its host row if this is the first item
    /// for that host. Both happen in one transaction, so a concurrent
    /// garbage collection of the host cannot strand the item.
    pub async fn insert(&self, item: &NewQueueItem) -> Result<QueueItem, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;
        let inserted = insert_one(&mut tx, item).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Inserts a fanned-out message: every item is queued, or none is.
    pub async fn insert_all(
        &self,
        items: &[NewQueueItem],
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;

        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            inserted.push(insert_one(&mut tx, item).await?);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Takes the oldest ready item for `host` and locks it until
    /// `lock_until`. Items that are locked or backing off are skipped.
    pub async fn next_for_host(
        &self,
        host: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let row = sqlx::query(
            "UPDATE queue_items SET lock_expires = ?1
             WHERE id = (
                 SELECT id FROM queue_items
                 WHERE host = ?2
                   AND (lock_expires IS NULL OR lock_expires <= ?3)
                   AND (next_attempt IS NULL OR next_attempt <= ?3)
                 ORDER BY created_time, id
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(db::to_millis(lock_until))
        .bind(host)
        .bind(db::to_millis(db::now()))
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(QueueItem::from_row).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM queue_items WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(QueueItem::from_row).transpose()
    }

    /// All items for `host`, oldest first.
    pub async fn for_host(&self, host: &str) -> Result<Vec<QueueItem>, DatabaseError> {
        sqlx::query("SELECT * FROM queue_items WHERE host = ?1 ORDER BY created_time, id")
            .bind(host)
            .fetch_all(self.db.pool())
            .await?
            .iter()
            .map(QueueItem::from_row)
            .collect()
    }

    /// Removes an item. Returns `false` if it was already gone.
    pub async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts a failed attempt, unlocks the item and schedules it. Returns
    /// the new attempt count.
    pub async fn record_failure(
        &self,
        id: i64,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Result<u32, DatabaseError> {
        let attempts: i64 = sqlx::query_scalar(
            "UPDATE queue_items
             SET attempts = attempts + 1, lock_expires = NULL, next_attempt = ?2
             WHERE id = ?1
             RETURNING attempts",
        )
        .bind(id)
        .bind(db::opt_to_millis(next_attempt))
        .fetch_one(self.db.pool())
        .await?;

        db::attempts_from(TABLE, attempts)
    }

    /// Releases an item lock without counting an attempt.
    pub async fn unlock(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE queue_items SET lock_expires = NULL WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Number of items per host.
    pub async fn pending_by_host(&self) -> Result<Vec<(String, u64)>, DatabaseError> {
        let rows = sqlx::query("SELECT host, COUNT(*) AS pending FROM queue_items GROUP BY host")
            .fetch_all(self.db.pool())
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, u64), DatabaseError> {
                let pending: i64 = row.try_get("pending")?;
                Ok((row.try_get("host")?, u64::try_from(pending).unwrap_or_default()))
            })
            .collect()
    }
}

async fn insert_one(
    conn: &mut SqliteConnection,
    item: &NewQueueItem,
) -> Result<QueueItem, DatabaseError> {
    sqlx::query("INSERT INTO hosts (name) VALUES (?1) ON CONFLICT (name) DO NOTHING")
        .bind(&item.host)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query(
        "INSERT INTO queue_items (created_time, host, mail_from, rcpt_to, body, owner)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING *",
    )
    .bind(db::to_millis(db::now()))
    .bind(&item.host)
    .bind(&item.from)
    .bind(encode_recipients(&item.to))
    .bind(item.body.to_string())
    .bind(&item.owner)
    .fetch_one(&mut *conn)
    .await?;

    QueueItem::from_row(&row)
}
