// Disk queue - bounded persistent FIFO of pending events
//
// Events are buffered in a small SQLite database (WAL journal) so that a
// proxy restart or a sidecar outage loses nothing. Delivery is two-phase:
// fetch_batch reads without consuming, delete_up_to advances the queue only
// after the batch was accepted downstream. A crash between the two re-delivers
// the batch; the pipeline is at-least-once by contract.

use crate::events::RawEvent;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use tokio::sync::Notify;

/// One persisted queue entry. Ids are autoincrement and strictly ordered.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: i64,
    pub event: RawEvent,
}

/// Bounded persistent FIFO. All SQL runs on one connection behind a mutex;
/// the capacity gate is a separate mutex+condvar so a blocked producer never
/// holds the connection.
pub struct DiskQueue {
    conn: Mutex<Connection>,
    count: Mutex<usize>,
    capacity: Condvar,
    notify: Notify,
    max_events: usize,
}

impl DiskQueue {
    /// Open (or create) the buffer database. The surviving row count seeds
    /// the in-memory counter so capacity holds across restarts.
    pub fn open(path: &Path, max_events: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open event buffer {}", path.display()))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
            "#,
        )
        .context("init event buffer schema")?;

        let count: usize = conn
            .query_row("SELECT COUNT(1) FROM events", [], |row| row.get(0))
            .context("count buffered events")?;

        Ok(Self {
            conn: Mutex::new(conn),
            count: Mutex::new(count),
            capacity: Condvar::new(),
            notify: Notify::new(),
            max_events,
        })
    }

    /// Append one event. When the queue is bounded and full this blocks until
    /// delete_up_to frees capacity; call it from a blocking context.
    pub fn enqueue_sync(&self, event: &RawEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("encode event")?;

        {
            let mut count = self.count.lock().expect("queue count lock");
            while self.max_events > 0 && *count >= self.max_events {
                count = self.capacity.wait(count).expect("queue count lock");
            }
            *count += 1;
        }

        let inserted = {
            let conn = self.conn.lock().expect("queue conn lock");
            conn.execute("INSERT INTO events(payload) VALUES (?1)", params![payload])
        };
        if let Err(err) = inserted {
            let mut count = self.count.lock().expect("queue count lock");
            *count = count.saturating_sub(1);
            self.capacity.notify_one();
            return Err(err).context("insert event");
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Read up to `limit` events in id order without consuming them.
    /// Rows whose payload no longer decodes are logged, deleted, and skipped.
    pub fn fetch_batch_sync(&self, limit: usize) -> Result<Vec<QueuedEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().expect("queue conn lock");
        let rows: Vec<(i64, String)> = {
            let mut stmt = conn
                .prepare("SELECT id, payload FROM events ORDER BY id LIMIT ?1")
                .context("prepare batch select")?;
            let mapped = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .context("select batch")?;
            mapped.collect::<rusqlite::Result<_>>().context("scan batch")?
        };

        let mut out = Vec::with_capacity(rows.len());
        let mut dropped = 0usize;
        for (id, payload) in rows {
            match serde_json::from_str::<RawEvent>(&payload) {
                Ok(event) => out.push(QueuedEvent { id, event }),
                Err(err) => {
                    tracing::warn!("event buffer: invalid payload id={}: {}", id, err);
                    if let Err(del_err) =
                        conn.execute("DELETE FROM events WHERE id = ?1", params![id])
                    {
                        tracing::warn!(
                            "event buffer: failed to delete bad payload id={}: {}",
                            id,
                            del_err
                        );
                    } else {
                        dropped += 1;
                    }
                }
            }
        }
        drop(conn);

        if dropped > 0 {
            let mut count = self.count.lock().expect("queue count lock");
            *count = count.saturating_sub(dropped);
            self.capacity.notify_all();
        }
        Ok(out)
    }

    /// Consume everything up to and including `last_id` and free capacity.
    pub fn delete_up_to_sync(&self, last_id: i64) -> Result<()> {
        if last_id <= 0 {
            return Ok(());
        }
        let affected = {
            let conn = self.conn.lock().expect("queue conn lock");
            conn.execute("DELETE FROM events WHERE id <= ?1", params![last_id])
                .context("delete batch")?
        };
        if affected > 0 {
            let mut count = self.count.lock().expect("queue count lock");
            *count = count.saturating_sub(affected);
            self.capacity.notify_all();
        }
        Ok(())
    }

    /// Number of buffered events according to the in-memory counter.
    pub fn len(&self) -> usize {
        *self.count.lock().expect("queue count lock")
    }

    /// Resolves after the next enqueue. One pending permit is retained, so a
    /// signal sent while nobody is waiting is not lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    // Async wrappers: the SQL core blocks (mutex, condvar, disk), so requests
    // and the flush worker reach it through the blocking pool.

    pub async fn enqueue(self: &Arc<Self>, event: RawEvent) -> Result<()> {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || queue.enqueue_sync(&event)).await?
    }

    pub async fn fetch_batch(self: &Arc<Self>, limit: usize) -> Result<Vec<QueuedEvent>> {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || queue.fetch_batch_sync(limit)).await?
    }

    pub async fn delete_up_to(self: &Arc<Self>, last_id: i64) -> Result<()> {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || queue.delete_up_to_sync(last_id)).await?
    }
}
