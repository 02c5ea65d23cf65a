// Store - the analytical stats table
//
// Owns the one DuckDB connection; the columnar format tolerates a single
// writer, so every access goes through one mutex and the blocking pool.
// Batches are inserted transactionally: the ingest endpoint reports failure
// for the whole batch and the proxy re-sends it, so a half-applied batch
// never becomes visible.

use crate::analyzer::{Analyzer, StatRow};
use anyhow::{Context, Result};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    analyzer: Arc<Analyzer>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open stats database {}", path.display()))?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // DuckDB has no CREATE TYPE IF NOT EXISTS; tolerate re-runs instead.
        for stmt in [
            "CREATE TYPE agent_type_t AS ENUM ('feed', 'bot', 'browser')",
            "CREATE TYPE agent_os_t AS ENUM ('Android', 'Windows', 'iOS', 'macOS', 'Linux')",
        ] {
            if let Err(err) = conn.execute(stmt, []) {
                if !err.to_string().contains("already exists") {
                    return Err(err).context("create enum types");
                }
            }
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stats (
                 date       DATE,
                 time       TIME,
                 host       VARCHAR,
                 path       VARCHAR,
                 query      VARCHAR,
                 ip         VARCHAR,
                 user_agent VARCHAR,
                 referrer   VARCHAR,
                 type       agent_type_t,
                 agent      VARCHAR,
                 os         agent_os_t,
                 ref_domain VARCHAR,
                 mult       INTEGER,
                 set_cookie UUID,
                 uniq       UUID
             );
             ALTER TABLE stats ADD COLUMN IF NOT EXISTS host VARCHAR;
             CREATE INDEX IF NOT EXISTS idx_stats_host_date ON stats(host, date);",
        )
        .context("init stats schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            analyzer: Arc::new(Analyzer::new()),
        })
    }

    /// Insert a batch in one transaction, in order. Each row first passes
    /// through the analyzer; a confirmed second visit additionally rewrites
    /// the earlier tentative row's uniq. Any error rolls the batch back.
    pub async fn insert(&self, rows: Vec<StatRow>) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let analyzer = Arc::clone(&self.analyzer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = conn.lock().expect("stats db lock");
            let tx = conn.transaction().context("begin insert transaction")?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO stats
                     (date, time, host, path, query, ip, user_agent, referrer,
                      type, agent, os, ref_domain, mult, set_cookie, uniq)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                let mut confirm =
                    tx.prepare("UPDATE stats SET uniq = ? WHERE set_cookie = ?")?;

                for mut row in rows {
                    analyzer.analyze(&mut row);
                    insert.execute(params![
                        null_str(&row.date),
                        null_str(&row.time),
                        null_str(&row.host),
                        null_str(&row.path),
                        null_str(&row.query),
                        null_str(&row.ip),
                        null_str(&row.user_agent),
                        null_str(&row.referrer),
                        null_str(&row.r#type),
                        null_str(&row.agent),
                        null_str(&row.os),
                        null_str(&row.ref_domain),
                        row.mult,
                        null_str(&row.set_cookie),
                        null_str(&row.uniq),
                    ])?;

                    if row.second_visit && !row.uniq.is_empty() {
                        confirm.execute(params![row.uniq, row.uniq])?;
                    }
                }
            }
            tx.commit().context("commit insert transaction")?;
            Ok(())
        })
        .await?
    }

    /// Run a read query on the store connection from async context.
    pub async fn with_conn<T, F>(&self, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("stats db lock");
            func(&conn)
        })
        .await?
    }
}

fn null_str(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::hash_uuid;

    fn browser_row(date: &str, ip: &str) -> StatRow {
        StatRow {
            date: date.into(),
            time: "10:00:00".into(),
            host: "example.com".into(),
            path: "/".into(),
            ip: ip.into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_analyze() {
        let store = Store::open_in_memory().unwrap();
        store.insert(vec![browser_row("2024-05-01", "1.2.3.4")]).await.unwrap();

        let (agent, typ, mult): (String, String, i64) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT agent, CAST(type AS VARCHAR), mult FROM stats",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(agent, "Firefox");
        assert_eq!(typ, "browser");
        assert_eq!(mult, 1);
    }

    #[tokio::test]
    async fn test_empty_strings_become_null() {
        let store = Store::open_in_memory().unwrap();
        let mut row = browser_row("2024-05-01", "1.2.3.4");
        row.referrer = String::new();
        row.query = String::new();
        store.insert(vec![row]).await.unwrap();

        let (referrer, query, set_cookie): (Option<String>, Option<String>, Option<String>) =
            store
                .with_conn(|conn| {
                    Ok(conn.query_row(
                        "SELECT referrer, query, CAST(set_cookie AS VARCHAR) FROM stats",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?)
                })
                .await
                .unwrap();
        assert_eq!(referrer, None);
        assert_eq!(query, None);
        assert_eq!(set_cookie, None);
    }

    #[tokio::test]
    async fn test_second_visit_confirms_tentative_row() {
        let store = Store::open_in_memory().unwrap();
        let visitor = "1e6a0a44-8fa9-4a11-9c3f-6a1f2b3c4d5e";

        // First visit: tentative row with set_cookie and no uniq.
        let mut first = browser_row("2024-05-01", "1.2.3.4");
        first.set_cookie = visitor.into();
        store.insert(vec![first]).await.unwrap();

        let tentative_uniq: Option<String> = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT CAST(uniq AS VARCHAR) FROM stats", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(tentative_uniq, None);

        // Second visit: confirmed uniq, triggers the one-shot update.
        let mut second = browser_row("2024-05-02", "1.2.3.4");
        second.uniq = visitor.into();
        second.second_visit = true;
        store.insert(vec![second]).await.unwrap();

        let confirmed: i64 = store
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM stats
                     WHERE CAST(set_cookie AS VARCHAR) = ? AND CAST(uniq AS VARCHAR) = ?",
                    [visitor, visitor],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn test_unique_visitor_rollup_uses_max_mult() {
        let store = Store::open_in_memory().unwrap();

        let mut rows = Vec::new();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            rows.push(browser_row("2024-05-01", ip));
        }
        // Two fetches by the same reader. Feeds never send the cookie back,
        // so each fetch carries a freshly minted set_cookie and an empty
        // uniq; the analyzer collapses both onto the same UA-derived id.
        for _ in 0..2 {
            rows.push(StatRow {
                date: "2024-05-01".into(),
                time: "11:00:00".into(),
                host: "example.com".into(),
                path: "/feed".into(),
                ip: "9.9.9.9".into(),
                user_agent: "SomeReader RSS - 100 subscribers".into(),
                set_cookie: crate::events::new_uuid(),
                ..Default::default()
            });
        }
        store.insert(rows).await.unwrap();

        let counts: Vec<(String, i64)> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "WITH subq AS (
                         SELECT type, date, MAX(mult) AS mult
                         FROM stats
                         WHERE date >= '2024-05-01' AND date <= '2024-05-01'
                         GROUP BY type, date, uniq
                     )
                     SELECT CAST(type AS VARCHAR), CAST(SUM(mult) AS BIGINT)
                     FROM subq GROUP BY type ORDER BY 1",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await
            .unwrap();

        // Two feed rows sharing a uniq with mult=100 count once as 100,
        // not 200; three distinct browsers count as 3.
        assert_eq!(counts, vec![("browser".to_string(), 3), ("feed".to_string(), 100)]);
    }

    #[tokio::test]
    async fn test_feed_rows_keep_ua_identity_despite_minted_cookie() {
        // The middleware mints a tentative cookie for every cookieless
        // request, feed fetchers included. Their stored uniq must still be
        // the UA-derived hash, not NULL.
        let store = Store::open_in_memory().unwrap();
        let rows = vec![
            StatRow {
                date: "2024-05-01".into(),
                time: "09:00:00".into(),
                host: "example.com".into(),
                path: "/feed".into(),
                ip: "1.2.3.4".into(),
                user_agent:
                    "NewsBlur Feed Fetcher - 54 subscribers - https://www.newsblur.com/site/6865328/grumpy-website"
                        .into(),
                r#type: "feed".into(),
                set_cookie: crate::events::new_uuid(),
                ..Default::default()
            },
            StatRow {
                date: "2024-05-01".into(),
                time: "09:05:00".into(),
                host: "example.com".into(),
                path: "/feed".into(),
                ip: "5.6.7.8".into(),
                user_agent: "Feedbin feed-id:1373711 - 192 subscribers".into(),
                r#type: "feed".into(),
                set_cookie: crate::events::new_uuid(),
                ..Default::default()
            },
        ];
        store.insert(rows).await.unwrap();

        let stored: Vec<(String, String, i64, Option<String>)> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent, CAST(type AS VARCHAR), mult, CAST(uniq AS VARCHAR)
                     FROM stats ORDER BY agent",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
                }
                Ok(out)
            })
            .await
            .unwrap();

        assert_eq!(
            stored,
            vec![
                (
                    "Feedbin".to_string(),
                    "feed".to_string(),
                    192,
                    Some(hash_uuid("Feedbin/1373711")),
                ),
                (
                    "NewsBlur Feed Fetcher".to_string(),
                    "feed".to_string(),
                    54,
                    Some(hash_uuid("NewsBlur Feed Fetcher")),
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = std::env::temp_dir().join(format!(
            "banan-stats-store-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stats.duckdb");
        {
            let store = Store::open(&path).unwrap();
            store.insert(vec![browser_row("2024-05-01", "1.2.3.4")]).await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM stats", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
