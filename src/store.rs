use crate::error::{Error, Result};
use crate::types::{
    Anonymity, Endpoint, Outcome, Protocol, Proxy, ProxyStatus, TestRecord, Verdict,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

const STORE_RETRIES: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Which SQL dialect the pool speaks. The DML below is portable; only the
/// DDL differs between the two backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    MySql,
    Sqlite,
}

impl DbKind {
    fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("mysql:") {
            Ok(DbKind::MySql)
        } else if url.starts_with("sqlite:") {
            Ok(DbKind::Sqlite)
        } else {
            Err(Error::Config(format!("unsupported database url {url:?}")))
        }
    }
}

const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS proxy (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        protocol TINYINT NOT NULL,
        ip BIGINT NOT NULL,
        port INT NOT NULL,
        country CHAR(2) NULL,
        status TINYINT NOT NULL,
        latency_ms BIGINT NULL,
        anonymous TINYINT NULL,
        test_count BIGINT NOT NULL DEFAULT 0,
        fail_count BIGINT NOT NULL DEFAULT 0,
        refused_count BIGINT NOT NULL DEFAULT 0,
        last_tested_at BIGINT NULL,
        created_at BIGINT NOT NULL,
        modified_at BIGINT NOT NULL,
        UNIQUE KEY uq_proxy_endpoint (protocol, ip, port)
    )",
    "CREATE TABLE IF NOT EXISTS proxy_test (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        proxy_id BIGINT NOT NULL,
        outcome TINYINT NOT NULL,
        latency_ms BIGINT NULL,
        started_at BIGINT NOT NULL,
        finished_at BIGINT NOT NULL,
        info VARCHAR(255) NOT NULL DEFAULT '',
        INDEX ix_proxy_test_latest (proxy_id, finished_at),
        CONSTRAINT fk_proxy_test_proxy FOREIGN KEY (proxy_id) REFERENCES proxy (id)
    )",
];

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS proxy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol INTEGER NOT NULL,
        ip INTEGER NOT NULL,
        port INTEGER NOT NULL,
        country TEXT NULL,
        status INTEGER NOT NULL,
        latency_ms INTEGER NULL,
        anonymous INTEGER NULL,
        test_count INTEGER NOT NULL DEFAULT 0,
        fail_count INTEGER NOT NULL DEFAULT 0,
        refused_count INTEGER NOT NULL DEFAULT 0,
        last_tested_at INTEGER NULL,
        created_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        UNIQUE (protocol, ip, port)
    )",
    "CREATE TABLE IF NOT EXISTS proxy_test (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proxy_id INTEGER NOT NULL REFERENCES proxy (id),
        outcome INTEGER NOT NULL,
        latency_ms INTEGER NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER NOT NULL,
        info TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS ix_proxy_test_latest
        ON proxy_test (proxy_id, finished_at)",
];

const PROXY_COLUMNS: &str = "id, protocol, ip, port, country, status, latency_ms, anonymous, \
                             test_count, fail_count, refused_count, last_tested_at, \
                             created_at, modified_at";

/// Counts per proxy status, as returned by [`Store::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolCounts {
    pub new: i64,
    pub testing: i64,
    pub ok: i64,
    pub fail: i64,
    pub banned: i64,
    pub total: i64,
}

/// Durable, concurrency-safe storage of proxies and their test history.
/// The store is the only mutable state in the process; workers hand it
/// immutable verdicts and it decides the row transitions.
#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    kind: DbKind,
}

impl Store {
    /// Connect with a pool of `max_connections`. Startup-time failures are
    /// reported as [`Error::StoreUnavailable`] so `main` can exit 3.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let kind = DbKind::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        info!(backend = ?kind, max_connections, "connected to database");
        Ok(Store { pool, kind })
    }

    pub async fn migrate(&self) -> Result<()> {
        let statements = match self.kind {
            DbKind::MySql => MYSQL_SCHEMA,
            DbKind::Sqlite => SQLITE_SCHEMA,
        };
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert the endpoint or return the existing row; idempotent. The
    /// second tuple field is true when a new row was created.
    pub async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<(Proxy, bool)> {
        self.with_retry("upsert_endpoint", || {
            Box::pin(self.upsert_inner(endpoint))
        })
        .await
    }

    async fn upsert_inner(&self, endpoint: Endpoint) -> Result<(Proxy, bool)> {
        if let Some(existing) = self.find_endpoint(endpoint).await? {
            return Ok((existing, false));
        }
        let now = to_millis(Utc::now());
        let inserted = sqlx::query(
            "INSERT INTO proxy (protocol, ip, port, status, test_count, fail_count, \
             refused_count, created_at, modified_at) VALUES (?, ?, ?, ?, 0, 0, 0, ?, ?)",
        )
        .bind(endpoint.protocol.code())
        .bind(i64::from(endpoint.ip_u32()))
        .bind(i64::from(endpoint.port))
        .bind(ProxyStatus::New.code())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let created = match inserted {
            Ok(_) => true,
            // A concurrent ingest of the same triple won the race; fall
            // through to the lookup.
            Err(e) if is_unique_violation(&e) => {
                debug!(endpoint = %endpoint, "endpoint already ingested concurrently");
                false
            }
            Err(e) => return Err(e.into()),
        };
        let proxy = self
            .find_endpoint(endpoint)
            .await?
            .ok_or_else(|| Error::Store(sqlx::Error::RowNotFound))?;
        Ok((proxy, created))
    }

    async fn find_endpoint(&self, endpoint: Endpoint) -> Result<Option<Proxy>> {
        let row = sqlx::query(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxy WHERE protocol = ? AND ip = ? AND port = ?"
        ))
        .bind(endpoint.protocol.code())
        .bind(i64::from(endpoint.ip_u32()))
        .bind(i64::from(endpoint.port))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| proxy_from_row(&r)).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<Proxy>> {
        let row = sqlx::query(&format!("SELECT {PROXY_COLUMNS} FROM proxy WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| proxy_from_row(&r)).transpose()
    }

    /// Atomically claim up to `limit` endpoints of `protocol` that are due
    /// for testing: not TESTING or BANNED, and untested within the window.
    /// Each candidate is taken with a conditional UPDATE, so concurrent
    /// callers never receive overlapping sets. Ordering is oldest test
    /// first, never-tested rows first, ties by creation time.
    pub async fn claim_batch(
        &self,
        protocol: Protocol,
        limit: usize,
        not_tested_within: Duration,
    ) -> Result<Vec<Proxy>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.with_retry("claim_batch", || {
            Box::pin(self.claim_inner(protocol, limit, not_tested_within))
        })
        .await
    }

    async fn claim_inner(
        &self,
        protocol: Protocol,
        limit: usize,
        not_tested_within: Duration,
    ) -> Result<Vec<Proxy>> {
        let now = Utc::now();
        let cutoff = to_millis(now) - not_tested_within.as_millis() as i64;
        let candidates: Vec<i64> = sqlx::query(
            "SELECT id FROM proxy \
             WHERE protocol = ? AND status NOT IN (1, 4) \
               AND (last_tested_at IS NULL OR last_tested_at < ?) \
             ORDER BY COALESCE(last_tested_at, 0) ASC, created_at ASC \
             LIMIT ?",
        )
        .bind(protocol.code())
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id"))
        .collect::<sqlx::Result<_>>()?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Re-check the guard conditions in the UPDATE itself; only the
            // caller whose update sticks owns the claim.
            let result = sqlx::query(
                "UPDATE proxy SET status = 1, modified_at = ? \
                 WHERE id = ? AND status NOT IN (1, 4) \
                   AND (last_tested_at IS NULL OR last_tested_at < ?)",
            )
            .bind(to_millis(now))
            .bind(id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                claimed.push(id);
            }
        }

        let mut proxies = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some(proxy) = self.get(id).await? {
                proxies.push(proxy);
            }
        }
        Ok(proxies)
    }

    /// Persist a verdict: insert the test record and update the proxy row
    /// in a single transaction, releasing the claim.
    pub async fn release(
        &self,
        proxy_id: i64,
        verdict: &Verdict,
        ban_threshold: i64,
    ) -> Result<()> {
        self.with_retry("release", || {
            Box::pin(self.release_inner(proxy_id, verdict, ban_threshold))
        })
        .await
    }

    async fn release_inner(
        &self,
        proxy_id: i64,
        verdict: &Verdict,
        ban_threshold: i64,
    ) -> Result<()> {
        let info: String = verdict.info.chars().take(255).collect();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO proxy_test (proxy_id, outcome, latency_ms, started_at, \
             finished_at, info) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(proxy_id)
        .bind(verdict.outcome.code())
        .bind(verdict.latency_ms)
        .bind(to_millis(verdict.started_at))
        .bind(to_millis(verdict.finished_at))
        .bind(info.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT fail_count, refused_count FROM proxy WHERE id = ?")
            .bind(proxy_id)
            .fetch_one(&mut *tx)
            .await?;
        let prev_fails: i64 = row.try_get("fail_count")?;
        let prev_refused: i64 = row.try_get("refused_count")?;
        let (status, fail_count, refused_count) =
            next_status(verdict.outcome, prev_fails, prev_refused, ban_threshold);

        sqlx::query(
            "UPDATE proxy SET status = ?, fail_count = ?, refused_count = ?, \
             test_count = test_count + 1, country = COALESCE(?, country), \
             latency_ms = COALESCE(?, latency_ms), anonymous = COALESCE(?, anonymous), \
             last_tested_at = ?, modified_at = ? \
             WHERE id = ?",
        )
        .bind(status.code())
        .bind(fail_count)
        .bind(refused_count)
        .bind(verdict.country.as_deref())
        .bind(verdict.latency_ms)
        .bind(verdict.anonymous.code())
        .bind(to_millis(verdict.finished_at))
        .bind(to_millis(Utc::now()))
        .bind(proxy_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset claims abandoned by crashed or aborted workers: any TESTING
    /// row untouched for longer than `grace` becomes FAIL with a synthetic
    /// INTERNAL_ERROR record. Idempotent within one sweep window.
    pub async fn recover_stale(&self, grace: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = to_millis(now) - grace.as_millis() as i64;
        let stale: Vec<i64> = sqlx::query(
            "SELECT id FROM proxy WHERE status = 1 AND modified_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id"))
        .collect::<sqlx::Result<_>>()?;

        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut recovered = 0u64;
        for id in stale {
            let result = sqlx::query(
                "UPDATE proxy SET status = 3, fail_count = fail_count + 1, \
                 refused_count = 0, test_count = test_count + 1, \
                 last_tested_at = ?, modified_at = ? \
                 WHERE id = ? AND status = 1",
            )
            .bind(to_millis(now))
            .bind(to_millis(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                continue;
            }
            sqlx::query(
                "INSERT INTO proxy_test (proxy_id, outcome, latency_ms, started_at, \
                 finished_at, info) VALUES (?, ?, NULL, ?, ?, ?)",
            )
            .bind(id)
            .bind(Outcome::InternalError.code())
            .bind(to_millis(now))
            .bind(to_millis(now))
            .bind("stale claim recovered")
            .execute(&mut *tx)
            .await?;
            recovered += 1;
        }
        tx.commit().await?;
        warn!(recovered, "reset stale testing claims");
        Ok(recovered)
    }

    /// The freshest working endpoints: OK rows of the protocol, excluding
    /// the listed countries, cheapest latency first, most recent test
    /// breaking ties.
    pub async fn top_working(
        &self,
        protocol: Protocol,
        limit: usize,
        ignore_countries: &[String],
    ) -> Result<Vec<Proxy>> {
        let mut sql = format!(
            "SELECT {PROXY_COLUMNS} FROM proxy WHERE protocol = ? AND status = 2"
        );
        if !ignore_countries.is_empty() {
            let marks = vec!["?"; ignore_countries.len()].join(", ");
            sql.push_str(&format!(
                " AND (country IS NULL OR country NOT IN ({marks}))"
            ));
        }
        sql.push_str(
            " ORDER BY COALESCE(latency_ms, 999999999) ASC, \
              COALESCE(last_tested_at, 0) DESC LIMIT ?",
        );

        let mut query = sqlx::query(&sql).bind(protocol.code());
        for country in ignore_countries {
            query = query.bind(country.as_str());
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(proxy_from_row).collect()
    }

    pub async fn stats(&self) -> Result<PoolCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM proxy GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = PoolCounts::default();
        for row in rows {
            let status: i64 = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match ProxyStatus::from_code(status) {
                Some(ProxyStatus::New) => counts.new = n,
                Some(ProxyStatus::Testing) => counts.testing = n,
                Some(ProxyStatus::Ok) => counts.ok = n,
                Some(ProxyStatus::Fail) => counts.fail = n,
                Some(ProxyStatus::Banned) => counts.banned = n,
                None => warn!(status, "unknown status code in proxy table"),
            }
            counts.total += n;
        }
        Ok(counts)
    }

    /// Maintenance deletion of old dead wood: FAIL/BANNED rows untouched
    /// for longer than `older_than`, together with their test history.
    pub async fn prune(&self, older_than: Duration) -> Result<u64> {
        let cutoff = to_millis(Utc::now()) - older_than.as_millis() as i64;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM proxy_test WHERE proxy_id IN \
             (SELECT id FROM proxy WHERE status IN (3, 4) AND modified_at < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM proxy WHERE status IN (3, 4) AND modified_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Full test history of one proxy, oldest first.
    pub async fn test_records(&self, proxy_id: i64) -> Result<Vec<TestRecord>> {
        let rows = sqlx::query(
            "SELECT id, proxy_id, outcome, latency_ms, started_at, finished_at, info \
             FROM proxy_test WHERE proxy_id = ? ORDER BY finished_at ASC, id ASC",
        )
        .bind(proxy_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn with_retry<'a, T, F>(&'a self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'a, Result<T>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < STORE_RETRIES && is_transient(&e) => {
                    attempt += 1;
                    warn!(op, error = %e, attempt, "transient store failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_status(
        &self,
        id: i64,
        status: ProxyStatus,
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE proxy SET status = ?, modified_at = ? WHERE id = ?")
            .bind(status.code())
            .bind(to_millis(modified_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Status transition for one released verdict. `fail_count` counts
/// consecutive non-OK tests and resets on OK. The ban decision uses the
/// separate `refused_count` streak: only back-to-back CONN_REFUSED/TIMEOUT
/// results accumulate toward the threshold, and any other outcome resets
/// that streak. Forbidden countries ban immediately.
fn next_status(
    outcome: Outcome,
    prev_fails: i64,
    prev_refused: i64,
    ban_threshold: i64,
) -> (ProxyStatus, i64, i64) {
    match outcome {
        Outcome::Ok => (ProxyStatus::Ok, 0, 0),
        Outcome::ForbiddenCountry => (ProxyStatus::Banned, prev_fails + 1, 0),
        Outcome::ConnRefused | Outcome::Timeout => {
            let refused = prev_refused + 1;
            if refused >= ban_threshold {
                (ProxyStatus::Banned, prev_fails + 1, refused)
            } else {
                (ProxyStatus::Fail, prev_fails + 1, refused)
            }
        }
        Outcome::BadResponse | Outcome::NonAnonymous | Outcome::InternalError => {
            (ProxyStatus::Fail, prev_fails + 1, 0)
        }
    }
}

fn is_transient(e: &Error) -> bool {
    matches!(
        e,
        Error::Store(sqlx::Error::Io(_))
            | Error::Store(sqlx::Error::PoolTimedOut)
            | Error::Store(sqlx::Error::Protocol(_))
    )
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn proxy_from_row(row: &AnyRow) -> Result<Proxy> {
    let protocol_code: i64 = row.try_get("protocol")?;
    let status_code: i64 = row.try_get("status")?;
    let ip_raw: i64 = row.try_get("ip")?;
    let port_raw: i64 = row.try_get("port")?;
    let protocol = Protocol::from_code(protocol_code)
        .ok_or_else(|| Error::parse(protocol_code.to_string(), "unknown protocol code"))?;
    let status = ProxyStatus::from_code(status_code)
        .ok_or_else(|| Error::parse(status_code.to_string(), "unknown status code"))?;
    let endpoint = Endpoint::new(
        protocol,
        std::net::Ipv4Addr::from(ip_raw as u32),
        port_raw as u16,
    );
    Ok(Proxy {
        id: row.try_get("id")?,
        endpoint,
        country: row.try_get("country")?,
        status,
        latency_ms: row.try_get("latency_ms")?,
        anonymous: Anonymity::from_code(row.try_get("anonymous")?),
        test_count: row.try_get("test_count")?,
        fail_count: row.try_get("fail_count")?,
        refused_count: row.try_get("refused_count")?,
        last_tested_at: row
            .try_get::<Option<i64>, _>("last_tested_at")?
            .map(from_millis),
        created_at: from_millis(row.try_get("created_at")?),
        modified_at: from_millis(row.try_get("modified_at")?),
    })
}

fn record_from_row(row: &AnyRow) -> Result<TestRecord> {
    let outcome_code: i64 = row.try_get("outcome")?;
    Ok(TestRecord {
        id: row.try_get("id")?,
        proxy_id: row.try_get("proxy_id")?,
        outcome: Outcome::from_code(outcome_code)
            .ok_or_else(|| Error::parse(outcome_code.to_string(), "unknown outcome code"))?,
        latency_ms: row.try_get("latency_ms")?,
        started_at: from_millis(row.try_get("started_at")?),
        finished_at: from_millis(row.try_get("finished_at")?),
        info: row.try_get("info")?,
    })
}
