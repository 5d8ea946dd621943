//! Durable alert storage, abstracted as a trait so the sweep engine never
//! depends on a concrete database. The CRUD surface that creates/lists
//! alerts lives outside this crate; only `load_active`/`consume` are
//! specified here, matching the out-of-scope note that only the fields the
//! core reads/writes are part of this spec.

use crate::alerts::Alert;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This call won the race; the caller should emit the trigger.
    Consumed,
    /// Already consumed by a concurrent sweep (or never existed) — the
    /// caller drops the event silently.
    AlreadyGone,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn load_active(&self) -> Result<Vec<Alert>>;

    /// Atomically mark `alert_id` consumed. `delete` and `update
    /// triggered=true` are equivalent consume strategies; either is valid
    /// as long as a second call for the same id reports `AlreadyGone`.
    async fn consume(&self, alert_id: &str) -> Result<ConsumeOutcome>;
}

/// In-memory store for tests, matching the backend's own preference for
/// exercising its risk/signal logic without a database behind it.
#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: Mutex<HashMap<String, Alert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, alert: Alert) {
        self.alerts.lock().insert(alert.id.clone(), alert);
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn load_active(&self) -> Result<Vec<Alert>> {
        Ok(self
            .alerts
            .lock()
            .values()
            .filter(|a| a.active && !a.triggered)
            .cloned()
            .collect())
    }

    async fn consume(&self, alert_id: &str) -> Result<ConsumeOutcome> {
        let mut alerts = self.alerts.lock();
        match alerts.get_mut(alert_id) {
            Some(alert) if alert.active && !alert.triggered => {
                alert.triggered = true;
                Ok(ConsumeOutcome::Consumed)
            }
            _ => Ok(ConsumeOutcome::AlreadyGone),
        }
    }
}

/// `rusqlite::Connection` behind `parking_lot::Mutex`, WAL mode, every call
/// wrapped in `spawn_blocking` so the sweep loop never stalls the reactor —
/// grounded on `signals::db_storage::DbSignalStorage`'s connection shape,
/// tightened: the backend calls rusqlite synchronously from a few async
/// handlers without `spawn_blocking`; this store always hops to the
/// blocking pool since the alert sweep runs on the same runtime as every
/// client socket's read loop.
pub struct SqliteAlertStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS price_alerts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    exchange TEXT NOT NULL,
    market TEXT NOT NULL,
    symbol TEXT NOT NULL,
    target_value REAL NOT NULL,
    initial_price REAL,
    active INTEGER NOT NULL DEFAULT 1,
    triggered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_alerts_active
    ON price_alerts(active, triggered);
"#;

impl SqliteAlertStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| crate::error::Error::Internal(e.into()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| crate::error::Error::Internal(e.into()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
        let exchange_str: String = row.get("exchange")?;
        let market_str: String = row.get("market")?;
        let symbol_str: String = row.get("symbol")?;
        let created_at_str: String = row.get("created_at")?;

        let exchange = crate::exchange::ExchangeId::parse(&exchange_str)
            .unwrap_or(crate::exchange::ExchangeId::Binance);
        let market = if market_str == "futures" {
            crate::exchange::Market::Futures
        } else {
            crate::exchange::Market::Spot
        };
        let symbol = crate::symbol::normalize(&symbol_str)
            .unwrap_or_else(|| crate::symbol::normalize("UNKNOWNUSDT").unwrap());
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());

        Ok(Alert {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            exchange,
            market,
            symbol,
            target_value: row.get("target_value")?,
            initial_price: row.get("initial_price")?,
            active: row.get::<_, i64>("active")? != 0,
            triggered: row.get::<_, i64>("triggered")? != 0,
            created_at,
        })
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    async fn load_active(&self) -> Result<Vec<Alert>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM price_alerts WHERE active = 1 AND triggered = 0",
                )
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            let rows = stmt
                .query_map(params![], Self::row_to_alert)
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| crate::error::Error::Internal(e.into()))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| crate::error::Error::Internal(e.into()))?
    }

    async fn consume(&self, alert_id: &str) -> Result<ConsumeOutcome> {
        let conn = self.conn.clone();
        let alert_id = alert_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let changed = conn
                .execute(
                    "UPDATE price_alerts SET triggered = 1 \
                     WHERE id = ?1 AND active = 1 AND triggered = 0",
                    params![alert_id],
                )
                .map_err(|e| crate::error::Error::Internal(e.into()))?;
            if changed == 0 {
                warn!(alert_id, "consume found alert already gone");
                Ok(ConsumeOutcome::AlreadyGone)
            } else {
                Ok(ConsumeOutcome::Consumed)
            }
        })
        .await
        .map_err(|e| crate::error::Error::Internal(e.into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeId, Market};

    fn sample_alert(id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: "BTC breakout".to_string(),
            description: "".to_string(),
            exchange: ExchangeId::Binance,
            market: Market::Futures,
            symbol: crate::symbol::normalize("BTCUSDT").unwrap(),
            target_value: 101.0,
            initial_price: Some(100.0),
            active: true,
            triggered: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_store_loads_only_active_untriggered() {
        let store = InMemoryAlertStore::new();
        store.insert(sample_alert("a1"));
        let mut triggered = sample_alert("a2");
        triggered.triggered = true;
        store.insert(triggered);

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a1");
    }

    #[tokio::test]
    async fn second_consume_reports_already_gone() {
        let store = InMemoryAlertStore::new();
        store.insert(sample_alert("a1"));
        assert_eq!(store.consume("a1").await.unwrap(), ConsumeOutcome::Consumed);
        assert_eq!(store.consume("a1").await.unwrap(), ConsumeOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn consuming_an_unknown_id_is_already_gone() {
        let store = InMemoryAlertStore::new();
        assert_eq!(
            store.consume("nope").await.unwrap(),
            ConsumeOutcome::AlreadyGone
        );
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_through_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.db");
        let store = SqliteAlertStore::open(path.to_str().unwrap()).unwrap();

        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO price_alerts (id, user_id, name, description, exchange, market, symbol, target_value, initial_price, active, triggered, created_at) \
                 VALUES (?1, 'user-1', 'n', 'd', 'binance', 'futures', 'BTCUSDT', 101.0, 100.0, 1, 0, ?2)",
                params!["a1", chrono::Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a1");

        assert_eq!(store.consume("a1").await.unwrap(), ConsumeOutcome::Consumed);
        assert_eq!(store.consume("a1").await.unwrap(), ConsumeOutcome::AlreadyGone);
        assert!(store.load_active().await.unwrap().is_empty());
    }
}
