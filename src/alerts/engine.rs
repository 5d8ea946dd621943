//! Price Alert Engine — periodic sweep, crossing detection, at-most-once
//! trigger emission.
//!
//! Grounded on the backend's `RiskManager`, which is likewise exercised
//! directly with no database behind it in tests and owns only transient
//! runtime state (the durable alert record lives in [`super::store`]).

use crate::alerts::{has_reached, is_invalid_snapshot, Alert, Condition};
use crate::alerts::store::{AlertStore, ConsumeOutcome};
use crate::exchange::ExchangeRegistry;
use crate::push::events::{AlertTriggeredPayload, ServerEvent};
use crate::push::hub::Hub;
use crate::resolver;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    registry: Arc<ExchangeRegistry>,
    hub: Arc<Hub>,
    /// Per-process in-flight set keyed by alert id, preventing two
    /// concurrent sweeps from double-processing the same alert. Cleared at
    /// the end of `process_one` on every exit path (trigger, skip, or
    /// error) — its job is only to serialize the brief window a single
    /// alert is actually being evaluated, not to track sweep history.
    inflight: Mutex<HashSet<String>>,
    /// Last observed live price per alert id, falling back to
    /// `initial_price` on an alert's first sweep.
    previous_observed: Mutex<HashMap<String, f64>>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn AlertStore>, registry: Arc<ExchangeRegistry>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            hub,
            inflight: Mutex::new(HashSet::new()),
            previous_observed: Mutex::new(HashMap::new()),
        })
    }

    /// Run one sweep over every active, non-triggered alert.
    pub async fn sweep_once(&self) {
        let alerts = match self.store.load_active().await {
            Ok(alerts) => alerts,
            Err(err) => {
                warn!(?err, "failed to load active alerts for sweep");
                return;
            }
        };
        for alert in alerts {
            self.process_one(alert).await;
        }
    }

    async fn process_one(&self, alert: Alert) {
        {
            let mut inflight = self.inflight.lock();
            if !inflight.insert(alert.id.clone()) {
                // A concurrent sweep already owns this alert.
                return;
            }
        }
        self.process_one_inner(&alert).await;
        self.inflight.lock().remove(&alert.id);
    }

    async fn process_one_inner(&self, alert: &Alert) {
        let Some(adapter) = self.registry.get(alert.exchange) else {
            warn!(exchange = %alert.exchange, "alert references an unknown exchange, skipping");
            return;
        };

        // Step 2: resolve the live price via the resolver, against the
        // alert's own exchange only — the sweep never escalates to a
        // different venue.
        let current = match resolver::resolve(&adapter, alert.market, alert.symbol.as_str()).await {
            Ok(resolved) => resolved.price,
            Err(_) => return, // unresolved this tick: no state change
        };

        let Some(initial_price) = alert.initial_price else {
            return;
        };
        // Anti-false-positive guard: a price alert whose creation-time
        // snapshot never satisfied the derivation rule never fires.
        if is_invalid_snapshot(initial_price, alert.target_value) {
            return;
        }

        // Step 3: never trust the stored condition, always re-derive.
        let condition = Condition::derive(initial_price, alert.target_value);

        let previous = {
            let mut previous_observed = self.previous_observed.lock();
            *previous_observed
                .entry(alert.id.clone())
                .or_insert(initial_price)
        };

        if !has_reached(previous, current, alert.target_value, condition) {
            self.previous_observed.lock().insert(alert.id.clone(), current);
            return;
        }

        match self.store.consume(&alert.id).await {
            Ok(ConsumeOutcome::AlreadyGone) => {
                // Concurrent consumer won the race; drop silently.
            }
            Ok(ConsumeOutcome::Consumed) => {
                self.previous_observed.lock().remove(&alert.id);
                let payload = AlertTriggeredPayload {
                    id: alert.id.clone(),
                    alert_id: alert.id.clone(),
                    name: alert.name.clone(),
                    description: alert.description.clone(),
                    triggered: true,
                    triggered_at: chrono::Utc::now(),
                    current_price: current,
                    target_value: alert.target_value,
                    condition,
                    symbol: alert.symbol.as_str().to_string(),
                    canonical_symbol: alert.symbol.without_quote().to_string(),
                    alert_type: "price",
                    initial_price: Some(initial_price),
                };
                info!(alert_id = %alert.id, user_id = %alert.user_id, "price alert triggered");
                self.hub
                    .send_to_user(&alert.user_id, ServerEvent::AlertTriggered { payload });
            }
            Err(err) => {
                // Database failure other than "not found" — propagate by
                // aborting this alert's processing for this tick; the next
                // sweep retries since `previous_observed` was left
                // untouched and the alert remains active in the store.
                warn!(alert_id = %alert.id, ?err, "failed to consume triggered alert");
            }
        }
    }

    #[cfg(test)]
    fn previous_observed(&self, alert_id: &str) -> Option<f64> {
        self.previous_observed.lock().get(alert_id).copied()
    }
}

/// Drives [`AlertEngine::sweep_once`] on a `tokio::time::interval`, the
/// dedicated alert-sweep task named in the task inventory. Exits cleanly
/// when `shutdown` is notified.
pub async fn run_sweep_loop(
    engine: Arc<AlertEngine>,
    interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => engine.sweep_once().await,
            _ = shutdown.notified() => {
                info!("alert sweep loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::store::InMemoryAlertStore;
    use crate::error::{Error, Result, UpstreamStatus};
    use crate::exchange::{ExchangeAdapter, ExchangeId, LastPricesOptions, Market};
    use crate::symbol::CanonicalSymbol;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedAdapter {
        prices: StdMutex<std::collections::VecDeque<Option<f64>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeAdapter for ScriptedAdapter {
        fn id(&self) -> ExchangeId {
            ExchangeId::Binance
        }

        async fn last_prices(
            &self,
            _symbols: &[CanonicalSymbol],
            _market: Market,
            _opts: LastPricesOptions,
        ) -> Result<StdHashMap<CanonicalSymbol, f64>> {
            Ok(StdHashMap::new())
        }

        async fn ticker_price(&self, _symbol: &CanonicalSymbol, _market: Market) -> Result<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut prices = self.prices.lock().unwrap();
            match prices.pop_front() {
                Some(Some(p)) => Ok(Some(p)),
                Some(None) => Err(Error::UpstreamUnavailable {
                    exchange: "binance".into(),
                    status: UpstreamStatus::ServiceUnavailable,
                }),
                None => Ok(None),
            }
        }

        async fn active_symbols(&self, _market: Market) -> Result<std::collections::HashSet<CanonicalSymbol>> {
            Ok(std::collections::HashSet::new())
        }

        async fn klines(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: crate::candle::Interval,
            _limit: usize,
            _end_before: Option<i64>,
        ) -> Result<Vec<crate::candle::Candle>> {
            Ok(vec![])
        }

        async fn subscribe_kline(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: crate::candle::Interval,
        ) -> Result<()> {
            Ok(())
        }

        async fn unsubscribe_kline(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: crate::candle::Interval,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn engine_with_prices(prices: Vec<Option<f64>>) -> (Arc<AlertEngine>, Arc<InMemoryAlertStore>) {
        let adapter = Arc::new(ScriptedAdapter {
            prices: StdMutex::new(prices.into()),
            calls: AtomicUsize::new(0),
        });
        let mut map: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>> = HashMap::new();
        map.insert(ExchangeId::Binance, adapter);
        let registry = Arc::new(ExchangeRegistry::new(map));
        let hub = Arc::new(Hub::new());
        let store = Arc::new(InMemoryAlertStore::new());
        let engine = AlertEngine::new(store.clone(), registry, hub);
        (engine, store)
    }

    fn sample_alert() -> Alert {
        Alert {
            id: "a1".to_string(),
            user_id: "user-1".to_string(),
            name: "BTC breakout".to_string(),
            description: "".to_string(),
            exchange: ExchangeId::Binance,
            market: Market::Futures,
            symbol: crate::symbol::normalize("BTCUSDT").unwrap(),
            target_value: 100.1,
            initial_price: Some(100.0),
            active: true,
            triggered: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn upward_crossing_triggers_exactly_once() {
        let (engine, store) = engine_with_prices(vec![
            Some(99.5),
            Some(99.9),
            Some(100.0),
            Some(100.2),
        ]);
        store.insert(sample_alert());

        for _ in 0..4 {
            engine.sweep_once().await;
        }

        let active = store.load_active().await.unwrap();
        assert!(active.is_empty(), "alert should be consumed after triggering");
    }

    #[tokio::test]
    async fn unavailable_then_recover_triggers_on_the_second_sweep_only() {
        let (engine, store) = engine_with_prices(vec![None, Some(102.0)]);
        store.insert(sample_alert());

        engine.sweep_once().await;
        assert!(!store.load_active().await.unwrap().is_empty(), "no trigger on sweep 1");

        engine.sweep_once().await;
        assert!(store.load_active().await.unwrap().is_empty(), "trigger on sweep 2");
    }

    #[tokio::test]
    async fn invalid_snapshot_at_creation_never_fires() {
        let (engine, store) = engine_with_prices(vec![Some(150.0), Some(200.0)]);
        let mut alert = sample_alert();
        alert.initial_price = Some(101.0); // equals target within epsilon band territory
        alert.target_value = 101.0;
        store.insert(alert);

        engine.sweep_once().await;
        engine.sweep_once().await;

        // invalid snapshot (initial == target) means the alert is never
        // even evaluated for crossing, so it remains active forever.
        assert_eq!(store.load_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_concurrent_sweeps_trigger_exactly_once() {
        let (engine, store) = engine_with_prices(vec![Some(102.0), Some(102.0)]);
        store.insert(sample_alert());

        let e1 = engine.clone();
        let e2 = engine.clone();
        let (r1, r2) = tokio::join!(e1.sweep_once(), e2.sweep_once());
        let _ = (r1, r2);

        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_trigger_updates_previous_observed() {
        let (engine, store) = engine_with_prices(vec![Some(99.0)]);
        store.insert(sample_alert());
        engine.sweep_once().await;
        assert_eq!(engine.previous_observed("a1"), Some(99.0));
    }
}
