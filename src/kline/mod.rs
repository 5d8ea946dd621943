//! Kline Subscription Manager — multiplexes N client subscriptions onto M
//! upstream adapter streams and routes every upstream candle to the precise
//! set of currently-interested clients.
//!
//! Grounded on the backend's `parking_lot`-guarded short-critical-section
//! idiom (`AppState::risk_manager: Arc<ParkingRwLock<RiskManager>>`): both
//! inverted indices live behind one `parking_lot::Mutex`, and broadcasting a
//! candle takes a snapshot of the subscriber set under the lock, then sends
//! outside it.

use crate::candle::{Candle, Interval};
use crate::error::{Error, Result};
use crate::exchange::{ExchangeId, ExchangeRegistry, Market};
use crate::push::events::{KlineUpdatePayload, ServerEvent};
use crate::push::hub::{ClientId, Hub};
use crate::symbol::CanonicalSymbol;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// `(exchange, canonicalSymbol, interval, market)` — globally unique,
/// identity is structural equality of the tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub exchange: ExchangeId,
    pub symbol: CanonicalSymbol,
    pub interval: Interval,
    pub market: Market,
}

#[derive(Default)]
struct ManagerState {
    client_keys: HashMap<ClientId, HashSet<SubscriptionKey>>,
    key_clients: HashMap<SubscriptionKey, HashSet<ClientId>>,
}

pub struct KlineManager {
    state: Mutex<ManagerState>,
    registry: Arc<ExchangeRegistry>,
    hub: Arc<Hub>,
}

impl KlineManager {
    pub fn new(registry: Arc<ExchangeRegistry>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState::default()),
            registry,
            hub,
        })
    }

    /// Add to both indices. If the subscriber set for `key` transitioned
    /// 0->1, issue exactly one upstream `subscribe_kline`. On upstream
    /// failure, rolls the index entries back and surfaces the error.
    pub async fn subscribe(&self, client_id: ClientId, key: SubscriptionKey) -> Result<()> {
        let became_first = {
            let mut state = self.state.lock();
            state
                .client_keys
                .entry(client_id.clone())
                .or_default()
                .insert(key.clone());
            let subs = state.key_clients.entry(key.clone()).or_default();
            let was_empty = subs.is_empty();
            subs.insert(client_id.clone());
            was_empty
        };

        if !became_first {
            return Ok(());
        }

        let adapter = self
            .registry
            .get(key.exchange)
            .ok_or_else(|| Error::UnknownExchange(key.exchange.to_string()))?;

        if let Err(err) = adapter
            .subscribe_kline(&key.symbol, key.market, key.interval)
            .await
        {
            self.rollback(&client_id, &key);
            return Err(err);
        }

        Ok(())
    }

    fn rollback(&self, client_id: &ClientId, key: &SubscriptionKey) {
        let mut state = self.state.lock();
        if let Some(keys) = state.client_keys.get_mut(client_id) {
            keys.remove(key);
            if keys.is_empty() {
                state.client_keys.remove(client_id);
            }
        }
        if let Some(clients) = state.key_clients.get_mut(key) {
            clients.remove(client_id);
            if clients.is_empty() {
                state.key_clients.remove(key);
            }
        }
    }

    /// Remove from both indices. Missing entries are no-ops. If the
    /// subscriber set transitioned 1->0, issue exactly one upstream
    /// `unsubscribe_kline`.
    pub async fn unsubscribe(&self, client_id: &ClientId, key: &SubscriptionKey) {
        let became_empty = {
            let mut state = self.state.lock();
            if let Some(keys) = state.client_keys.get_mut(client_id) {
                keys.remove(key);
                if keys.is_empty() {
                    state.client_keys.remove(client_id);
                }
            }
            match state.key_clients.get_mut(key) {
                Some(clients) => {
                    clients.remove(client_id);
                    let now_empty = clients.is_empty();
                    if now_empty {
                        state.key_clients.remove(key);
                    }
                    now_empty
                }
                None => false,
            }
        };

        if became_empty {
            if let Some(adapter) = self.registry.get(key.exchange) {
                if let Err(err) = adapter
                    .unsubscribe_kline(&key.symbol, key.market, key.interval)
                    .await
                {
                    warn!(exchange = %key.exchange, symbol = %key.symbol, ?err, "upstream unsubscribe failed");
                }
            }
        }
    }

    /// Iterate and unsubscribe every key the disconnecting client held.
    pub async fn on_client_disconnect(&self, client_id: &ClientId) {
        let keys = {
            let mut state = self.state.lock();
            state.client_keys.remove(client_id).unwrap_or_default()
        };
        for key in keys {
            self.unsubscribe(client_id, &key).await;
        }
    }

    /// Adapter callback: look up `key`'s subscribers and push a
    /// `kline-update` to each through the push fabric. An empty subscriber
    /// set (racing unsubscribe) silently drops the candle.
    pub fn on_candle(
        &self,
        exchange: ExchangeId,
        symbol: CanonicalSymbol,
        interval: Interval,
        market: Market,
        candle: Candle,
    ) {
        let key = SubscriptionKey {
            exchange,
            symbol: symbol.clone(),
            interval,
            market,
        };
        let subscribers = {
            let state = self.state.lock();
            state.key_clients.get(&key).cloned()
        };
        let Some(subscribers) = subscribers else {
            return;
        };
        if subscribers.is_empty() {
            return;
        }

        let event = ServerEvent::KlineUpdate {
            payload: KlineUpdatePayload {
                exchange,
                symbol,
                interval,
                exchange_type: market,
                kline: candle,
            },
        };
        for client_id in subscribers {
            self.hub.send_to_client(&client_id, event.clone());
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.state
            .lock()
            .key_clients
            .get(key)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn client_key_count(&self, client_id: &ClientId) -> usize {
        self.state
            .lock()
            .client_keys
            .get(client_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result as CrateResult, UpstreamStatus};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingAdapter {
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        fail_next_subscribe: StdMutex<bool>,
    }

    #[async_trait]
    impl crate::exchange::ExchangeAdapter for CountingAdapter {
        fn id(&self) -> ExchangeId {
            ExchangeId::Bybit
        }

        async fn last_prices(
            &self,
            _symbols: &[CanonicalSymbol],
            _market: Market,
            _opts: crate::exchange::LastPricesOptions,
        ) -> CrateResult<StdHashMap<CanonicalSymbol, f64>> {
            Ok(StdHashMap::new())
        }

        async fn ticker_price(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
        ) -> CrateResult<Option<f64>> {
            Ok(None)
        }

        async fn active_symbols(&self, _market: Market) -> CrateResult<HashSet<CanonicalSymbol>> {
            Ok(HashSet::new())
        }

        async fn klines(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: Interval,
            _limit: usize,
            _end_before: Option<i64>,
        ) -> CrateResult<Vec<Candle>> {
            Ok(vec![])
        }

        async fn subscribe_kline(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: Interval,
        ) -> CrateResult<()> {
            if *self.fail_next_subscribe.lock().unwrap() {
                return Err(Error::UpstreamUnavailable {
                    exchange: "bybit".into(),
                    status: UpstreamStatus::ServiceUnavailable,
                });
            }
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe_kline(
            &self,
            _symbol: &CanonicalSymbol,
            _market: Market,
            _interval: Interval,
        ) -> CrateResult<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_key() -> SubscriptionKey {
        SubscriptionKey {
            exchange: ExchangeId::Bybit,
            symbol: crate::symbol::normalize("BTCUSDT").unwrap(),
            interval: Interval::M1,
            market: Market::Futures,
        }
    }

    fn registry_with(adapter: Arc<CountingAdapter>) -> Arc<ExchangeRegistry> {
        let mut map: HashMap<ExchangeId, Arc<dyn crate::exchange::ExchangeAdapter>> = HashMap::new();
        map.insert(ExchangeId::Bybit, adapter);
        Arc::new(ExchangeRegistry::new(map))
    }

    #[tokio::test]
    async fn multiplexing_one_upstream_subscribe_for_three_clients() {
        let adapter = Arc::new(CountingAdapter {
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            fail_next_subscribe: StdMutex::new(false),
        });
        let registry = registry_with(adapter.clone());
        let hub = Arc::new(Hub::new());
        let manager = KlineManager::new(registry, hub);
        let key = sample_key();

        manager.subscribe("c1".to_string(), key.clone()).await.unwrap();
        manager.subscribe("c2".to_string(), key.clone()).await.unwrap();
        manager.subscribe("c3".to_string(), key.clone()).await.unwrap();
        assert_eq!(adapter.subscribes.load(Ordering::SeqCst), 1);

        manager.unsubscribe(&"c1".to_string(), &key).await;
        assert_eq!(adapter.unsubscribes.load(Ordering::SeqCst), 0);
        assert_eq!(manager.subscriber_count(&key), 2);

        manager.on_client_disconnect(&"c2".to_string()).await;
        manager.on_client_disconnect(&"c3".to_string()).await;
        assert_eq!(adapter.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_resubscribe_does_not_leak_a_stream() {
        let adapter = Arc::new(CountingAdapter {
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            fail_next_subscribe: StdMutex::new(false),
        });
        let registry = registry_with(adapter.clone());
        let hub = Arc::new(Hub::new());
        let manager = KlineManager::new(registry, hub);
        let key = sample_key();

        manager.subscribe("c1".to_string(), key.clone()).await.unwrap();
        manager.unsubscribe(&"c1".to_string(), &key).await;
        manager.subscribe("c1".to_string(), key.clone()).await.unwrap();

        assert_eq!(adapter.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscriber_count(&key), 1);
    }

    #[tokio::test]
    async fn upstream_subscribe_failure_rolls_back_the_indices() {
        let adapter = Arc::new(CountingAdapter {
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            fail_next_subscribe: StdMutex::new(true),
        });
        let registry = registry_with(adapter.clone());
        let hub = Arc::new(Hub::new());
        let manager = KlineManager::new(registry, hub);
        let key = sample_key();

        let err = manager.subscribe("c1".to_string(), key.clone()).await;
        assert!(err.is_err());
        assert_eq!(manager.subscriber_count(&key), 0);
        assert_eq!(manager.client_key_count(&"c1".to_string()), 0);
    }

    #[tokio::test]
    async fn on_candle_with_no_subscribers_is_dropped_silently() {
        let adapter = Arc::new(CountingAdapter {
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            fail_next_subscribe: StdMutex::new(false),
        });
        let registry = registry_with(adapter);
        let hub = Arc::new(Hub::new());
        let manager = KlineManager::new(registry, hub);
        let key = sample_key();

        manager.on_candle(
            key.exchange,
            key.symbol.clone(),
            key.interval,
            key.market,
            Candle {
                time: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
                turnover: None,
                closed: true,
            },
        );
    }
}
