//! Price Source Resolver — maps an external `(exchange, market, symbol)`
//! request to a concrete price or a typed unresolved reason.
//!
//! Stateless: every call re-derives candidates from [`crate::symbol`] and
//! probes the adapter directly. Grounded on the cheapest-probe-first shape
//! of `BinancePriceFeed::get_price` (single-symbol lookup before falling
//! back to a full map scan).

use crate::error::Error;
use crate::exchange::{ExchangeAdapter, LastPricesOptions, Market};
use crate::symbol::{candidate_forms, normalize, CanonicalSymbol};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    UpstreamPriceUnavailable,
    SymbolUnresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub price: f64,
    pub resolved_symbol: CanonicalSymbol,
}

pub type ResolveOutcome = std::result::Result<Resolved, UnresolvedReason>;

/// Resolve a user-supplied symbol against one adapter. Never escalates to a
/// different exchange — cross-exchange fallback is the caller's policy
/// (used only by the out-of-scope creation-time bootstrap, never by the
/// alert sweep).
pub async fn resolve(
    adapter: &Arc<dyn ExchangeAdapter>,
    market: Market,
    user_symbol: &str,
) -> ResolveOutcome {
    let Some(canonical) = normalize(user_symbol) else {
        return Err(UnresolvedReason::SymbolUnresolved);
    };
    let candidates = candidate_forms(&canonical);

    // Step 2: cheapest probe first — one direct ticker fetch per candidate.
    for candidate in &candidates {
        let Some(symbol) = normalize(candidate) else {
            continue;
        };
        match adapter.ticker_price(&symbol, market).await {
            Ok(Some(price)) if price.is_finite() && price > 0.0 => {
                return Ok(Resolved {
                    price,
                    resolved_symbol: symbol,
                });
            }
            Ok(_) => continue,
            Err(err) if err.is_upstream_unavailable() => continue,
            Err(_) => continue,
        }
    }

    // Step 3: one batched strict lookup across every candidate.
    let symbols: Vec<CanonicalSymbol> = candidates.iter().filter_map(|c| normalize(c)).collect();
    match adapter
        .last_prices(&symbols, market, LastPricesOptions { strict: true })
        .await
    {
        Ok(prices) => {
            for symbol in &symbols {
                if let Some(&price) = prices.get(symbol) {
                    if price.is_finite() && price > 0.0 {
                        return Ok(Resolved {
                            price,
                            resolved_symbol: symbol.clone(),
                        });
                    }
                }
            }
            Err(UnresolvedReason::SymbolUnresolved)
        }
        Err(Error::UpstreamUnavailable { .. }) => Err(UnresolvedReason::UpstreamPriceUnavailable),
        Err(_) => Err(UnresolvedReason::SymbolUnresolved),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, UpstreamStatus};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct StubAdapter {
        ticker_calls: Mutex<Vec<String>>,
        ticker: Option<f64>,
        batch: HashMap<CanonicalSymbol, f64>,
        fail_unavailable: bool,
    }

    #[async_trait]
    impl ExchangeAdapter for StubAdapter {
        fn id(&self) -> crate::exchange::ExchangeId {
            crate::exchange::ExchangeId::Binance
        }

        async fn last_prices(
            &self,
            _symbols: &[CanonicalSymbol],
            _market: Market,
            _opts: LastPricesOptions,
        ) -> Result<HashMap<CanonicalSymbol, f64>> {
            if self.fail_unavailable {
                return Err(Error::UpstreamUnavailable {
                    exchange: "binance".into(),
                    status: UpstreamStatus::ServiceUnavailable,
                });
            }
            Ok(self.batch.clone())
        }

        async fn ticker_price(
            &self,
            symbol: &CanonicalSymbol,
            _market: Market,
        ) -> Result<Option<f64>> {
            self.ticker_calls.lock().unwrap().push(symbol.as_str().to_string());
            Ok(self.ticker)
        }

        async fn active_symbols(&self, _market: Market) -> Result<HashSet<CanonicalSymbol>> {
            Ok(HashSet::new())
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

    #[tokio::test]
    async fn direct_ticker_hit_stops_before_batch_call() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            ticker_calls: Mutex::new(vec![]),
            ticker: Some(65000.0),
            batch: HashMap::new(),
            fail_unavailable: false,
        });
        let resolved = resolve(&adapter, Market::Spot, "btc/usdt").await.unwrap();
        assert_eq!(resolved.price, 65000.0);
        assert_eq!(resolved.resolved_symbol.as_str(), "BTCUSDT");
    }

    #[tokio::test]
    async fn falls_back_to_batch_lookup_when_ticker_misses() {
        let mut batch = HashMap::new();
        batch.insert(normalize("BTCUSD").unwrap(), 64000.0);
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            ticker_calls: Mutex::new(vec![]),
            ticker: None,
            batch,
            fail_unavailable: false,
        });
        let resolved = resolve(&adapter, Market::Spot, "BTCUSDT").await.unwrap();
        assert_eq!(resolved.price, 64000.0);
    }

    #[tokio::test]
    async fn strict_upstream_failure_is_reported_as_unavailable() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            ticker_calls: Mutex::new(vec![]),
            ticker: None,
            batch: HashMap::new(),
            fail_unavailable: true,
        });
        let outcome = resolve(&adapter, Market::Spot, "BTCUSDT").await;
        assert_eq!(outcome, Err(UnresolvedReason::UpstreamPriceUnavailable));
    }

    #[tokio::test]
    async fn nothing_resolves_is_symbol_unresolved() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(StubAdapter {
            ticker_calls: Mutex::new(vec![]),
            ticker: None,
            batch: HashMap::new(),
            fail_unavailable: false,
        });
        let outcome = resolve(&adapter, Market::Spot, "BTCUSDT").await;
        assert_eq!(outcome, Err(UnresolvedReason::SymbolUnresolved));
    }

    #[tokio::test]
    async fn unparseable_input_never_calls_the_adapter() {
        let adapter = Arc::new(StubAdapter {
            ticker_calls: Mutex::new(vec![]),
            ticker: Some(1.0),
            batch: HashMap::new(),
            fail_unavailable: false,
        });
        let outcome = resolve(&(adapter.clone() as Arc<dyn ExchangeAdapter>), Market::Spot, "---").await;
        assert_eq!(outcome, Err(UnresolvedReason::SymbolUnresolved));
        assert!(adapter.ticker_calls.lock().unwrap().is_empty());
    }
}
