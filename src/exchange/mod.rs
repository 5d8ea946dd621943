//! Exchange adapter contract and registry.
//!
//! Each venue implements [`ExchangeAdapter`] behind a trait object, the way
//! the reference pack's multi-exchange traits (e.g. the Kucoin
//! market-making exchange abstraction) expose a closed set of venues behind
//! one interface. A [`ExchangeRegistry`] resolves a name to an adapter; an
//! unrecognized name is a typed [`crate::error::Error::UnknownExchange`],
//! never a silent default.

pub mod binance;
pub mod bitget;
pub mod bybit;
mod common;
pub mod gate;
pub mod mexc;
pub mod okx;
pub mod rest_cache;
pub mod ws_session;

use crate::candle::{Candle, Interval};
use crate::error::Result;
use crate::symbol::CanonicalSymbol;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Market segment a subscription/price lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
}

/// The closed set of supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
    Gate,
    Bitget,
    Mexc,
}

impl ExchangeId {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
            ExchangeId::Gate => "gate",
            ExchangeId::Bitget => "bitget",
            ExchangeId::Mexc => "mexc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "binance" => ExchangeId::Binance,
            "bybit" => ExchangeId::Bybit,
            "okx" => ExchangeId::Okx,
            "gate" | "gateio" | "gate.io" => ExchangeId::Gate,
            "bitget" => ExchangeId::Bitget,
            "mexc" => ExchangeId::Mexc,
            _ => return None,
        })
    }

    pub const ALL: [ExchangeId; 6] = [
        ExchangeId::Binance,
        ExchangeId::Bybit,
        ExchangeId::Okx,
        ExchangeId::Gate,
        ExchangeId::Bitget,
        ExchangeId::Mexc,
    ];
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strictness for `last_prices`: `strict` propagates upstream failure as an
/// error, non-strict returns a best-effort partial map.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastPricesOptions {
    pub strict: bool,
}

/// Callback an adapter invokes for every candle it produces, wired once at
/// construction. The adapter never holds a reference back to whatever
/// consumes this — lifetime ownership stays with the application.
pub type CandleSink =
    Arc<dyn Fn(ExchangeId, CanonicalSymbol, Interval, Market, Candle) + Send + Sync>;

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Idempotent; tolerates separators/suffixes/case; `None` if nothing
    /// alphanumeric survives.
    fn normalize(&self, symbol: &str) -> Option<CanonicalSymbol> {
        crate::symbol::normalize(symbol)
    }

    /// Best-effort or strict last-price snapshot for the given symbols.
    async fn last_prices(
        &self,
        symbols: &[CanonicalSymbol],
        market: Market,
        opts: LastPricesOptions,
    ) -> Result<HashMap<CanonicalSymbol, f64>>;

    /// A single-symbol ticker fetch — cheaper than `last_prices` for one
    /// candidate, used by the resolver's first probe.
    async fn ticker_price(&self, symbol: &CanonicalSymbol, market: Market) -> Result<Option<f64>>;

    /// Cached set of actively-traded USDT-quoted instruments.
    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>>;

    /// Ordered (oldest-first) candle history. Intervals below the venue's
    /// native minimum are synthesized by deterministic resampling.
    async fn klines(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
        limit: usize,
        end_before: Option<i64>,
    ) -> Result<Vec<Candle>>;

    /// Idempotent against the adapter's internal per-stream reference
    /// count; triggers exactly one upstream (un)subscribe as the count
    /// crosses 0↔1.
    async fn subscribe_kline(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
    ) -> Result<()>;

    async fn unsubscribe_kline(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
    ) -> Result<()>;
}

/// Maps exchange names to their adapter instance. Built once at startup.
pub struct ExchangeRegistry {
    adapters: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>>,
}

impl ExchangeRegistry {
    pub fn new(adapters: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn get(&self, id: ExchangeId) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn get_named(&self, name: &str) -> Result<Arc<dyn ExchangeAdapter>> {
        let id = ExchangeId::parse(name)
            .ok_or_else(|| crate::error::Error::UnknownExchange(name.to_string()))?;
        self.get(id)
            .ok_or_else(|| crate::error::Error::UnknownExchange(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExchangeId, &Arc<dyn ExchangeAdapter>)> {
        self.adapters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_id_round_trips_through_parse() {
        for id in ExchangeId::ALL {
            assert_eq!(ExchangeId::parse(id.as_str()), Some(id));
        }
    }

    #[test]
    fn unknown_exchange_name_is_none() {
        assert_eq!(ExchangeId::parse("deribit"), None);
    }

    #[test]
    fn registry_rejects_unknown_name_with_a_typed_error() {
        let registry = ExchangeRegistry::new(HashMap::new());
        let err = registry.get_named("deribit").unwrap_err();
        assert!(matches!(err, crate::error::Error::UnknownExchange(_)));
    }
}
