//! Shared plumbing every per-venue adapter wires the same way: a
//! ref-counted subscription table so repeated `subscribe_kline` calls for
//! the same stream collapse into one upstream subscribe, and a helper for
//! dispatching synthesized sub-minute candles through the sink.

use crate::candle::{Candle, Interval};
use crate::exchange::{CandleSink, ExchangeId, Market};
use crate::symbol::CanonicalSymbol;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub symbol: CanonicalSymbol,
    pub market: Market,
    pub interval: Interval,
}

/// Tracks how many local subscribers want a given upstream stream. Returns
/// whether this call crossed the 0->1 (should subscribe upstream) or 1->0
/// (should unsubscribe upstream) boundary.
#[derive(Default)]
pub struct RefCounts {
    counts: Mutex<HashMap<StreamKey, usize>>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incref(&self, key: StreamKey) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn decref(&self, key: &StreamKey) -> bool {
        let mut counts = self.counts.lock();
        match counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn active_keys(&self) -> Vec<StreamKey> {
        self.counts.lock().keys().cloned().collect()
    }
}

/// Synthesizes the bar-closed flag for venues whose kline stream carries no
/// native per-update boolean: tracks the last update seen per symbol and, once
/// a newer open time arrives, replays the previous bar one more time with
/// `closed=true` before the new bar's first (`closed=false`) update. Emits
/// `closed=true` at most once per `(symbol, time)`, per §4.1/§9.
#[derive(Default)]
pub struct ClosedFlagSynthesizer {
    pending: HashMap<CanonicalSymbol, Candle>,
}

impl ClosedFlagSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a freshly decoded candle whose `closed` field is unknown; returns
    /// the candles to actually dispatch, in order.
    pub fn observe(&mut self, symbol: &CanonicalSymbol, mut candle: Candle) -> Vec<Candle> {
        let mut out = Vec::with_capacity(2);
        if let Some(prev) = self.pending.get(symbol) {
            if candle.time > prev.time {
                let mut closed_prev = *prev;
                closed_prev.closed = true;
                out.push(closed_prev);
            }
        }
        candle.closed = false;
        self.pending.insert(symbol.clone(), candle);
        out.push(candle);
        out
    }
}

/// Given a closed 1m candle from the wire, emit it (and any synthesized
/// sub-minute bars the active subscription set asks for) through the sink.
pub fn dispatch_minute_candle(
    sink: &CandleSink,
    exchange: ExchangeId,
    symbol: CanonicalSymbol,
    market: Market,
    candle: Candle,
    synthesized_intervals: &[Interval],
) {
    sink(exchange, symbol.clone(), Interval::M1, market, candle);

    for &interval in synthesized_intervals {
        if !interval.is_synthesized() {
            continue;
        }
        let n = 60 / interval.seconds();
        if n < 1 {
            continue;
        }
        for sub in crate::candle::resample(&candle, n as usize, interval.seconds()) {
            sink(exchange, symbol.clone(), interval, market, sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sym: &str) -> StreamKey {
        StreamKey {
            symbol: crate::symbol::normalize(sym).unwrap(),
            market: Market::Spot,
            interval: Interval::M1,
        }
    }

    #[test]
    fn incref_reports_transition_on_first_subscriber_only() {
        let refs = RefCounts::new();
        assert!(refs.incref(key("BTCUSDT")));
        assert!(!refs.incref(key("BTCUSDT")));
    }

    #[test]
    fn decref_reports_transition_when_last_subscriber_leaves() {
        let refs = RefCounts::new();
        let k = key("BTCUSDT");
        refs.incref(k.clone());
        refs.incref(k.clone());
        assert!(!refs.decref(&k));
        assert!(refs.decref(&k));
        assert!(!refs.decref(&k));
    }

    #[test]
    fn active_keys_reflects_current_subscriptions() {
        let refs = RefCounts::new();
        refs.incref(key("BTCUSDT"));
        refs.incref(key("ETHUSDT"));
        assert_eq!(refs.active_keys().len(), 2);
    }

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            turnover: None,
            closed: false,
        }
    }

    #[test]
    fn intra_bar_updates_stay_open_until_the_bar_advances() {
        let mut synth = ClosedFlagSynthesizer::new();
        let symbol = crate::symbol::normalize("BTCUSDT").unwrap();

        let first = synth.observe(&symbol, candle(0, 100.0));
        assert_eq!(first.len(), 1);
        assert!(!first[0].closed);

        let same_bar = synth.observe(&symbol, candle(0, 101.0));
        assert_eq!(same_bar.len(), 1);
        assert!(!same_bar[0].closed);
        assert_eq!(same_bar[0].close, 101.0);
    }

    #[test]
    fn bar_advance_closes_the_previous_bar_exactly_once() {
        let mut synth = ClosedFlagSynthesizer::new();
        let symbol = crate::symbol::normalize("BTCUSDT").unwrap();

        synth.observe(&symbol, candle(0, 100.0));
        synth.observe(&symbol, candle(0, 101.0));
        let on_advance = synth.observe(&symbol, candle(60, 102.0));

        assert_eq!(on_advance.len(), 2);
        assert_eq!(on_advance[0].time, 0);
        assert!(on_advance[0].closed);
        assert_eq!(on_advance[0].close, 101.0);
        assert_eq!(on_advance[1].time, 60);
        assert!(!on_advance[1].closed);
    }

    #[test]
    fn distinct_symbols_are_tracked_independently() {
        let mut synth = ClosedFlagSynthesizer::new();
        let btc = crate::symbol::normalize("BTCUSDT").unwrap();
        let eth = crate::symbol::normalize("ETHUSDT").unwrap();

        synth.observe(&btc, candle(0, 100.0));
        let eth_first = synth.observe(&eth, candle(0, 2000.0));
        assert_eq!(eth_first.len(), 1);
        assert!(!eth_first[0].closed);
    }
}
