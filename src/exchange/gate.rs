//! Gate.io v4 (spot + USDT-M futures) adapter.
//!
//! Gate's REST/WS surface addresses symbols with an underscore
//! (`BTC_USDT`) rather than bare concatenation, so this adapter reattaches
//! it the same way the OKX adapter reattaches its dash.

use crate::candle::{Candle, Interval};
use crate::error::{Error, Result, UpstreamStatus};
use crate::exchange::common::{dispatch_minute_candle, ClosedFlagSynthesizer, RefCounts, StreamKey};
use crate::exchange::rest_cache::{SingleSlotCache, TtlCache};
use crate::exchange::ws_session::{SessionConfig, SessionState, WsSession};
use crate::exchange::{CandleSink, ExchangeAdapter, ExchangeId, LastPricesOptions, Market};
use crate::symbol::CanonicalSymbol;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const REST_SPOT: &str = "https://api.gateio.ws/api/v4";
const WS_SPOT: &str = "wss://api.gateio.ws/ws/v4/";
const WS_FUTURES: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";

fn underscored(symbol: &CanonicalSymbol) -> String {
    let base = symbol.without_quote();
    let quote = &symbol.as_str()[base.len()..];
    format!("{base}_{quote}")
}

fn gate_interval(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1m",
        Interval::M5 => "5m",
        Interval::M15 => "15m",
        Interval::M30 => "30m",
        Interval::H1 => "1h",
        Interval::H4 => "4h",
        Interval::D1 => "1d",
        _ => "1m",
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct GateAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: [SingleSlotCache<HashSet<CanonicalSymbol>>; 2],
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: [mpsc::UnboundedSender<StreamCmd>; 2],
}

impl GateAdapter {
    pub fn new(sink: CandleSink) -> Arc<Self> {
        let (spot_tx, spot_rx) = mpsc::unbounded_channel();
        let (fut_tx, fut_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"),
            last_price: TtlCache::new(Duration::from_secs(2)),
            active_symbols: [
                SingleSlotCache::new(Duration::from_secs(3600)),
                SingleSlotCache::new(Duration::from_secs(3600)),
            ],
            refs: RefCounts::new(),
            sink,
            stream_cmd: [spot_tx, fut_tx],
        });
        tokio::spawn(run_ws_reader(Market::Spot, spot_rx, adapter.sink.clone()));
        tokio::spawn(run_ws_reader(Market::Futures, fut_rx, adapter.sink.clone()));
        adapter
    }

    fn cmd_channel(&self, market: Market) -> &mpsc::UnboundedSender<StreamCmd> {
        match market {
            Market::Spot => &self.stream_cmd[0],
            Market::Futures => &self.stream_cmd[1],
        }
    }

    fn symbols_cache(&self, market: Market) -> &SingleSlotCache<HashSet<CanonicalSymbol>> {
        match market {
            Market::Spot => &self.active_symbols[0],
            Market::Futures => &self.active_symbols[1],
        }
    }

    fn ws_base(market: Market) -> &'static str {
        match market {
            Market::Spot => WS_SPOT,
            Market::Futures => WS_FUTURES,
        }
    }
}

#[derive(Deserialize)]
struct GateTicker {
    currency_pair: String,
    last: String,
}
#[derive(Deserialize)]
struct GateCurrencyPair {
    id: String,
    trade_status: String,
}

#[async_trait]
impl ExchangeAdapter for GateAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Gate
    }

    async fn last_prices(
        &self,
        symbols: &[CanonicalSymbol],
        market: Market,
        opts: LastPricesOptions,
    ) -> Result<HashMap<CanonicalSymbol, f64>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        for symbol in symbols {
            match self.last_price.get(&(symbol.clone(), market)) {
                Some(p) => { out.insert(symbol.clone(), p); }
                None => missing.push(symbol.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let path = match market { Market::Spot => "/spot/tickers", Market::Futures => "/futures/usdt/tickers" };
        let resp = self.http.get(format!("{REST_SPOT}{path}")).send().await
            .map_err(|e| Error::from(e).with_exchange("gate"))?;
        if !resp.status().is_success() {
            if opts.strict {
                return Err(Error::UpstreamUnavailable { exchange: "gate".to_string(), status: UpstreamStatus::Network });
            }
            warn!(market = ?market, "gate last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let tickers: Vec<GateTicker> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "gate".to_string(), detail: e.to_string(),
        })?;
        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in tickers {
            if let Some(sym) = crate::symbol::normalize(&t.currency_pair) {
                if wanted.contains(&sym) {
                    if let Ok(p) = t.last.parse::<f64>() {
                        self.last_price.put((sym.clone(), market), p);
                        out.insert(sym, p);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn ticker_price(&self, symbol: &CanonicalSymbol, market: Market) -> Result<Option<f64>> {
        if let Some(p) = self.last_price.get(&(symbol.clone(), market)) {
            return Ok(Some(p));
        }
        let path = match market { Market::Spot => "/spot/tickers", Market::Futures => "/futures/usdt/tickers" };
        let resp = self.http.get(format!("{REST_SPOT}{path}"))
            .query(&[("currency_pair", underscored(symbol))]).send().await
            .map_err(|e| Error::from(e).with_exchange("gate"))?;
        let tickers: Vec<GateTicker> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "gate".to_string(), detail: e.to_string(),
        })?;
        let price = tickers.into_iter().next().and_then(|t| t.last.parse::<f64>().ok());
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if let Some(set) = self.symbols_cache(market).get() {
            return Ok(set);
        }
        if matches!(market, Market::Futures) {
            // Gate's futures contract listing uses a different schema; reuse
            // the spot set as the tradable-symbol universe since every USDT
            // perpetual mirrors a spot pair.
            let spot = self.active_symbols(Market::Spot).await?;
            self.symbols_cache(market).put(spot.clone());
            return Ok(spot);
        }
        let resp = self.http.get(format!("{REST_SPOT}/spot/currency_pairs")).send().await
            .map_err(|e| Error::from(e).with_exchange("gate"))?;
        let pairs: Vec<GateCurrencyPair> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "gate".to_string(), detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = pairs.into_iter()
            .filter(|p| p.trade_status == "tradable" && p.id.ends_with("_USDT"))
            .filter_map(|p| crate::symbol::normalize(&p.id))
            .collect();
        self.symbols_cache(market).put(set.clone());
        Ok(set)
    }

    async fn klines(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
        limit: usize,
        end_before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let fetch_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let fetch_limit = if interval.is_synthesized() {
            limit.div_ceil((60 / interval.seconds()) as usize).max(1)
        } else { limit };
        let path = match market { Market::Spot => "/spot/candlesticks", Market::Futures => "/futures/usdt/candlesticks" };
        let mut req = self.http.get(format!("{REST_SPOT}{path}")).query(&[
            ("currency_pair", underscored(symbol)),
            ("interval", gate_interval(fetch_interval).to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if let Some(end) = end_before {
            req = req.query(&[("to", end.to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("gate"))?;
        let rows: Vec<[String; 6]> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "gate".to_string(), detail: e.to_string(),
        })?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let parse = |i: usize| row[i].parse::<f64>().ok();
            let (Some(time), Some(turnover), Some(close), Some(high), Some(low), Some(open)) = (
                row[0].parse::<i64>().ok(), parse(1), parse(2), parse(3), parse(4), parse(5),
            ) else { continue };
            candles.push(Candle { time, open, high, low, close, volume: turnover / open.max(1e-9), turnover: Some(turnover), closed: true });
        }
        if interval.is_synthesized() {
            let n = (60 / interval.seconds()) as usize;
            let mut out = Vec::with_capacity(candles.len() * n);
            for c in &candles {
                out.extend(crate::candle::resample(c, n, interval.seconds()));
            }
            if out.len() > limit {
                out.drain(0..out.len() - limit);
            }
            Ok(out)
        } else {
            Ok(candles)
        }
    }

    async fn subscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.incref(key) {
            let _ = self.cmd_channel(market).send(StreamCmd::Subscribe(underscored(symbol)));
        }
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.decref(&key) {
            let _ = self.cmd_channel(market).send(StreamCmd::Unsubscribe(underscored(symbol)));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct GateWsMessage {
    channel: String,
    event: Option<String>,
    result: Option<serde_json::Value>,
}

async fn run_ws_reader(market: Market, mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("gate", SessionConfig::default());
    let mut pairs: HashSet<String> = HashSet::new();
    let channel = match market { Market::Spot => "spot.candlesticks", Market::Futures => "futures.candlesticks" };
    let mut closed_flags = ClosedFlagSynthesizer::new();

    loop {
        if matches!(session.state(), SessionState::Shutdown) {
            return;
        }
        session.on_connecting();
        let connect_result = tokio_tungstenite::connect_async(GateAdapter::ws_base(market)).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(market = ?market, error = %e, "gate ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        for pair in &pairs {
            let msg = serde_json::json!({ "time": 0, "channel": channel, "event": "subscribe", "payload": ["1m", pair] });
            if write.send(Message::Text(msg.to_string())).await.is_err() {
                session.begin_reconnect("resubscribe failed");
                continue;
            }
        }
        session.on_subscribed();
        debug!(market = ?market, pairs = pairs.len(), "gate ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(pair)) => {
                            pairs.insert(pair.clone());
                            let msg = serde_json::json!({ "time": 0, "channel": channel, "event": "subscribe", "payload": ["1m", pair] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        Some(StreamCmd::Unsubscribe(pair)) => {
                            pairs.remove(&pair);
                            let msg = serde_json::json!({ "time": 0, "channel": channel, "event": "unsubscribe", "payload": ["1m", pair] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        None => { session.shutdown(); return; }
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = serde_json::json!({ "time": 0, "channel": "spot.ping" });
                    if write.send(Message::Text(ping.to_string())).await.is_err() {
                        session.begin_reconnect("ping send failed");
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            session.on_pong();
                            if let Ok(env) = serde_json::from_str::<GateWsMessage>(&text) {
                                if env.event.as_deref() == Some("update") {
                                    if let Some(result) = env.result {
                                        if let Some(candle) = parse_gate_update(&result) {
                                            if let Some(symbol) = result.get("n")
                                                .and_then(|v| v.as_str())
                                                .and_then(|n| n.split('_').nth(1).map(|_| n))
                                                .and_then(crate::symbol::normalize)
                                            {
                                                for candle in closed_flags.observe(&symbol, candle) {
                                                    dispatch_minute_candle(&sink, ExchangeId::Gate, symbol.clone(), market, candle, &[Interval::S1, Interval::S5, Interval::S15]);
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            session.begin_reconnect("server closed");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(market = ?market, error = %e, "gate ws read error");
                            session.begin_reconnect("read error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            if session.subscribe_watchdog_expired() || session.pong_timeout_expired() {
                let backoff = session.begin_reconnect("watchdog expired");
                tokio::time::sleep(backoff).await;
                break;
            }
        }
    }
}

fn parse_gate_update(v: &serde_json::Value) -> Option<Candle> {
    let get = |k: &str| v.get(k).and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok());
    let time = v.get("t").and_then(|x| x.as_str()).and_then(|s| s.parse::<i64>().ok())?;
    Some(Candle {
        time,
        open: get("o")?,
        high: get("h")?,
        low: get("l")?,
        close: get("c")?,
        volume: get("v").unwrap_or(0.0),
        turnover: None,
        closed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscored_reattaches_separator() {
        let symbol = crate::symbol::normalize("BTCUSDT").unwrap();
        assert_eq!(underscored(&symbol), "BTC_USDT");
    }

    #[test]
    fn gate_interval_maps_common_intervals() {
        assert_eq!(gate_interval(Interval::M1), "1m");
        assert_eq!(gate_interval(Interval::D1), "1d");
    }
}
