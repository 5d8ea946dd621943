//! Bybit v5 (unified spot + linear-futures) adapter.

use crate::candle::{Candle, Interval};
use crate::error::{Error, Result, UpstreamStatus};
use crate::exchange::common::{dispatch_minute_candle, RefCounts, StreamKey};
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

const REST_BASE: &str = "https://api.bybit.com";
const WS_SPOT: &str = "wss://stream.bybit.com/v5/public/spot";
const WS_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";

fn category(market: Market) -> &'static str {
    match market {
        Market::Spot => "spot",
        Market::Futures => "linear",
    }
}

fn ws_base(market: Market) -> &'static str {
    match market {
        Market::Spot => WS_SPOT,
        Market::Futures => WS_LINEAR,
    }
}

fn bybit_interval(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1",
        Interval::M5 => "5",
        Interval::M15 => "15",
        Interval::M30 => "30",
        Interval::H1 => "60",
        Interval::H4 => "240",
        Interval::D1 => "D",
        _ => "1",
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct BybitAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: [SingleSlotCache<HashSet<CanonicalSymbol>>; 2],
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: [mpsc::UnboundedSender<StreamCmd>; 2],
}

impl BybitAdapter {
    pub fn new(sink: CandleSink) -> Arc<Self> {
        let (spot_tx, spot_rx) = mpsc::unbounded_channel();
        let (lin_tx, lin_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            last_price: TtlCache::new(Duration::from_secs(2)),
            active_symbols: [
                SingleSlotCache::new(Duration::from_secs(3600)),
                SingleSlotCache::new(Duration::from_secs(3600)),
            ],
            refs: RefCounts::new(),
            sink,
            stream_cmd: [spot_tx, lin_tx],
        });
        tokio::spawn(run_ws_reader(Market::Spot, spot_rx, adapter.sink.clone()));
        tokio::spawn(run_ws_reader(Market::Futures, lin_rx, adapter.sink.clone()));
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
}

#[derive(Deserialize)]
struct TickersResponse {
    result: TickersResult,
}
#[derive(Deserialize)]
struct TickersResult {
    list: Vec<TickerEntry>,
}
#[derive(Deserialize)]
struct TickerEntry {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Deserialize)]
struct InstrumentsResponse {
    result: InstrumentsResult,
}
#[derive(Deserialize)]
struct InstrumentsResult {
    list: Vec<InstrumentEntry>,
}
#[derive(Deserialize)]
struct InstrumentEntry {
    symbol: String,
    status: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
}

#[derive(Deserialize)]
struct KlineResponse {
    result: KlineResult,
}
#[derive(Deserialize)]
struct KlineResult {
    list: Vec<[String; 7]>,
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
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
                Some(p) => {
                    out.insert(symbol.clone(), p);
                }
                None => missing.push(symbol.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let url = format!("{REST_BASE}/v5/market/tickers");
        let resp = self
            .http
            .get(&url)
            .query(&[("category", category(market))])
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("bybit"))?;
        if !resp.status().is_success() {
            if opts.strict {
                return Err(Error::UpstreamUnavailable {
                    exchange: "bybit".to_string(),
                    status: UpstreamStatus::Network,
                });
            }
            warn!(market = ?market, "bybit last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let body: TickersResponse = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bybit".to_string(),
            detail: e.to_string(),
        })?;
        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in body.result.list {
            if let Some(sym) = crate::symbol::normalize(&t.symbol) {
                if wanted.contains(&sym) {
                    if let Ok(p) = t.last_price.parse::<f64>() {
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
        let url = format!("{REST_BASE}/v5/market/tickers");
        let resp = self
            .http
            .get(&url)
            .query(&[("category", category(market)), ("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("bybit"))?;
        let body: TickersResponse = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bybit".to_string(),
            detail: e.to_string(),
        })?;
        let price = body
            .result
            .list
            .into_iter()
            .next()
            .and_then(|t| t.last_price.parse::<f64>().ok());
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if let Some(set) = self.symbols_cache(market).get() {
            return Ok(set);
        }
        let url = format!("{REST_BASE}/v5/market/instruments-info");
        let resp = self
            .http
            .get(&url)
            .query(&[("category", category(market))])
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("bybit"))?;
        let body: InstrumentsResponse = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bybit".to_string(),
            detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = body
            .result
            .list
            .into_iter()
            .filter(|i| i.status == "Trading" && i.quote_coin == "USDT")
            .filter_map(|i| crate::symbol::normalize(&i.symbol))
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
        } else {
            limit
        };
        let url = format!("{REST_BASE}/v5/market/kline");
        let mut req = self.http.get(&url).query(&[
            ("category", category(market).to_string()),
            ("symbol", symbol.as_str().to_string()),
            ("interval", bybit_interval(fetch_interval).to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if let Some(end) = end_before {
            req = req.query(&[("end", (end * 1000).to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("bybit"))?;
        let body: KlineResponse = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bybit".to_string(),
            detail: e.to_string(),
        })?;
        // Bybit returns newest-first; reverse to oldest-first.
        let mut candles = Vec::with_capacity(body.result.list.len());
        for row in body.result.list.iter().rev() {
            let parse = |i: usize| row[i].parse::<f64>().ok();
            let (Some(open_ms), Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                row[0].parse::<i64>().ok(),
                parse(1),
                parse(2),
                parse(3),
                parse(4),
                parse(5),
            ) else {
                continue;
            };
            candles.push(Candle {
                time: open_ms / 1000,
                open,
                high,
                low,
                close,
                volume,
                turnover: row[6].parse::<f64>().ok(),
                closed: true,
            });
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
            let topic = format!("kline.{}.{}", bybit_interval(base_interval), symbol.as_str());
            let _ = self.cmd_channel(market).send(StreamCmd::Subscribe(topic));
        }
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.decref(&key) {
            let topic = format!("kline.{}.{}", bybit_interval(base_interval), symbol.as_str());
            let _ = self.cmd_channel(market).send(StreamCmd::Unsubscribe(topic));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct WsEnvelope {
    topic: Option<String>,
    data: Option<Vec<WsKline>>,
}
#[derive(Deserialize)]
struct WsKline {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    turnover: String,
    confirm: bool,
}

async fn run_ws_reader(market: Market, mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("bybit", SessionConfig::default());
    let mut topics: HashSet<String> = HashSet::new();

    loop {
        if matches!(session.state(), SessionState::Shutdown) {
            return;
        }
        session.on_connecting();
        let connect_result = tokio_tungstenite::connect_async(ws_base(market)).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(market = ?market, error = %e, "bybit ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        if !topics.is_empty() {
            let sub = serde_json::json!({ "op": "subscribe", "args": topics.iter().collect::<Vec<_>>() });
            if write.send(Message::Text(sub.to_string())).await.is_err() {
                session.begin_reconnect("resubscribe failed");
                continue;
            }
        }
        session.on_subscribed();
        debug!(market = ?market, topics = topics.len(), "bybit ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(t)) => {
                            topics.insert(t.clone());
                            let msg = serde_json::json!({ "op": "subscribe", "args": [t] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        Some(StreamCmd::Unsubscribe(t)) => {
                            topics.remove(&t);
                            let msg = serde_json::json!({ "op": "unsubscribe", "args": [t] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        None => { session.shutdown(); return; }
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = serde_json::json!({ "op": "ping" });
                    if write.send(Message::Text(ping.to_string())).await.is_err() {
                        session.begin_reconnect("ping send failed");
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(env) = serde_json::from_str::<WsEnvelope>(&text) {
                                if let (Some(topic), Some(klines)) = (env.topic, env.data) {
                                    if let Some(sym_part) = topic.rsplit('.').next() {
                                        if let Some(symbol) = crate::symbol::normalize(sym_part) {
                                            for k in klines {
                                                let candle = Candle {
                                                    time: k.start / 1000,
                                                    open: k.open.parse().unwrap_or(0.0),
                                                    high: k.high.parse().unwrap_or(0.0),
                                                    low: k.low.parse().unwrap_or(0.0),
                                                    close: k.close.parse().unwrap_or(0.0),
                                                    volume: k.volume.parse().unwrap_or(0.0),
                                                    turnover: k.turnover.parse().ok(),
                                                    closed: k.confirm,
                                                };
                                                dispatch_minute_candle(&sink, ExchangeId::Bybit, symbol.clone(), market, candle, &[Interval::S1, Interval::S5, Interval::S15]);
                                            }
                                        }
                                    }
                                }
                            }
                            session.on_pong();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            session.begin_reconnect("server closed");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(market = ?market, error = %e, "bybit ws read error");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bybit_interval_maps_common_intervals() {
        assert_eq!(bybit_interval(Interval::M1), "1");
        assert_eq!(bybit_interval(Interval::H1), "60");
        assert_eq!(bybit_interval(Interval::D1), "D");
    }

    #[test]
    fn category_differs_by_market() {
        assert_eq!(category(Market::Spot), "spot");
        assert_eq!(category(Market::Futures), "linear");
    }
}
