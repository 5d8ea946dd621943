//! Binance spot + USDT-M futures adapter.
//!
//! REST polling follows `BinancePriceFeed`'s cache-then-fetch shape; the WS
//! reader task is the Binance-specific instantiation of
//! [`super::ws_session::WsSession`], replacing `binance_session.rs`'s
//! hand-rolled single-stream reconnect loop with the venue-agnostic one,
//! generalized to multiplex many kline streams over one connection via
//! Binance's combined-stream endpoint and `SUBSCRIBE`/`UNSUBSCRIBE` frames.

use crate::candle::{Candle, Interval};
use crate::error::{Error, Result, UpstreamStatus};
use crate::exchange::common::{dispatch_minute_candle, RefCounts, StreamKey};
use crate::exchange::rest_cache::{SingleSlotCache, TtlCache};
use crate::exchange::ws_session::{SessionConfig, WsSession};
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
use tracing::{debug, error, warn};

const REST_SPOT: &str = "https://api.binance.com";
const REST_FUTURES: &str = "https://fapi.binance.com";
const WS_SPOT: &str = "wss://stream.binance.com:9443/stream";
const WS_FUTURES: &str = "wss://fstream.binance.com/stream";

fn rest_base(market: Market) -> &'static str {
    match market {
        Market::Spot => REST_SPOT,
        Market::Futures => REST_FUTURES,
    }
}

fn ws_base(market: Market) -> &'static str {
    match market {
        Market::Spot => WS_SPOT,
        Market::Futures => WS_FUTURES,
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct BinanceAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: [SingleSlotCache<HashSet<CanonicalSymbol>>; 2],
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: [mpsc::UnboundedSender<StreamCmd>; 2],
}

impl BinanceAdapter {
    pub fn new(sink: CandleSink) -> Arc<Self> {
        let (spot_tx, spot_rx) = mpsc::unbounded_channel();
        let (fut_tx, fut_rx) = mpsc::unbounded_channel();

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
}

#[derive(Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

fn kline_stream_name(symbol: &CanonicalSymbol, interval: &str) -> String {
    format!("{}@kline_{interval}", symbol.as_str().to_ascii_lowercase())
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
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
                Some(price) => {
                    out.insert(symbol.clone(), price);
                }
                None => missing.push(symbol.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let url = format!("{}/api/v3/ticker/price", rest_base(market));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("binance"))?;
        if !resp.status().is_success() {
            let err = Error::UpstreamUnavailable {
                exchange: "binance".to_string(),
                status: UpstreamStatus::Network,
            };
            if opts.strict {
                return Err(err);
            }
            warn!(market = ?market, "binance last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let tickers: Vec<TickerPrice> = resp
            .json()
            .await
            .map_err(|e| Error::UpstreamDecodeError {
                exchange: "binance".to_string(),
                detail: e.to_string(),
            })?;

        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in tickers {
            if let Some(sym) = crate::symbol::normalize(&t.symbol) {
                if wanted.contains(&sym) {
                    if let Ok(price) = t.price.parse::<f64>() {
                        self.last_price.put((sym.clone(), market), price);
                        out.insert(sym, price);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn ticker_price(&self, symbol: &CanonicalSymbol, market: Market) -> Result<Option<f64>> {
        if let Some(price) = self.last_price.get(&(symbol.clone(), market)) {
            return Ok(Some(price));
        }
        let url = format!("{}/api/v3/ticker/price", rest_base(market));
        let resp = self
            .http
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("binance"))?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::UpstreamUnavailable {
                exchange: "binance".to_string(),
                status: UpstreamStatus::Network,
            });
        }
        let ticker: TickerPrice = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "binance".to_string(),
            detail: e.to_string(),
        })?;
        let price = ticker.price.parse::<f64>().ok();
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if let Some(set) = self.symbols_cache(market).get() {
            return Ok(set);
        }
        let url = format!("{}/api/v3/exchangeInfo", rest_base(market));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::from(e).with_exchange("binance"))?;
        let info: ExchangeInfo = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "binance".to_string(),
            detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.quote_asset == "USDT")
            .filter_map(|s| crate::symbol::normalize(&s.symbol))
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

        let url = format!("{}/api/v3/klines", rest_base(market));
        let mut req = self.http.get(&url).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("interval", fetch_interval.as_str().to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if let Some(end) = end_before {
            req = req.query(&[("endTime", (end * 1000).to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("binance"))?;
        if !resp.status().is_success() {
            return Err(Error::UpstreamUnavailable {
                exchange: "binance".to_string(),
                status: UpstreamStatus::Network,
            });
        }
        let raw: Vec<Vec<serde_json::Value>> =
            resp.json().await.map_err(|e| Error::UpstreamDecodeError {
                exchange: "binance".to_string(),
                detail: e.to_string(),
            })?;

        let mut candles = Vec::with_capacity(raw.len());
        for row in &raw {
            let parse_f64 = |i: usize| row.get(i).and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok());
            let open_time_ms = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
            let (Some(open), Some(high), Some(low), Some(close), Some(volume), Some(turnover)) = (
                parse_f64(1),
                parse_f64(2),
                parse_f64(3),
                parse_f64(4),
                parse_f64(5),
                parse_f64(7),
            ) else {
                return Err(Error::UpstreamDecodeError {
                    exchange: "binance".to_string(),
                    detail: "malformed kline row".to_string(),
                });
            };
            candles.push(Candle {
                time: open_time_ms / 1000,
                open,
                high,
                low,
                close,
                volume,
                turnover: Some(turnover),
                closed: true,
            });
        }

        if interval.is_synthesized() {
            let n = (60 / interval.seconds()) as usize;
            let mut out = Vec::with_capacity(candles.len() * n);
            for c in &candles {
                out.extend(crate::candle::resample(c, n, interval.seconds()));
            }
            out.truncate_to_last(limit);
            Ok(out)
        } else {
            Ok(candles)
        }
    }

    async fn subscribe_kline(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
    ) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey {
            symbol: symbol.clone(),
            market,
            interval: base_interval,
        };
        if self.refs.incref(key) {
            let stream = kline_stream_name(symbol, base_interval.as_str());
            let _ = self.cmd_channel(market).send(StreamCmd::Subscribe(stream));
        }
        Ok(())
    }

    async fn unsubscribe_kline(
        &self,
        symbol: &CanonicalSymbol,
        market: Market,
        interval: Interval,
    ) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey {
            symbol: symbol.clone(),
            market,
            interval: base_interval,
        };
        if self.refs.decref(&key) {
            let stream = kline_stream_name(symbol, base_interval.as_str());
            let _ = self.cmd_channel(market).send(StreamCmd::Unsubscribe(stream));
        }
        Ok(())
    }
}

trait TruncateToLast {
    fn truncate_to_last(&mut self, n: usize);
}

impl<T> TruncateToLast for Vec<T> {
    fn truncate_to_last(&mut self, n: usize) {
        if self.len() > n {
            self.drain(0..self.len() - n);
        }
    }
}

#[derive(Deserialize)]
struct CombinedStreamEnvelope {
    stream: String,
    data: KlineEvent,
}

#[derive(Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    turnover: String,
    #[serde(rename = "x")]
    closed: bool,
}

/// One reader task per market segment. Holds the live stream set so a
/// reconnect replays every active subscription, per the resubscribe-on-
/// reconnect discipline `binance_session.rs` enforces.
async fn run_ws_reader(market: Market, mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("binance", SessionConfig::default());
    let mut streams: HashSet<String> = HashSet::new();

    loop {
        if matches!(session.state(), crate::exchange::ws_session::SessionState::Shutdown) {
            return;
        }

        session.on_connecting();
        let url = format!("{}?streams={}", ws_base(market), if streams.is_empty() { "!placeholder".to_string() } else { streams.iter().cloned().collect::<Vec<_>>().join("/") });
        let connect_result = tokio_tungstenite::connect_async(&url).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(market = ?market, error = %e, "binance ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        session.on_subscribed();
        debug!(market = ?market, streams = streams.len(), "binance ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(s)) => { streams.insert(s); break; }
                        Some(StreamCmd::Unsubscribe(s)) => { streams.remove(&s); break; }
                        None => { session.shutdown(); return; }
                    }
                }
                _ = ping_timer.tick() => {
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        session.begin_reconnect("ping send failed");
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(env) = serde_json::from_str::<CombinedStreamEnvelope>(&text) {
                                if let Some(symbol) = env.stream.split('@').next().and_then(crate::symbol::normalize) {
                                    if let Some(candle) = parse_kline_payload(&env.data.kline) {
                                        dispatch_minute_candle(&sink, ExchangeId::Binance, symbol, market, candle, &[Interval::S1, Interval::S5, Interval::S15]);
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => session.on_pong(),
                        Some(Ok(Message::Close(_))) | None => {
                            session.begin_reconnect("server closed");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(market = ?market, error = %e, "binance ws read error");
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

fn parse_kline_payload(k: &KlinePayload) -> Option<Candle> {
    Some(Candle {
        time: k.open_time_ms / 1000,
        open: k.open.parse().ok()?,
        high: k.high.parse().ok()?,
        low: k.low.parse().ok()?,
        close: k.close.parse().ok()?,
        volume: k.volume.parse().ok()?,
        turnover: k.turnover.parse().ok(),
        closed: k.closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_stream_name_is_lowercase() {
        let symbol = crate::symbol::normalize("BTCUSDT").unwrap();
        assert_eq!(kline_stream_name(&symbol, "1m"), "btcusdt@kline_1m");
    }

    #[test]
    fn truncate_to_last_keeps_tail() {
        let mut v = vec![1, 2, 3, 4, 5];
        v.truncate_to_last(2);
        assert_eq!(v, vec![4, 5]);
    }
}
