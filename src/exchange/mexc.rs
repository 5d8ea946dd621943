//! MEXC (spot + USDT-M futures) adapter.
//!
//! MEXC's spot REST surface is Binance-shaped (`/api/v3/ticker/price`,
//! `/api/v3/klines`), so this adapter's REST side mirrors
//! [`super::binance::BinanceAdapter`]; the WS protocol differs (MEXC uses a
//! flat `SUBSCRIPTION`/`UNSUBSCRIPTION` method instead of Binance's
//! combined-stream URL).

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

const REST_SPOT: &str = "https://api.mexc.com";
const WS_SPOT: &str = "wss://wbs.mexc.com/ws";

fn mexc_interval(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "Min1",
        Interval::M5 => "Min5",
        Interval::M15 => "Min15",
        Interval::M30 => "Min30",
        Interval::H1 => "Min60",
        Interval::H4 => "Hour4",
        Interval::D1 => "Day1",
        _ => "Min1",
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct MexcAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: SingleSlotCache<HashSet<CanonicalSymbol>>,
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: mpsc::UnboundedSender<StreamCmd>,
}

impl MexcAdapter {
    /// MEXC's futures API uses a separate, unrelated host/auth model from
    /// its spot API; only spot is wired here — futures calls return an
    /// empty/ unresolved result rather than a half-implemented client.
    pub fn new(sink: CandleSink) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"),
            last_price: TtlCache::new(Duration::from_secs(2)),
            active_symbols: SingleSlotCache::new(Duration::from_secs(3600)),
            refs: RefCounts::new(),
            sink,
            stream_cmd: tx,
        });
        tokio::spawn(run_ws_reader(rx, adapter.sink.clone()));
        adapter
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

#[async_trait]
impl ExchangeAdapter for MexcAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Mexc
    }

    async fn last_prices(
        &self,
        symbols: &[CanonicalSymbol],
        market: Market,
        opts: LastPricesOptions,
    ) -> Result<HashMap<CanonicalSymbol, f64>> {
        if matches!(market, Market::Futures) {
            return Ok(HashMap::new());
        }
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
        let resp = self.http.get(format!("{REST_SPOT}/api/v3/ticker/price")).send().await
            .map_err(|e| Error::from(e).with_exchange("mexc"))?;
        if !resp.status().is_success() {
            if opts.strict {
                return Err(Error::UpstreamUnavailable { exchange: "mexc".to_string(), status: UpstreamStatus::Network });
            }
            warn!("mexc last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let tickers: Vec<TickerPrice> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "mexc".to_string(), detail: e.to_string(),
        })?;
        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in tickers {
            if let Some(sym) = crate::symbol::normalize(&t.symbol) {
                if wanted.contains(&sym) {
                    if let Ok(p) = t.price.parse::<f64>() {
                        self.last_price.put((sym.clone(), market), p);
                        out.insert(sym, p);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn ticker_price(&self, symbol: &CanonicalSymbol, market: Market) -> Result<Option<f64>> {
        if matches!(market, Market::Futures) {
            return Ok(None);
        }
        if let Some(p) = self.last_price.get(&(symbol.clone(), market)) {
            return Ok(Some(p));
        }
        let resp = self.http.get(format!("{REST_SPOT}/api/v3/ticker/price"))
            .query(&[("symbol", symbol.as_str())]).send().await
            .map_err(|e| Error::from(e).with_exchange("mexc"))?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        let ticker: TickerPrice = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "mexc".to_string(), detail: e.to_string(),
        })?;
        let price = ticker.price.parse::<f64>().ok();
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if matches!(market, Market::Futures) {
            return Ok(HashSet::new());
        }
        if let Some(set) = self.active_symbols.get() {
            return Ok(set);
        }
        let resp = self.http.get(format!("{REST_SPOT}/api/v3/exchangeInfo")).send().await
            .map_err(|e| Error::from(e).with_exchange("mexc"))?;
        let info: ExchangeInfo = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "mexc".to_string(), detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = info.symbols.into_iter()
            .filter(|s| s.status == "ENABLED" && s.quote_asset == "USDT")
            .filter_map(|s| crate::symbol::normalize(&s.symbol))
            .collect();
        self.active_symbols.put(set.clone());
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
        if matches!(market, Market::Futures) {
            return Err(Error::SymbolUnresolved { exchange: "mexc".to_string(), input: symbol.as_str().to_string() });
        }
        let fetch_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let fetch_limit = if interval.is_synthesized() {
            limit.div_ceil((60 / interval.seconds()) as usize).max(1)
        } else { limit };
        let interval_str = match fetch_interval {
            Interval::M1 => "1m", Interval::M5 => "5m", Interval::M15 => "15m",
            Interval::M30 => "30m", Interval::H1 => "60m", Interval::H4 => "4h", Interval::D1 => "1d",
            _ => "1m",
        };
        let mut req = self.http.get(format!("{REST_SPOT}/api/v3/klines")).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("interval", interval_str.to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if let Some(end) = end_before {
            req = req.query(&[("endTime", (end * 1000).to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("mexc"))?;
        let raw: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "mexc".to_string(), detail: e.to_string(),
        })?;
        let mut candles = Vec::with_capacity(raw.len());
        for row in &raw {
            let parse_f64 = |i: usize| row.get(i).and_then(|v| v.as_str().map(String::from).or_else(|| v.as_f64().map(|f| f.to_string()))).and_then(|s| s.parse::<f64>().ok());
            let open_time_ms = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
            let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                parse_f64(1), parse_f64(2), parse_f64(3), parse_f64(4), parse_f64(5),
            ) else {
                return Err(Error::UpstreamDecodeError { exchange: "mexc".to_string(), detail: "malformed kline row".to_string() });
            };
            candles.push(Candle { time: open_time_ms / 1000, open, high, low, close, volume, turnover: parse_f64(7), closed: true });
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
        if matches!(market, Market::Futures) {
            return Ok(());
        }
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.incref(key) {
            let channel = format!("spot@public.kline.v3.api@{}@{}", symbol.as_str(), mexc_interval(base_interval));
            let _ = self.stream_cmd.send(StreamCmd::Subscribe(channel));
        }
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        if matches!(market, Market::Futures) {
            return Ok(());
        }
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.decref(&key) {
            let channel = format!("spot@public.kline.v3.api@{}@{}", symbol.as_str(), mexc_interval(base_interval));
            let _ = self.stream_cmd.send(StreamCmd::Unsubscribe(channel));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct MexcWsMessage {
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "d")]
    data: Option<MexcKlineData>,
}
#[derive(Deserialize)]
struct MexcKlineData {
    k: MexcKline,
}
#[derive(Deserialize)]
struct MexcKline {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
}

async fn run_ws_reader(mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("mexc", SessionConfig::default());
    let mut channels: HashSet<String> = HashSet::new();
    let mut closed_flags = ClosedFlagSynthesizer::new();

    loop {
        if matches!(session.state(), SessionState::Shutdown) {
            return;
        }
        session.on_connecting();
        let connect_result = tokio_tungstenite::connect_async(WS_SPOT).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(error = %e, "mexc ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        if !channels.is_empty() {
            let msg = serde_json::json!({ "method": "SUBSCRIPTION", "params": channels.iter().collect::<Vec<_>>() });
            if write.send(Message::Text(msg.to_string())).await.is_err() {
                session.begin_reconnect("resubscribe failed");
                continue;
            }
        }
        session.on_subscribed();
        debug!(channels = channels.len(), "mexc ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(c)) => {
                            channels.insert(c.clone());
                            let msg = serde_json::json!({ "method": "SUBSCRIPTION", "params": [c] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        Some(StreamCmd::Unsubscribe(c)) => {
                            channels.remove(&c);
                            let msg = serde_json::json!({ "method": "UNSUBSCRIPTION", "params": [c] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        None => { session.shutdown(); return; }
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = serde_json::json!({ "method": "PING" });
                    if write.send(Message::Text(ping.to_string())).await.is_err() {
                        session.begin_reconnect("ping send failed");
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            session.on_pong();
                            if let Ok(env) = serde_json::from_str::<MexcWsMessage>(&text) {
                                if let (Some(sym_raw), Some(data)) = (env.symbol, env.data) {
                                    if let Some(symbol) = crate::symbol::normalize(&sym_raw) {
                                        let k = data.k;
                                        if let (Ok(open), Ok(high), Ok(low), Ok(close), Ok(volume)) =
                                            (k.o.parse::<f64>(), k.h.parse::<f64>(), k.l.parse::<f64>(), k.c.parse::<f64>(), k.v.parse::<f64>())
                                        {
                                            let candle = Candle { time: k.t / 1000, open, high, low, close, volume, turnover: None, closed: false };
                                            for candle in closed_flags.observe(&symbol, candle) {
                                                dispatch_minute_candle(&sink, ExchangeId::Mexc, symbol.clone(), Market::Spot, candle, &[Interval::S1, Interval::S5, Interval::S15]);
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
                            warn!(error = %e, "mexc ws read error");
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
    fn mexc_interval_maps_common_intervals() {
        assert_eq!(mexc_interval(Interval::M1), "Min1");
        assert_eq!(mexc_interval(Interval::D1), "Day1");
    }
}
