//! Bitget v2 (spot + USDT-M futures) adapter.

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

const REST_BASE: &str = "https://api.bitget.com";
const WS_PUBLIC: &str = "wss://ws.bitget.com/v2/ws/public";

fn inst_type(market: Market) -> &'static str {
    match market {
        Market::Spot => "SPOT",
        Market::Futures => "USDT-FUTURES",
    }
}

fn bitget_granularity(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1min",
        Interval::M5 => "5min",
        Interval::M15 => "15min",
        Interval::M30 => "30min",
        Interval::H1 => "1h",
        Interval::H4 => "4h",
        Interval::D1 => "1day",
        _ => "1min",
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct BitgetAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: [SingleSlotCache<HashSet<CanonicalSymbol>>; 2],
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: [mpsc::UnboundedSender<StreamCmd>; 2],
}

impl BitgetAdapter {
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
}

#[derive(Deserialize)]
struct BitgetResponse<T> {
    data: T,
}
#[derive(Deserialize)]
struct BitgetTicker {
    symbol: String,
    #[serde(rename = "lastPr")]
    last_pr: String,
}
#[derive(Deserialize)]
struct BitgetSymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
}

#[async_trait]
impl ExchangeAdapter for BitgetAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bitget
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
        let path = match market { Market::Spot => "/api/v2/spot/market/tickers", Market::Futures => "/api/v2/mix/market/tickers" };
        let mut req = self.http.get(format!("{REST_BASE}{path}"));
        if matches!(market, Market::Futures) {
            req = req.query(&[("productType", "usdt-futures")]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("bitget"))?;
        if !resp.status().is_success() {
            if opts.strict {
                return Err(Error::UpstreamUnavailable { exchange: "bitget".to_string(), status: UpstreamStatus::Network });
            }
            warn!(market = ?market, "bitget last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let body: BitgetResponse<Vec<BitgetTicker>> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bitget".to_string(), detail: e.to_string(),
        })?;
        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in body.data {
            if let Some(sym) = crate::symbol::normalize(&t.symbol) {
                if wanted.contains(&sym) {
                    if let Ok(p) = t.last_pr.parse::<f64>() {
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
        let path = match market { Market::Spot => "/api/v2/spot/market/tickers", Market::Futures => "/api/v2/mix/market/tickers" };
        let mut req = self.http.get(format!("{REST_BASE}{path}")).query(&[("symbol", symbol.as_str())]);
        if matches!(market, Market::Futures) {
            req = req.query(&[("productType", "usdt-futures")]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("bitget"))?;
        let body: BitgetResponse<Vec<BitgetTicker>> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bitget".to_string(), detail: e.to_string(),
        })?;
        let price = body.data.into_iter().next().and_then(|t| t.last_pr.parse::<f64>().ok());
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if let Some(set) = self.symbols_cache(market).get() {
            return Ok(set);
        }
        let path = match market { Market::Spot => "/api/v2/spot/public/symbols", Market::Futures => "/api/v2/mix/market/contracts" };
        let mut req = self.http.get(format!("{REST_BASE}{path}"));
        if matches!(market, Market::Futures) {
            req = req.query(&[("productType", "usdt-futures")]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("bitget"))?;
        let body: BitgetResponse<Vec<BitgetSymbolInfo>> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bitget".to_string(), detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = body.data.into_iter()
            .filter(|s| (s.status == "online" || s.status.is_empty()) && s.quote_coin == "USDT")
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
        } else { limit };
        let path = match market { Market::Spot => "/api/v2/spot/market/candles", Market::Futures => "/api/v2/mix/market/candles" };
        let mut req = self.http.get(format!("{REST_BASE}{path}")).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("granularity", bitget_granularity(fetch_interval).to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if matches!(market, Market::Futures) {
            req = req.query(&[("productType", "usdt-futures")]);
        }
        if let Some(end) = end_before {
            req = req.query(&[("endTime", (end * 1000).to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("bitget"))?;
        let body: BitgetResponse<Vec<[String; 7]>> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "bitget".to_string(), detail: e.to_string(),
        })?;
        let mut candles = Vec::with_capacity(body.data.len());
        for row in body.data.iter().rev() {
            let parse = |i: usize| row[i].parse::<f64>().ok();
            let (Some(open_ms), Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                row[0].parse::<i64>().ok(), parse(1), parse(2), parse(3), parse(4), parse(5),
            ) else { continue };
            candles.push(Candle { time: open_ms / 1000, open, high, low, close, volume, turnover: row[6].parse::<f64>().ok(), closed: true });
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
            let _ = self.cmd_channel(market).send(StreamCmd::Subscribe(symbol.as_str().to_string()));
        }
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.decref(&key) {
            let _ = self.cmd_channel(market).send(StreamCmd::Unsubscribe(symbol.as_str().to_string()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct BitgetWsMessage {
    arg: Option<BitgetWsArg>,
    data: Option<Vec<[String; 7]>>,
}
#[derive(Deserialize)]
struct BitgetWsArg {
    #[serde(rename = "instId")]
    inst_id: String,
}

async fn run_ws_reader(market: Market, mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("bitget", SessionConfig::default());
    let mut symbols: HashSet<String> = HashSet::new();
    let mut closed_flags = ClosedFlagSynthesizer::new();

    loop {
        if matches!(session.state(), SessionState::Shutdown) {
            return;
        }
        session.on_connecting();
        let connect_result = tokio_tungstenite::connect_async(WS_PUBLIC).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(market = ?market, error = %e, "bitget ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        if !symbols.is_empty() {
            let args: Vec<_> = symbols.iter()
                .map(|s| serde_json::json!({"instType": inst_type(market), "channel": "candle1m", "instId": s}))
                .collect();
            let sub = serde_json::json!({ "op": "subscribe", "args": args });
            if write.send(Message::Text(sub.to_string())).await.is_err() {
                session.begin_reconnect("resubscribe failed");
                continue;
            }
        }
        session.on_subscribed();
        debug!(market = ?market, symbols = symbols.len(), "bitget ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(s)) => {
                            symbols.insert(s.clone());
                            let msg = serde_json::json!({ "op": "subscribe", "args": [{"instType": inst_type(market), "channel": "candle1m", "instId": s}] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        Some(StreamCmd::Unsubscribe(s)) => {
                            symbols.remove(&s);
                            let msg = serde_json::json!({ "op": "unsubscribe", "args": [{"instType": inst_type(market), "channel": "candle1m", "instId": s}] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        None => { session.shutdown(); return; }
                    }
                }
                _ = ping_timer.tick() => {
                    if write.send(Message::Text("ping".to_string())).await.is_err() {
                        session.begin_reconnect("ping send failed");
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text == "pong" {
                                session.on_pong();
                            } else if let Ok(env) = serde_json::from_str::<BitgetWsMessage>(&text) {
                                if let (Some(arg), Some(rows)) = (env.arg, env.data) {
                                    if let Some(symbol) = crate::symbol::normalize(&arg.inst_id) {
                                        for row in rows {
                                            let parse = |i: usize| row[i].parse::<f64>().ok();
                                            if let (Some(open_ms), Some(open), Some(high), Some(low), Some(close), Some(volume)) =
                                                (row[0].parse::<i64>().ok(), parse(1), parse(2), parse(3), parse(4), parse(5))
                                            {
                                                let candle = Candle {
                                                    time: open_ms / 1000, open, high, low, close, volume,
                                                    turnover: row[6].parse::<f64>().ok(), closed: false,
                                                };
                                                for candle in closed_flags.observe(&symbol, candle) {
                                                    dispatch_minute_candle(&sink, ExchangeId::Bitget, symbol.clone(), market, candle, &[Interval::S1, Interval::S5, Interval::S15]);
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
                            warn!(market = ?market, error = %e, "bitget ws read error");
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
    fn inst_type_differs_by_market() {
        assert_eq!(inst_type(Market::Spot), "SPOT");
        assert_eq!(inst_type(Market::Futures), "USDT-FUTURES");
    }

    #[test]
    fn bitget_granularity_maps_common_intervals() {
        assert_eq!(bitget_granularity(Interval::M1), "1min");
        assert_eq!(bitget_granularity(Interval::D1), "1day");
    }
}
