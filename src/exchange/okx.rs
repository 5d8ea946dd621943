//! OKX v5 (unified spot + swap) adapter.

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

const REST_BASE: &str = "https://www.okx.com";
const WS_PUBLIC: &str = "wss://ws.okx.com:8443/ws/v5/public";

fn inst_type(market: Market) -> &'static str {
    match market {
        Market::Spot => "SPOT",
        Market::Futures => "SWAP",
    }
}

/// OKX instrument IDs carry a dash (`BTC-USDT` / `BTC-USDT-SWAP`); this
/// reattaches it from a canonical symbol, since OKX doesn't accept bare
/// concatenated symbols the way Binance/Bybit do.
fn to_inst_id(symbol: &CanonicalSymbol, market: Market) -> String {
    let base = symbol.without_quote();
    let quote = &symbol.as_str()[base.len()..];
    match market {
        Market::Spot => format!("{base}-{quote}"),
        Market::Futures => format!("{base}-{quote}-SWAP"),
    }
}

fn okx_bar(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1m",
        Interval::M5 => "5m",
        Interval::M15 => "15m",
        Interval::M30 => "30m",
        Interval::H1 => "1H",
        Interval::H4 => "4H",
        Interval::D1 => "1D",
        _ => "1m",
    }
}

enum StreamCmd {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct OkxAdapter {
    http: reqwest::Client,
    last_price: TtlCache<(CanonicalSymbol, Market), f64>,
    active_symbols: [SingleSlotCache<HashSet<CanonicalSymbol>>; 2],
    refs: RefCounts,
    sink: CandleSink,
    stream_cmd: [mpsc::UnboundedSender<StreamCmd>; 2],
}

impl OkxAdapter {
    pub fn new(sink: CandleSink) -> Arc<Self> {
        let (spot_tx, spot_rx) = mpsc::unbounded_channel();
        let (swap_tx, swap_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"),
            last_price: TtlCache::new(Duration::from_secs(2)),
            active_symbols: [
                SingleSlotCache::new(Duration::from_secs(3600)),
                SingleSlotCache::new(Duration::from_secs(3600)),
            ],
            refs: RefCounts::new(),
            sink,
            stream_cmd: [spot_tx, swap_tx],
        });
        tokio::spawn(run_ws_reader(Market::Spot, spot_rx, adapter.sink.clone()));
        tokio::spawn(run_ws_reader(Market::Futures, swap_rx, adapter.sink.clone()));
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
struct OkxEnvelope<T> {
    data: Vec<T>,
}
#[derive(Deserialize)]
struct OkxTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
}
#[derive(Deserialize)]
struct OkxInstrument {
    #[serde(rename = "instId")]
    inst_id: String,
    state: String,
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Okx
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
        let url = format!("{REST_BASE}/api/v5/market/tickers");
        let resp = self.http.get(&url).query(&[("instType", inst_type(market))]).send().await
            .map_err(|e| Error::from(e).with_exchange("okx"))?;
        if !resp.status().is_success() {
            if opts.strict {
                return Err(Error::UpstreamUnavailable { exchange: "okx".to_string(), status: UpstreamStatus::Network });
            }
            warn!(market = ?market, "okx last_prices fetch failed, returning partial");
            return Ok(out);
        }
        let body: OkxEnvelope<OkxTicker> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "okx".to_string(), detail: e.to_string(),
        })?;
        let wanted: HashSet<&CanonicalSymbol> = missing.iter().collect();
        for t in body.data {
            let normalized = t.inst_id.trim_end_matches("-SWAP");
            if let Some(sym) = crate::symbol::normalize(normalized) {
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
        let url = format!("{REST_BASE}/api/v5/market/ticker");
        let resp = self.http.get(&url).query(&[("instId", to_inst_id(symbol, market))]).send().await
            .map_err(|e| Error::from(e).with_exchange("okx"))?;
        let body: OkxEnvelope<OkxTicker> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "okx".to_string(), detail: e.to_string(),
        })?;
        let price = body.data.into_iter().next().and_then(|t| t.last.parse::<f64>().ok());
        if let Some(p) = price {
            self.last_price.put((symbol.clone(), market), p);
        }
        Ok(price)
    }

    async fn active_symbols(&self, market: Market) -> Result<HashSet<CanonicalSymbol>> {
        if let Some(set) = self.symbols_cache(market).get() {
            return Ok(set);
        }
        let url = format!("{REST_BASE}/api/v5/public/instruments");
        let resp = self.http.get(&url).query(&[("instType", inst_type(market))]).send().await
            .map_err(|e| Error::from(e).with_exchange("okx"))?;
        let body: OkxEnvelope<OkxInstrument> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "okx".to_string(), detail: e.to_string(),
        })?;
        let set: HashSet<CanonicalSymbol> = body.data.into_iter()
            .filter(|i| i.state == "live" && i.inst_id.ends_with("USDT") || i.inst_id.contains("USDT-SWAP"))
            .filter_map(|i| crate::symbol::normalize(i.inst_id.trim_end_matches("-SWAP")))
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
        let url = format!("{REST_BASE}/api/v5/market/candles");
        let mut req = self.http.get(&url).query(&[
            ("instId", to_inst_id(symbol, market)),
            ("bar", okx_bar(fetch_interval).to_string()),
            ("limit", fetch_limit.to_string()),
        ]);
        if let Some(end) = end_before {
            req = req.query(&[("after", (end * 1000).to_string())]);
        }
        let resp = req.send().await.map_err(|e| Error::from(e).with_exchange("okx"))?;
        let body: OkxEnvelope<[String; 9]> = resp.json().await.map_err(|e| Error::UpstreamDecodeError {
            exchange: "okx".to_string(), detail: e.to_string(),
        })?;
        let mut candles = Vec::with_capacity(body.data.len());
        for row in body.data.iter().rev() {
            let parse = |i: usize| row[i].parse::<f64>().ok();
            let (Some(open_ms), Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                row[0].parse::<i64>().ok(), parse(1), parse(2), parse(3), parse(4), parse(5),
            ) else { continue };
            candles.push(Candle {
                time: open_ms / 1000, open, high, low, close, volume,
                turnover: row[7].parse::<f64>().ok(), closed: true,
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
            let _ = self.cmd_channel(market).send(StreamCmd::Subscribe(to_inst_id(symbol, market)));
        }
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &CanonicalSymbol, market: Market, interval: Interval) -> Result<()> {
        let base_interval = if interval.is_synthesized() { Interval::M1 } else { interval };
        let key = StreamKey { symbol: symbol.clone(), market, interval: base_interval };
        if self.refs.decref(&key) {
            let _ = self.cmd_channel(market).send(StreamCmd::Unsubscribe(to_inst_id(symbol, market)));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct OkxWsEnvelope {
    arg: Option<OkxWsArg>,
    data: Option<Vec<[String; 9]>>,
}
#[derive(Deserialize)]
struct OkxWsArg {
    #[serde(rename = "instId")]
    inst_id: String,
}

async fn run_ws_reader(market: Market, mut cmds: mpsc::UnboundedReceiver<StreamCmd>, sink: CandleSink) {
    let mut session = WsSession::new("okx", SessionConfig::default());
    let mut inst_ids: HashSet<String> = HashSet::new();

    loop {
        if matches!(session.state(), SessionState::Shutdown) {
            return;
        }
        session.on_connecting();
        let connect_result = tokio_tungstenite::connect_async(WS_PUBLIC).await;
        let (mut write, mut read) = match connect_result {
            Ok((stream, _)) => stream.split(),
            Err(e) => {
                warn!(market = ?market, error = %e, "okx ws connect failed");
                let backoff = session.begin_reconnect("connect failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        session.on_connected();
        if !inst_ids.is_empty() {
            let args: Vec<_> = inst_ids.iter().map(|id| serde_json::json!({"channel": "candle1m", "instId": id})).collect();
            let sub = serde_json::json!({ "op": "subscribe", "args": args });
            if write.send(Message::Text(sub.to_string())).await.is_err() {
                session.begin_reconnect("resubscribe failed");
                continue;
            }
        }
        session.on_subscribed();
        debug!(market = ?market, insts = inst_ids.len(), "okx ws streaming");

        let mut ping_timer = tokio::time::interval(session.ping_interval());
        loop {
            tokio::select! {
                cmd = cmds.recv() => {
                    match cmd {
                        Some(StreamCmd::Subscribe(id)) => {
                            inst_ids.insert(id.clone());
                            let msg = serde_json::json!({ "op": "subscribe", "args": [{"channel": "candle1m", "instId": id}] });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                        }
                        Some(StreamCmd::Unsubscribe(id)) => {
                            inst_ids.remove(&id);
                            let msg = serde_json::json!({ "op": "unsubscribe", "args": [{"channel": "candle1m", "instId": id}] });
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
                            } else if let Ok(env) = serde_json::from_str::<OkxWsEnvelope>(&text) {
                                if let (Some(arg), Some(rows)) = (env.arg, env.data) {
                                    let normalized = arg.inst_id.trim_end_matches("-SWAP");
                                    if let Some(symbol) = crate::symbol::normalize(normalized) {
                                        for row in rows {
                                            let parse = |i: usize| row[i].parse::<f64>().ok();
                                            if let (Some(open_ms), Some(open), Some(high), Some(low), Some(close), Some(volume)) =
                                                (row[0].parse::<i64>().ok(), parse(1), parse(2), parse(3), parse(4), parse(5))
                                            {
                                                let candle = Candle {
                                                    time: open_ms / 1000, open, high, low, close, volume,
                                                    turnover: row[7].parse::<f64>().ok(),
                                                    closed: row.get(8).map(|s| s == "1").unwrap_or(false),
                                                };
                                                dispatch_minute_candle(&sink, ExchangeId::Okx, symbol.clone(), market, candle, &[Interval::S1, Interval::S5, Interval::S15]);
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
                            warn!(market = ?market, error = %e, "okx ws read error");
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
    fn inst_id_reattaches_dash_for_spot_and_swap() {
        let symbol = crate::symbol::normalize("BTCUSDT").unwrap();
        assert_eq!(to_inst_id(&symbol, Market::Spot), "BTC-USDT");
        assert_eq!(to_inst_id(&symbol, Market::Futures), "BTC-USDT-SWAP");
    }

    #[test]
    fn okx_bar_maps_common_intervals() {
        assert_eq!(okx_bar(Interval::M1), "1m");
        assert_eq!(okx_bar(Interval::D1), "1D");
    }
}
