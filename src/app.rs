//! The single top-level application struct. No process-wide mutable state
//! lives outside it — the kline manager, push hub, and alert engine are
//! explicit dependencies constructed once in [`Application::init`], matching
//! the design note that globals/singleton managers become fields on one
//! struct with an `init(deps)` constructor.

use crate::alerts::engine::AlertEngine;
use crate::alerts::store::{AlertStore, SqliteAlertStore};
use crate::auth::JwtHandler;
use crate::candle::{Candle, Interval};
use crate::config::Config;
use crate::exchange::{binance, bitget, bybit, gate, mexc, okx, CandleSink, ExchangeAdapter, ExchangeId, ExchangeRegistry, Market};
use crate::kline::KlineManager;
use crate::push::hub::Hub;
use crate::symbol::CanonicalSymbol;
use crate::tokens::ConnectTokenStore;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub struct Application {
    pub config: Config,
    pub registry: Arc<ExchangeRegistry>,
    pub hub: Arc<Hub>,
    pub kline_manager: Arc<KlineManager>,
    pub alert_engine: Arc<AlertEngine>,
    pub connect_tokens: Arc<ConnectTokenStore>,
    pub jwt: Arc<JwtHandler>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Application {
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        // The adapter registry and the kline manager are mutually
        // dependent in spirit (adapters emit candles, the manager routes
        // them) but neither holds a reference to the other: adapters emit
        // onto a channel, decoupling construction order and matching the
        // design note that the manager never holds a back-reference to an
        // adapter.
        let (candle_tx, mut candle_rx) =
            mpsc::unbounded_channel::<(ExchangeId, CanonicalSymbol, Interval, Market, Candle)>();
        let sink: CandleSink = Arc::new(move |exchange, symbol, interval, market, candle| {
            let _ = candle_tx.send((exchange, symbol, interval, market, candle));
        });

        let mut adapters: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(ExchangeId::Binance, binance::BinanceAdapter::new(sink.clone()));
        adapters.insert(ExchangeId::Bybit, bybit::BybitAdapter::new(sink.clone()));
        adapters.insert(ExchangeId::Okx, okx::OkxAdapter::new(sink.clone()));
        adapters.insert(ExchangeId::Gate, gate::GateAdapter::new(sink.clone()));
        adapters.insert(ExchangeId::Bitget, bitget::BitgetAdapter::new(sink.clone()));
        adapters.insert(ExchangeId::Mexc, mexc::MexcAdapter::new(sink));

        let registry = Arc::new(ExchangeRegistry::new(adapters));
        let hub = Arc::new(Hub::new());
        let kline_manager = KlineManager::new(registry.clone(), hub.clone());

        let forwarder_manager = kline_manager.clone();
        tokio::spawn(async move {
            while let Some((exchange, symbol, interval, market, candle)) = candle_rx.recv().await {
                forwarder_manager.on_candle(exchange, symbol, interval, market, candle);
            }
        });

        let alert_store: Arc<dyn AlertStore> = Arc::new(SqliteAlertStore::open(&config.database_path)?);
        let alert_engine = AlertEngine::new(alert_store, registry.clone(), hub.clone());

        let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
        let connect_tokens = Arc::new(ConnectTokenStore::new());
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let app = Arc::new(Self {
            config,
            registry,
            hub,
            kline_manager,
            alert_engine,
            connect_tokens,
            jwt,
            shutdown,
        });

        app.spawn_background_tasks();
        Ok(app)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let engine = self.alert_engine.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        let shutdown = self.shutdown.clone();
        tokio::spawn(crate::alerts::engine::run_sweep_loop(engine, interval, shutdown));

        let tokens = self.connect_tokens.clone();
        let mut sweep_interval = self.config.sweep_interval_secs;
        if sweep_interval == 0 {
            sweep_interval = 7;
        }
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
            loop {
                tokio::select! {
                    _ = ticker.tick() => tokens.sweep_expired(),
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    /// Stop accepting new work and signal every background loop to exit.
    /// The HTTP listener's own accept loop is stopped by the caller
    /// dropping the `axum::serve` future; this only tears down the
    /// sweep/ws-adjacent background tasks owned by the application.
    pub async fn shutdown(&self) {
        info!("application shutdown requested");
        self.shutdown.notify_waiters();
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
