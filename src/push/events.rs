//! Wire schema for the push channel's bidirectional JSON messages.

use crate::candle::{Candle, Interval};
use crate::exchange::{ExchangeId, Market};
use crate::symbol::CanonicalSymbol;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    SubscribeKline {
        exchange: ExchangeId,
        symbol: String,
        interval: String,
        #[serde(rename = "exchangeType")]
        exchange_type: Market,
    },
    UnsubscribeKline {
        exchange: ExchangeId,
        symbol: String,
        interval: String,
        #[serde(rename = "exchangeType")]
        exchange_type: Market,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct KlineUpdatePayload {
    pub exchange: ExchangeId,
    pub symbol: CanonicalSymbol,
    pub interval: Interval,
    #[serde(rename = "exchangeType")]
    pub exchange_type: Market,
    pub kline: Candle,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertTriggeredPayload {
    pub id: String,
    #[serde(rename = "alertID")]
    pub alert_id: String,
    pub name: String,
    pub description: String,
    pub triggered: bool,
    #[serde(rename = "triggeredAt")]
    pub triggered_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "currentPrice")]
    pub current_price: f64,
    #[serde(rename = "targetValue")]
    pub target_value: f64,
    pub condition: crate::alerts::Condition,
    pub symbol: String,
    #[serde(rename = "canonicalSymbol")]
    pub canonical_symbol: String,
    #[serde(rename = "alertType")]
    pub alert_type: &'static str,
    #[serde(rename = "initialPrice", skip_serializing_if = "Option::is_none")]
    pub initial_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    KlineUpdate {
        #[serde(flatten)]
        payload: KlineUpdatePayload,
    },
    AlertTriggered {
        #[serde(flatten)]
        payload: AlertTriggeredPayload,
    },
    KlineError {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_parses_subscribe_kline() {
        let json = r#"{"event":"subscribe-kline","exchange":"binance","symbol":"BTCUSDT","interval":"1m","exchangeType":"spot"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ClientEvent::SubscribeKline { .. }));
    }

    #[test]
    fn server_event_serializes_kline_error() {
        let event = ServerEvent::KlineError { error: "boom".to_string() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"kline-error\""));
        assert!(json.contains("\"error\":\"boom\""));
    }

    #[test]
    fn server_event_flattens_kline_update_fields_to_the_top_level() {
        let event = ServerEvent::KlineUpdate {
            payload: KlineUpdatePayload {
                exchange: ExchangeId::Binance,
                symbol: crate::symbol::normalize("BTCUSDT").unwrap(),
                interval: Interval::M1,
                exchange_type: Market::Spot,
                kline: Candle {
                    time: 0,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 0.0,
                    turnover: None,
                    closed: true,
                },
            },
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "kline-update");
        assert_eq!(value["exchange"], "binance");
        assert_eq!(value["symbol"], "BTCUSDT");
        assert!(value.get("payload").is_none());
    }
}
