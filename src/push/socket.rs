//! axum WebSocket upgrade handler for the push fabric, grounded directly on
//! the backend's `websocket_handler`/`handle_socket` pair in `main.rs`.

use crate::app::Application;
use crate::auth::resolve_user_id;
use crate::candle::Interval;
use crate::exchange::ExchangeId;
use crate::kline::SubscriptionKey;
use crate::push::events::{ClientEvent, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(app): State<Arc<Application>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let query = params.get("token").map(|t| format!("token={t}"));
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let user_id = resolve_user_id(&app.jwt, query.as_deref(), auth_header);

    ws.on_upgrade(move |socket| handle_socket(socket, app, user_id))
}

async fn handle_socket(socket: WebSocket, app: Arc<Application>, user_id: Option<String>) {
    let Some(user_id) = user_id else {
        let (mut tx, _rx) = socket.split();
        let event = ServerEvent::KlineError {
            error: "authentication error".to_string(),
        };
        if let Ok(json) = serde_json::to_string(&event) {
            let _ = tx.send(Message::Text(json)).await;
        }
        return;
    };

    let client_id = Uuid::new_v4().to_string();
    let mut room_rx = app.hub.join(client_id.clone(), user_id.clone());
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_client_id = client_id.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            match room_rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(client_id = %writer_client_id, skipped, "push socket lagged, dropping frames");
                }
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => handle_client_message(&app, &client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    write_task.abort();
    app.kline_manager.on_client_disconnect(&client_id).await;
    app.hub.leave(&client_id);
}

async fn handle_client_message(app: &Arc<Application>, client_id: &str, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(client_id, %err, "malformed push-fabric client message");
            app.hub.send_to_client(
                &client_id.to_string(),
                ServerEvent::KlineError {
                    error: "malformed message".to_string(),
                },
            );
            return;
        }
    };

    match event {
        ClientEvent::SubscribeKline {
            exchange,
            symbol,
            interval,
            exchange_type,
        } => match build_key(exchange, &symbol, &interval, exchange_type) {
            Some(key) => {
                if let Err(err) = app.kline_manager.subscribe(client_id.to_string(), key).await {
                    app.hub.send_to_client(
                        &client_id.to_string(),
                        ServerEvent::KlineError {
                            error: err.to_string(),
                        },
                    );
                }
            }
            None => app.hub.send_to_client(
                &client_id.to_string(),
                ServerEvent::KlineError {
                    error: format!("cannot resolve symbol/interval: {symbol}/{interval}"),
                },
            ),
        },
        ClientEvent::UnsubscribeKline {
            exchange,
            symbol,
            interval,
            exchange_type,
        } => {
            if let Some(key) = build_key(exchange, &symbol, &interval, exchange_type) {
                app.kline_manager.unsubscribe(&client_id.to_string(), &key).await;
            }
        }
    }
}

fn build_key(
    exchange: ExchangeId,
    symbol: &str,
    interval: &str,
    market: crate::exchange::Market,
) -> Option<SubscriptionKey> {
    let symbol = crate::symbol::normalize(symbol)?;
    let interval = Interval::parse(interval)?;
    Some(SubscriptionKey {
        exchange,
        symbol,
        interval,
        market,
    })
}
