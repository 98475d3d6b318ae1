//! Live broker WebSocket connection.
//!
//! A background task owns the socket and reconnects with backoff on
//! failure; the public handle only flips an `AtomicBool` and forwards
//! subscribe/unsubscribe requests over an internal command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::broker::{BrokerConnection, TickSender};
use crate::domain::{Mode, Tick, Token};
use crate::errors::Result;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum Command {
    Subscribe(Vec<Token>, Mode),
    Unsubscribe(Vec<Token>),
}

#[derive(Deserialize)]
struct WireTick {
    token: Token,
    last_price: f64,
    volume: Option<u64>,
    oi: Option<u64>,
}

pub struct WsBroker {
    cmd_tx: mpsc::Sender<Command>,
    healthy: Arc<AtomicBool>,
}

impl WsBroker {
    pub fn connect(url: String, tick_tx: TickSender) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let healthy = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_connection_loop(url, cmd_rx, tick_tx, healthy.clone()));

        Self { cmd_tx, healthy }
    }
}

async fn run_connection_loop(
    url: String,
    mut cmd_rx: mpsc::Receiver<Command>,
    tick_tx: TickSender,
    healthy: Arc<AtomicBool>,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                info!(%url, "broker websocket connected");
                healthy.store(true, Ordering::SeqCst);
                backoff = MIN_BACKOFF;

                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(Command::Subscribe(tokens, mode)) => {
                                    let msg = serde_json::json!({ "a": "subscribe", "v": tokens, "m": mode_str(mode) });
                                    if write.send(Message::Text(msg.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Unsubscribe(tokens)) => {
                                    let msg = serde_json::json!({ "a": "unsubscribe", "v": tokens });
                                    if write.send(Message::Text(msg.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                                None => return,
                            }
                        }
                        frame = read.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(wire) = serde_json::from_str::<WireTick>(&text) {
                                        let tick = Tick {
                                            token: wire.token,
                                            last_price: wire.last_price,
                                            volume: wire.volume,
                                            oi: wire.oi,
                                            depth: None,
                                            timestamp: chrono::Utc::now(),
                                        };
                                        if tick_tx.try_send(tick).is_err() {
                                            metrics::counter!("broker_tick_dropped_total").increment(1);
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "broker websocket read error");
                                    break;
                                }
                                None => {
                                    warn!("broker websocket closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                healthy.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!(error = %e, %url, backoff_ms = backoff.as_millis(), "broker websocket connect failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Ltp => "ltp",
        Mode::Quote => "quote",
        Mode::Full => "full",
    }
}

#[async_trait]
impl BrokerConnection for WsBroker {
    async fn subscribe(&self, tokens: &[Token], mode: Mode) -> Result<()> {
        self.cmd_tx
            .send(Command::Subscribe(tokens.to_vec(), mode))
            .await
            .map_err(|_| crate::errors::GatewayError::Transient("broker command channel closed".into()))?;
        Ok(())
    }

    async fn unsubscribe(&self, tokens: &[Token]) -> Result<()> {
        self.cmd_tx
            .send(Command::Unsubscribe(tokens.to_vec()))
            .await
            .map_err(|_| crate::errors::GatewayError::Transient("broker command channel closed".into()))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Bulk HTTP surface (instrument dump, historical candles) separate from
/// the streaming socket, backed by `reqwest`.
pub struct BrokerHttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrokerHttpClient {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }

    pub async fn fetch_instruments_raw(&self) -> anyhow::Result<String> {
        let resp = self.client.get(format!("{}/instruments", self.base_url)).send().await?;
        Ok(resp.error_for_status()?.text().await?)
    }

    pub async fn fetch_historical(&self, token: Token, from: &str, to: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(format!("{}/historical/{token}", self.base_url))
            .query(&[("from", from), ("to", to)])
            .send()
            .await?;
        Ok(resp.error_for_status()?.text().await?)
    }

    pub async fn place_order(&self, account_id: &str, body: &serde_json::Value) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/orders", self.base_url))
            .header("X-Account-Id", account_id)
            .json(body)
            .send()
            .await?;
        let value: serde_json::Value = resp.error_for_status()?.json().await?;
        Ok(value
            .get("order_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Live `OrderBroker` backed by the broker's REST order-placement endpoint.
pub struct HttpOrderBroker {
    client: BrokerHttpClient,
}

impl HttpOrderBroker {
    pub fn new(base_url: String) -> Self {
        Self { client: BrokerHttpClient::new(base_url) }
    }
}

#[async_trait]
impl crate::executor::OrderBroker for HttpOrderBroker {
    async fn place_order(
        &self,
        account_id: &crate::domain::AccountId,
        request: &crate::executor::OrderRequest,
    ) -> crate::errors::Result<String> {
        let body = serde_json::json!({
            "instrument_token": request.instrument_token,
            "side": request.side,
            "quantity": request.quantity,
            "order_type": request.order_type,
            "price": request.price,
        });
        self.client
            .place_order(account_id, &body)
            .await
            .map_err(|e| crate::errors::GatewayError::Transient(format!("order placement failed: {e}")))
    }
}
