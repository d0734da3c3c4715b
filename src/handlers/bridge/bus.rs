use async_trait::async_trait;
use log::{error, warn};
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::handlers::s2::transport::{BusError, BusEvent, S2Bus};

// --------------------------------------------------------------------------------------------------------------
// S2 bus binding over the local RPC bridge: unicast methods are POSTs, broadcast signals arrive
// through a long-polled event feed that is pumped into the controller's channel.

pub struct HttpBus {
    client: Client,
    base_url: String,
}

impl HttpBus {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    async fn post_for_bool(&self, endpoint: &str, body: serde_json::Value) -> Result<bool, BusError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BusError::Transport(format!("{}: {}", endpoint, e)))?;

        if !response.status().is_success() {
            return Err(BusError::Transport(format!("{} returned HTTP {}", endpoint, response.status())));
        }

        response
            .json::<bool>()
            .await
            .map_err(|e| BusError::Transport(format!("{}: invalid reply: {}", endpoint, e)))
    }
}

#[async_trait]
impl S2Bus for HttpBus {
    async fn connect(&self, client_id: &str, keep_alive_interval_s: u32) -> Result<bool, BusError> {
        self.post_for_bool(
            "/s2/connect",
            json!({ "client_id": client_id, "keep_alive_interval": keep_alive_interval_s }),
        )
        .await
    }

    async fn keep_alive(&self, client_id: &str) -> Result<bool, BusError> {
        self.post_for_bool("/s2/keepalive", json!({ "client_id": client_id })).await
    }

    async fn send_message(&self, client_id: &str, payload: &str) -> Result<(), BusError> {
        let url = format!("{}/s2/message", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "client_id": client_id, "payload": payload }))
            .send()
            .await
            .map_err(|e| BusError::Transport(format!("/s2/message: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BusError::Transport(format!("/s2/message returned HTTP {}", response.status())))
        }
    }
}

// --------------------------------------------------------------------------------------------------------------

/// Long-poll the bridge's event feed and forward everything into the
/// controller's channel. Runs until the receiving side goes away; transport
/// hiccups back off briefly and retry.
pub async fn pump_events(client: Client, base_url: String, tx: mpsc::Sender<BusEvent>) {
    let url = format!("{}/events?timeout=30", base_url.trim_end_matches('/'));

    loop {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Vec<BusEvent>>().await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("[Bridge] Failed to parse event feed: {}", e);
                        sleep(Duration::from_secs(5)).await;
                    }
                }
            }
            Ok(response) => {
                warn!("[Bridge] Event feed returned HTTP {}", response.status());
                sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                error!("[Bridge] HTTP error polling the event feed: {}", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
