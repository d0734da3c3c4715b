use log::warn;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;

use crate::handlers::ems::controller::TelemetrySink;

// --------------------------------------------------------------------------------------------------------------
// Published /Ems/... values go out through POST /publish. Publishing is fire-and-forget from the
// control loop's perspective: values are queued and a background task drains the queue, so a slow
// bridge can never stall a tick.

pub struct HttpTelemetry {
    tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
}

impl HttpTelemetry {
    /// Spawn the flusher task and hand back the sink.
    pub fn spawn(client: Client, base_url: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, serde_json::Value)>();
        let url = format!("{}/publish", base_url.trim_end_matches('/'));

        tokio::spawn(async move {
            while let Some((path, value)) = rx.recv().await {
                let result = client
                    .post(&url)
                    .json(&json!({ "path": path, "value": value }))
                    .send()
                    .await;
                if let Err(e) = result {
                    warn!("[Bridge] Failed to publish {}: {}", path, e);
                }
            }
        });

        Self { tx }
    }
}

impl TelemetrySink for HttpTelemetry {
    fn publish(&self, path: &str, value: serde_json::Value) {
        // Send failures mean the flusher is gone, i.e. we are shutting down.
        let _ = self.tx.send((path.to_string(), value));
    }
}
