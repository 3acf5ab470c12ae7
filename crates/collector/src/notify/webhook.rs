use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::WEBHOOK_DELIVERIES_TOTAL;
use crate::{Error, Result};

/// Posts JSON bodies to webhook URLs.
///
/// Every request is bounded by the timeout given to [`WebhookSink::new`].
/// There are no retries.
#[derive(Clone)]
pub struct WebhookSink {
    client: Client,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn send<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("webhook returned {}: {}", status, text)));
        }

        debug!("Webhook accepted with status {}", status);
        Ok(())
    }

    /// Sends `body` on a detached task. The caller may drop the handle; the
    /// outcome is only logged and counted.
    pub fn deliver<T>(&self, url: String, label: String, body: T) -> JoinHandle<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            match sink.send(&url, &body).await {
                Ok(()) => {
                    info!("Delivered alert for {}", label);
                    WEBHOOK_DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                }
                Err(Error::Http(e)) => {
                    error!("Error sending alert for {}: {}", label, e);
                    WEBHOOK_DELIVERIES_TOTAL.with_label_values(&["error"]).inc();
                }
                Err(e) => {
                    warn!("Failed to send alert for {}: {}", label, e);
                    WEBHOOK_DELIVERIES_TOTAL.with_label_values(&["rejected"]).inc();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Router};

    // Receiver that answers every POST with 500.
    async fn failing_receiver() -> String {
        let app = Router::new().route("/hook", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    #[tokio::test]
    async fn test_unreachable_url_is_an_http_error() {
        let sink = WebhookSink::new(Duration::from_millis(200)).unwrap();
        let err = sink
            .send("http://127.0.0.1:9/hook", &serde_json::json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_detached_delivery_completes_on_failure() {
        let sink = WebhookSink::new(Duration::from_millis(200)).unwrap();
        let handle = sink.deliver(
            "http://127.0.0.1:9/hook".to_string(),
            "budget".to_string(),
            serde_json::json!({}),
        );
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_is_rejected() {
        let url = failing_receiver().await;
        let sink = WebhookSink::new(Duration::from_secs(2)).unwrap();

        let err = sink.send(&url, &serde_json::json!({"ok": true})).await.unwrap_err();
        match err {
            Error::Internal(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let rejected = WEBHOOK_DELIVERIES_TOTAL.with_label_values(&["rejected"]);
        let before = rejected.get();
        let handle = sink.deliver(url, "budget".to_string(), serde_json::json!({}));
        assert!(handle.await.is_ok());
        assert!(rejected.get() > before);
    }
}
