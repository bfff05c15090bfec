//! reqwest-backed outbound transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

use super::Transport;

/// Posts JSON envelopes over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, endpoint: &str, envelope: &Envelope) -> Result<()> {
        let body = envelope.to_json_bytes().map_err(Error::Encode)?;

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::ConnectionTimeout {
                        endpoint: endpoint.to_string(),
                    }
                } else {
                    Error::connection(endpoint, e.to_string())
                }
            })?;

        let status = response.status();
        trace!(endpoint, id = envelope.id, status = status.as_u16(), "Delivery response");

        if status != StatusCode::OK {
            return Err(Error::delivery_rejected(endpoint, status.as_u16()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FleetMessage, Location};

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let envelope = Envelope::new(1, FleetMessage::reading(1, Location::default(), 0.5));

        // Port 9 (discard) on loopback is almost never listening.
        let err = transport
            .deliver("http://127.0.0.1:9", &envelope)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }
}
