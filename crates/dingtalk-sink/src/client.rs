use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::config::SinkConfig;
use crate::signer::Signature;

pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("robot endpoint rejected payload: {status}")]
    Rejected { status: reqwest::StatusCode },

    #[error("failed to build HTTP client: {0}")]
    Build(reqwest::Error),
}

/// Outbound connection to the robot webhook.
///
/// Owns the pooled HTTP client; dropping the `RobotClient` releases it.
#[derive(Debug)]
pub struct RobotClient {
    client: Client,
    base_url: String,
    token: String,
}

impl RobotClient {
    pub fn new(config: &SinkConfig) -> Result<Self, DeliveryError> {
        // reqwest is built without a bundled provider; a host that already
        // installed one keeps it.
        let _ = rustls::crypto::ring::default_provider().install_default();

        if config.accept_invalid_certs {
            warn!("TLS certificate validation is disabled for the robot endpoint");
        }

        let client = Client::builder()
            .timeout(config.send_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(DeliveryError::Build)?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    /// `{base_url}{token}&timestamp={timestamp}&sign={urlencoded sign}`
    pub fn request_url(&self, signature: &Signature) -> String {
        let sign: String = form_urlencoded::byte_serialize(signature.sign.as_bytes()).collect();
        format!(
            "{}{}&timestamp={}&sign={}",
            self.base_url, self.token, signature.timestamp, sign
        )
    }

    /// One POST, no retry.
    pub async fn send(&self, signature: &Signature, body: Bytes) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.request_url(signature))
            .header("content-type", CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!(%status, "robot accepted batch");
            Ok(())
        } else {
            Err(DeliveryError::Rejected { status })
        }
    }
}
