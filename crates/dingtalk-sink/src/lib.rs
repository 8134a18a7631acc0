//! Batched log shipping to a DingTalk chat-robot webhook.
//!
//! Events are queued in memory, flushed on a fixed period, rendered through
//! an output template, and posted as one text message per batch, signed with
//! the robot's HMAC-SHA256 timestamp scheme. Delivery is best-effort: nothing
//! is persisted and failed batches are not retried.

pub mod batcher;
pub mod client;
pub mod config;
pub mod event;
pub mod payload;
pub mod render;
pub mod signer;
pub mod sink;

#[cfg(test)]
mod testing;

pub use batcher::{BatchingOptions, BatchingSink, EventSender, ShutdownStats};
pub use client::{DeliveryError, RobotClient};
pub use config::{ConfigError, SinkConfig};
pub use event::{Level, LogEvent};
pub use render::{EventRenderer, RenderError, TemplateRenderer};
pub use sink::{BatchSink, RobotSink, SinkError};

/// Build the template renderer, HTTP client, and robot sink described by
/// `config`, and start its batching loop.
///
/// All configuration problems surface here. Must be called from within a
/// Tokio runtime.
pub fn robot(config: &SinkConfig) -> Result<BatchingSink, ConfigError> {
    config.validate()?;
    let renderer = TemplateRenderer::new(&config.output_template)
        .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
    let client = RobotClient::new(config).map_err(|e| ConfigError::Client(e.to_string()))?;
    let sink = RobotSink::new(client, renderer, config.secret.clone());
    Ok(BatchingSink::spawn(sink, config.batching.clone()))
}
