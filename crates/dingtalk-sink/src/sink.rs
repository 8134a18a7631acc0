use std::future::Future;

use thiserror::Error;

use crate::client::{DeliveryError, RobotClient};
use crate::event::LogEvent;
use crate::payload::{PayloadError, build_payload};
use crate::render::EventRenderer;
use crate::signer::{TimestampSource, sign};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Destination for drained batches.
///
/// The batcher awaits `emit_batch` to completion before draining again, so
/// implementations never see two batches at once.
pub trait BatchSink: Send + Sync + 'static {
    fn emit_batch(&self, batch: Vec<LogEvent>)
    -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Called on a tick that found the queue empty. Must not fail.
    fn on_empty_batch(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Render → sign → send, once per batch.
pub struct RobotSink<R> {
    client: RobotClient,
    renderer: R,
    secret: String,
    timestamps: TimestampSource,
}

impl<R: EventRenderer> RobotSink<R> {
    pub fn new(client: RobotClient, renderer: R, secret: impl Into<String>) -> Self {
        Self {
            client,
            renderer,
            secret: secret.into(),
            timestamps: TimestampSource::new(),
        }
    }
}

impl<R: EventRenderer> BatchSink for RobotSink<R> {
    async fn emit_batch(&self, batch: Vec<LogEvent>) -> Result<(), SinkError> {
        let body = build_payload(&batch, &self.renderer)?;
        // Captured once: the same value is signed and sent.
        let signature = sign(&self.secret, self.timestamps.next());
        self.client.send(&signature, body).await?;
        Ok(())
    }
}
