use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::client::DeliveryError;
use crate::event::LogEvent;
use crate::render::{EventRenderer, RenderError};
use crate::sink::{BatchSink, SinkError};

/// Renders `"{message}\n"`, except for events whose message equals the
/// needle: those write a partial line and then fail.
pub struct SelectiveRenderer {
    needle: String,
}

impl SelectiveRenderer {
    pub fn failing_on(needle: &str) -> Self {
        Self {
            needle: needle.to_owned(),
        }
    }
}

impl EventRenderer for SelectiveRenderer {
    fn render(&self, event: &LogEvent, out: &mut String) -> Result<(), RenderError> {
        if event.message == self.needle {
            out.push_str("partial");
            return Err(RenderError::Event(event.message.clone()));
        }
        out.push_str(&event.message);
        out.push('\n');
        Ok(())
    }
}

#[derive(Default)]
pub struct SinkProbe {
    pub batches: Mutex<Vec<Vec<LogEvent>>>,
    pub attempts: AtomicU32,
    pub empty_calls: AtomicU32,
    pub released: AtomicBool,
    pub activity: Notify,
}

impl SinkProbe {
    pub fn delivered(&self) -> Vec<Vec<LogEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn delivered_messages(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .flatten()
            .map(|e| e.message)
            .collect()
    }

    /// Wait until at least `n` emit attempts (successful or not) have been made.
    pub async fn wait_for_attempts(&self, n: u32) {
        while self.attempts.load(Ordering::SeqCst) < n {
            self.activity.notified().await;
        }
    }

    pub async fn wait_for_empty_calls(&self, n: u32) {
        while self.empty_calls.load(Ordering::SeqCst) < n {
            self.activity.notified().await;
        }
    }
}

/// Records batches in memory. Optionally fails chosen attempts or stalls.
pub struct RecordingSink {
    probe: Arc<SinkProbe>,
    fail_attempts: Vec<u32>,
    stall: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<SinkProbe>) {
        let probe = Arc::new(SinkProbe::default());
        (
            Self {
                probe: Arc::clone(&probe),
                fail_attempts: Vec::new(),
                stall: None,
            },
            probe,
        )
    }

    /// Fail the given 1-based attempts with a rejected-status error.
    pub fn failing_attempts(mut self, attempts: &[u32]) -> Self {
        self.fail_attempts = attempts.to_vec();
        self
    }

    /// Sleep this long inside every emit before recording.
    pub fn stalling(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }
}

impl BatchSink for RecordingSink {
    async fn emit_batch(&self, batch: Vec<LogEvent>) -> Result<(), SinkError> {
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        let attempt = self.probe.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let result = if self.fail_attempts.contains(&attempt) {
            Err(SinkError::Delivery(DeliveryError::Rejected {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            }))
        } else {
            self.probe.batches.lock().unwrap().push(batch);
            Ok(())
        };
        self.probe.activity.notify_one();
        result
    }

    async fn on_empty_batch(&self) {
        self.probe.empty_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.activity.notify_one();
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.probe.released.store(true, Ordering::SeqCst);
    }
}
