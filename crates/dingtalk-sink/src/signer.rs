use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp and signature for a single request. Both go on the same URL;
/// the robot endpoint rejects a pair that was not computed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub timestamp: i64,
    pub sign: String,
}

/// The string the robot endpoint expects to be signed: `"{timestamp}\n{secret}"`.
pub fn string_to_sign(secret: &str, timestamp: i64) -> String {
    format!("{timestamp}\n{secret}")
}

/// `base64(HMAC-SHA256(key = secret, message = "{timestamp}\n{secret}"))`.
pub fn sign(secret: &str, timestamp: i64) -> Signature {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(string_to_sign(secret, timestamp).as_bytes());
    Signature {
        timestamp,
        sign: BASE64.encode(mac.finalize().into_bytes()),
    }
}

/// Wall-clock milliseconds since the Unix epoch, never repeating.
///
/// If the clock has not advanced (or went backwards) since the last call,
/// the previous value plus one is issued instead.
#[derive(Debug, Default)]
pub struct TimestampSource {
    last: AtomicI64,
}

impl TimestampSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        self.next_from(chrono::Utc::now().timestamp_millis())
    }

    fn next_from(&self, now: i64) -> i64 {
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
