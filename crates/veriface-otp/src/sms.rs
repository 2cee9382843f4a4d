use crate::phone::PhoneNumber;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outbound SMS delivery.
///
/// A failed send is reported, never raised: issuing a code does not depend
/// on delivery.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Returns whether the provider accepted the message.
    async fn send(&self, to: &PhoneNumber, body: &str) -> bool;

    fn provider_name(&self) -> &str;
}

/// OTP message body.
pub fn otp_message(code: &str, ttl: Duration) -> String {
    let minutes = ttl.num_minutes().max(1);
    format!("Your verification OTP is {code}. Valid for {minutes} minutes. Do not share with anyone.")
}

/// Development transport: logs instead of sending.
#[derive(Debug, Default)]
pub struct LogSmsTransport {
    sent: AtomicU64,
    simulate_failure: AtomicBool,
}

impl LogSmsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that rejects every message.
    pub fn failing() -> Self {
        let transport = Self::new();
        transport.set_simulate_failure(true);
        transport
    }

    pub fn set_simulate_failure(&self, fail: bool) {
        self.simulate_failure.store(fail, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SmsTransport for LogSmsTransport {
    async fn send(&self, to: &PhoneNumber, body: &str) -> bool {
        if self.simulate_failure.load(Ordering::SeqCst) {
            tracing::warn!(provider = "log", phone = %to.masked(), "simulated SMS failure");
            return false;
        }
        let count = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(provider = "log", phone = %to.masked(), count, len = body.len(), "SMS sent");
        tracing::debug!(provider = "log", body, "SMS body");
        true
    }

    fn provider_name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otp_message() {
        assert_eq!(
            otp_message("042917", Duration::minutes(5)),
            "Your verification OTP is 042917. Valid for 5 minutes. Do not share with anyone."
        );
    }

    #[tokio::test]
    async fn test_log_transport_counts_and_fails() {
        let phone = PhoneNumber::parse("9876543210").unwrap();
        let transport = LogSmsTransport::new();
        assert!(transport.send(&phone, "hello").await);
        assert!(transport.send(&phone, "again").await);
        assert_eq!(transport.sent_count(), 2);

        transport.set_simulate_failure(true);
        assert!(!transport.send(&phone, "dropped").await);
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(transport.provider_name(), "log");
    }
}
