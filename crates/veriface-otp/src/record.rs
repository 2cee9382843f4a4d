use crate::phone::PhoneNumber;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// One issued code and its verification state.
#[derive(Clone, PartialEq, Eq)]
pub struct OtpRecord {
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}

impl OtpRecord {
    pub fn new(code: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            code,
            issued_at: now,
            expires_at: now + ttl,
            attempts: 0,
        }
    }

    /// Valid up to and including `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn expires_in_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

// Keep codes out of logs.
impl fmt::Debug for OtpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtpRecord")
            .field("code", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Read-only view of a phone's OTP state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpStatus {
    pub exists: bool,
    pub attempts_remaining: u32,
    pub expires_in_seconds: i64,
}

impl OtpStatus {
    pub fn absent() -> Self {
        Self {
            exists: false,
            attempts_remaining: 0,
            expires_in_seconds: 0,
        }
    }
}

/// A freshly issued code, handed to the caller for delivery.
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub phone: PhoneNumber,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
}
