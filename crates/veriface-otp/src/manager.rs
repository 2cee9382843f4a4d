use crate::clock::{Clock, SystemClock};
use crate::error::OtpError;
use crate::phone::PhoneNumber;
use crate::record::{IssuedOtp, OtpRecord, OtpStatus};
use crate::store::{MemoryOtpStore, OtpStore};
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use rand::rngs::OsRng;
use rand::Rng;
use std::sync::Arc;

/// Longest code an SMS body is expected to carry.
pub const MAX_CODE_LENGTH: usize = 9;
/// Longest validity window a code may be issued with.
pub const MAX_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub ttl: Duration,
    pub max_attempts: u32,
    /// Digits per code, 1 to [`MAX_CODE_LENGTH`].
    pub code_length: usize,
}

impl OtpConfig {
    /// Reject limits the state machine cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_CODE_LENGTH).contains(&self.code_length) {
            return Err(format!(
                "code_length must be between 1 and {MAX_CODE_LENGTH}, got {}",
                self.code_length
            ));
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be positive".to_string());
        }
        if self.ttl <= Duration::zero() || self.ttl.num_seconds() > MAX_TTL_SECS {
            return Err(format!(
                "ttl must be between 1 and {MAX_TTL_SECS} seconds, got {}",
                self.ttl.num_seconds()
            ));
        }
        Ok(())
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            max_attempts: 3,
            code_length: 6,
        }
    }
}

/// OTP state machine over an [`OtpStore`].
///
/// Per phone: Absent -> Issued -> Verified | Expired | Exhausted. Every
/// terminal transition deletes the record.
pub struct OtpManager<S: OtpStore = MemoryOtpStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: OtpConfig,
}

impl OtpManager<MemoryOtpStore> {
    pub fn in_memory(config: OtpConfig) -> Self {
        Self::new(MemoryOtpStore::new(), config)
    }
}

impl<S: OtpStore> OtpManager<S> {
    pub fn new(store: S, config: OtpConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: OtpConfig, clock: Arc<dyn Clock>) -> Self {
        debug_assert!(config.validate().is_ok(), "invalid OtpConfig: {config:?}");
        Self { store, clock, config }
    }

    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Records currently held, expired or not.
    pub fn active_count(&self) -> usize {
        self.store.len()
    }

    /// Issue a code unless one is still valid for this phone.
    pub fn generate(&self, phone: &str) -> Result<IssuedOtp, OtpError> {
        let phone = PhoneNumber::parse(phone)?;
        let now = self.clock.now();

        let issued = self.store.with_entry(&phone, |slot| {
            if let Some(existing) = slot.as_ref().filter(|r| !r.is_expired(now)) {
                return Err(OtpError::OtpAlreadyActive {
                    expires_in_seconds: existing.expires_in_seconds(now),
                });
            }
            let record = OtpRecord::new(self.new_code(), now, self.config.ttl);
            let issued = self.issued(&phone, &record, now);
            *slot = Some(record);
            Ok(issued)
        })?;

        tracing::info!(phone = %phone.masked(), expires_at = %issued.expires_at, "OTP generated");
        Ok(issued)
    }

    /// Check a submitted code.
    ///
    /// The attempt counter is incremented before comparing, so a correct
    /// final attempt still consumes a slot. A wrong code that leaves no
    /// attempts exhausts the record immediately.
    pub fn verify(&self, phone: &str, code: &str) -> Result<(), OtpError> {
        let phone = PhoneNumber::parse(phone)?;
        let code = code.trim();
        let expected = self.config.code_length;
        if code.len() != expected || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OtpError::MalformedCode { expected });
        }

        let now = self.clock.now();
        let max = self.config.max_attempts;
        let outcome = self.store.with_entry(&phone, |slot| {
            let Some(record) = slot.as_mut() else {
                return Err(OtpError::NoOtpFound);
            };
            if record.is_expired(now) {
                *slot = None;
                return Err(OtpError::OtpExpired);
            }
            if record.attempts >= max {
                *slot = None;
                return Err(OtpError::AttemptsExceeded);
            }

            record.attempts += 1;
            let equal = constant_time_eq(record.code.as_bytes(), code.as_bytes());
            let attempts_remaining = max - record.attempts;
            if equal {
                *slot = None;
                Ok(())
            } else if attempts_remaining == 0 {
                *slot = None;
                Err(OtpError::AttemptsExceeded)
            } else {
                Err(OtpError::InvalidOtp { attempts_remaining })
            }
        });

        match &outcome {
            Ok(()) => tracing::info!(phone = %phone.masked(), "OTP verified"),
            Err(e) => tracing::info!(phone = %phone.masked(), reason = e.code(), "OTP verification failed"),
        }
        outcome
    }

    /// Read-only view; an expired record is removed and reported absent.
    pub fn status(&self, phone: &str) -> Result<OtpStatus, OtpError> {
        let phone = PhoneNumber::parse(phone)?;
        let now = self.clock.now();
        let max = self.config.max_attempts;

        Ok(self.store.with_entry(&phone, |slot| match slot.as_ref() {
            None => OtpStatus::absent(),
            Some(record) if record.is_expired(now) => {
                *slot = None;
                OtpStatus::absent()
            }
            Some(record) => OtpStatus {
                exists: true,
                attempts_remaining: max.saturating_sub(record.attempts),
                expires_in_seconds: record.expires_in_seconds(now),
            },
        }))
    }

    /// Discard any record and issue a code different from the discarded one.
    pub fn resend(&self, phone: &str) -> Result<IssuedOtp, OtpError> {
        let phone = PhoneNumber::parse(phone)?;
        let now = self.clock.now();

        let issued = self.store.with_entry(&phone, |slot| {
            let previous = slot.take().map(|r| r.code);
            let mut code = self.new_code();
            while previous.as_deref() == Some(code.as_str()) {
                code = self.new_code();
            }
            let record = OtpRecord::new(code, now, self.config.ttl);
            let issued = self.issued(&phone, &record, now);
            *slot = Some(record);
            issued
        });

        tracing::info!(phone = %phone.masked(), "OTP resent");
        Ok(issued)
    }

    /// Discard any record; returns whether one existed.
    pub fn clear(&self, phone: &str) -> Result<bool, OtpError> {
        let phone = PhoneNumber::parse(phone)?;
        Ok(self.store.with_entry(&phone, |slot| slot.take().is_some()))
    }

    /// Remove every expired record.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let removed = self.store.remove_where(&mut |record| record.is_expired(now));
        if removed > 0 {
            tracing::info!(removed, "swept expired OTPs");
        }
        removed
    }

    /// Uniform digits drawn one at a time; leading zeros allowed.
    fn new_code(&self) -> String {
        (0..self.config.code_length)
            .map(|_| char::from(b'0' + OsRng.gen_range(0..10u8)))
            .collect()
    }

    fn issued(&self, phone: &PhoneNumber, record: &OtpRecord, now: DateTime<Utc>) -> IssuedOtp {
        IssuedOtp {
            phone: phone.clone(),
            code: record.code.clone(),
            expires_at: record.expires_at,
            expires_in_seconds: record.expires_in_seconds(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_format() {
        let manager = OtpManager::in_memory(OtpConfig::default());
        for _ in 0..200 {
            let code = manager.new_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_config_bounds() {
        assert!(OtpConfig::default().validate().is_ok());

        let too_long = OtpConfig { code_length: 20, ..OtpConfig::default() };
        assert!(too_long.validate().unwrap_err().contains("code_length"));

        let empty = OtpConfig { code_length: 0, ..OtpConfig::default() };
        assert!(empty.validate().is_err());

        let no_attempts = OtpConfig { max_attempts: 0, ..OtpConfig::default() };
        assert!(no_attempts.validate().is_err());

        let day = OtpConfig { ttl: Duration::seconds(MAX_TTL_SECS), ..OtpConfig::default() };
        assert!(day.validate().is_ok());
        let past_day = OtpConfig { ttl: Duration::seconds(MAX_TTL_SECS + 1), ..OtpConfig::default() };
        assert!(past_day.validate().unwrap_err().contains("ttl"));
        let negative = OtpConfig { ttl: Duration::seconds(-1), ..OtpConfig::default() };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_longest_code_format() {
        let config = OtpConfig { code_length: MAX_CODE_LENGTH, ..OtpConfig::default() };
        let manager = OtpManager::in_memory(config);
        let issued = manager.generate("9876543210").unwrap();
        assert_eq!(issued.code.len(), MAX_CODE_LENGTH);
        assert_eq!(manager.verify("9876543210", &issued.code), Ok(()));
    }

    #[test]
    fn test_malformed_code_consumes_no_attempt() {
        let manager = OtpManager::in_memory(OtpConfig::default());
        manager.generate("9876543210").unwrap();

        for bad in ["12345", "1234567", "12a456", ""] {
            assert_eq!(
                manager.verify("9876543210", bad),
                Err(OtpError::MalformedCode { expected: 6 })
            );
        }
        assert_eq!(manager.status("9876543210").unwrap().attempts_remaining, 3);
    }

    #[test]
    fn test_generate_refuses_while_active() {
        let manager = OtpManager::in_memory(OtpConfig::default());
        manager.generate("9876543210").unwrap();
        match manager.generate("+91 98765 43210") {
            Err(OtpError::OtpAlreadyActive { expires_in_seconds }) => {
                assert!(expires_in_seconds > 0 && expires_in_seconds <= 300)
            }
            other => panic!("expected OtpAlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn test_clear() {
        let manager = OtpManager::in_memory(OtpConfig::default());
        assert_eq!(manager.clear("9876543210"), Ok(false));
        manager.generate("9876543210").unwrap();
        assert_eq!(manager.clear("9876543210"), Ok(true));
        assert_eq!(manager.active_count(), 0);
    }
}
