use chrono::{Duration, Utc};
use std::sync::Arc;
use veriface_otp::{ManualClock, MemoryOtpStore, OtpConfig, OtpError, OtpManager};

const PHONE: &str = "9876543210";

fn manager() -> (OtpManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let manager = OtpManager::with_clock(MemoryOtpStore::new(), OtpConfig::default(), clock.clone());
    (manager, clock)
}

/// A well-formed code that differs from `code`.
fn wrong(code: &str) -> String {
    let first = if code.starts_with('0') { '1' } else { '0' };
    format!("{first}{}", &code[1..])
}

#[test]
fn correct_code_verifies_exactly_once() {
    let (m, _) = manager();
    for phone in ["6000000000", "7123456789", "8999999999", "9876543210"] {
        let issued = m.generate(phone).unwrap();
        assert_eq!(m.verify(phone, &issued.code), Ok(()));
        assert_eq!(m.verify(phone, &issued.code), Err(OtpError::NoOtpFound));
    }
    assert_eq!(m.active_count(), 0);
}

#[test]
fn three_wrong_codes_exhaust_attempts() {
    let (m, _) = manager();
    let issued = m.generate(PHONE).unwrap();
    let bad = wrong(&issued.code);

    assert_eq!(m.verify(PHONE, &bad), Err(OtpError::InvalidOtp { attempts_remaining: 2 }));
    assert_eq!(m.verify(PHONE, &bad), Err(OtpError::InvalidOtp { attempts_remaining: 1 }));
    assert_eq!(m.verify(PHONE, &bad), Err(OtpError::AttemptsExceeded));

    assert!(!m.status(PHONE).unwrap().exists);
    assert_eq!(m.verify(PHONE, &issued.code), Err(OtpError::NoOtpFound));
}

#[test]
fn final_attempt_can_still_succeed() {
    let (m, _) = manager();
    let issued = m.generate(PHONE).unwrap();
    let bad = wrong(&issued.code);

    m.verify(PHONE, &bad).unwrap_err();
    m.verify(PHONE, &bad).unwrap_err();
    assert_eq!(m.status(PHONE).unwrap().attempts_remaining, 1);
    assert_eq!(m.verify(PHONE, &issued.code), Ok(()));
}

#[test]
fn expired_code_fails_and_is_removed() {
    let (m, clock) = manager();
    let issued = m.generate(PHONE).unwrap();

    clock.advance(Duration::minutes(5));
    assert!(m.status(PHONE).unwrap().exists, "still valid at the expiry instant");

    clock.advance(Duration::seconds(1));
    assert_eq!(m.verify(PHONE, &issued.code), Err(OtpError::OtpExpired));
    assert_eq!(m.verify(PHONE, &issued.code), Err(OtpError::NoOtpFound));
}

#[test]
fn expired_code_fails_regardless_of_value() {
    let (m, clock) = manager();
    let issued = m.generate(PHONE).unwrap();
    clock.advance(Duration::minutes(10));
    assert_eq!(m.verify(PHONE, &wrong(&issued.code)), Err(OtpError::OtpExpired));
}

#[test]
fn status_reports_and_lazily_expires() {
    let (m, clock) = manager();
    let absent = m.status(PHONE).unwrap();
    assert!(!absent.exists);

    let issued = m.generate(PHONE).unwrap();
    clock.advance(Duration::seconds(60));
    let status = m.status(PHONE).unwrap();
    assert!(status.exists);
    assert_eq!(status.attempts_remaining, 3);
    assert_eq!(status.expires_in_seconds, 240);

    m.verify(PHONE, &wrong(&issued.code)).unwrap_err();
    assert_eq!(m.status(PHONE).unwrap().attempts_remaining, 2);

    clock.advance(Duration::minutes(5));
    assert!(!m.status(PHONE).unwrap().exists);
    assert_eq!(m.active_count(), 0, "status removes the expired record");
}

#[test]
fn generate_after_expiry_issues_fresh_code() {
    let (m, clock) = manager();
    m.generate(PHONE).unwrap();
    assert!(matches!(m.generate(PHONE), Err(OtpError::OtpAlreadyActive { .. })));

    clock.advance(Duration::minutes(6));
    let fresh = m.generate(PHONE).unwrap();
    assert_eq!(m.verify(PHONE, &fresh.code), Ok(()));
}

#[test]
fn resend_always_replaces_code() {
    let (m, _) = manager();
    let original = m.generate(PHONE).unwrap().code;
    let mut previous = original.clone();
    for _ in 0..20 {
        let resent = m.resend(PHONE).unwrap();
        assert_ne!(resent.code, previous);
        previous = resent.code;
    }
    if original != previous {
        assert_eq!(m.verify(PHONE, &original), Err(OtpError::InvalidOtp { attempts_remaining: 2 }));
    }
    assert_eq!(m.verify(PHONE, &previous), Ok(()));
}

#[test]
fn resend_resets_attempts() {
    let (m, _) = manager();
    let issued = m.generate(PHONE).unwrap();
    m.verify(PHONE, &wrong(&issued.code)).unwrap_err();
    m.verify(PHONE, &wrong(&issued.code)).unwrap_err();

    let resent = m.resend(PHONE).unwrap();
    assert_eq!(m.status(PHONE).unwrap().attempts_remaining, 3);
    assert_eq!(m.verify(PHONE, &resent.code), Ok(()));
}

#[test]
fn resend_without_prior_record_issues() {
    let (m, _) = manager();
    let issued = m.resend(PHONE).unwrap();
    assert_eq!(m.verify(PHONE, &issued.code), Ok(()));
}

#[test]
fn invalid_phone_rejected_everywhere() {
    let (m, _) = manager();
    let bad = "5123456789";
    assert_eq!(m.generate(bad).unwrap_err(), OtpError::InvalidPhone);
    assert_eq!(m.verify(bad, "123456").unwrap_err(), OtpError::InvalidPhone);
    assert_eq!(m.status(bad).unwrap_err(), OtpError::InvalidPhone);
    assert_eq!(m.resend(bad).unwrap_err(), OtpError::InvalidPhone);
    assert_eq!(m.clear(bad).unwrap_err(), OtpError::InvalidPhone);
}

#[test]
fn formatted_numbers_share_one_record() {
    let (m, _) = manager();
    let issued = m.generate("+91 98765-43210").unwrap();
    assert_eq!(issued.phone.as_str(), PHONE);
    assert_eq!(m.verify(PHONE, &issued.code), Ok(()));
}

#[test]
fn sweep_removes_only_expired() {
    let (m, clock) = manager();
    m.generate("9000000001").unwrap();
    m.generate("9000000002").unwrap();
    clock.advance(Duration::minutes(3));
    m.generate("9000000003").unwrap();

    assert_eq!(m.sweep(), 0);
    clock.advance(Duration::minutes(3));
    assert_eq!(m.sweep(), 2);
    assert_eq!(m.active_count(), 1);
    assert!(m.status("9000000003").unwrap().exists);
}

#[test]
fn custom_limits() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = OtpConfig {
        ttl: Duration::seconds(30),
        max_attempts: 1,
        code_length: 4,
    };
    let m = OtpManager::with_clock(MemoryOtpStore::new(), config, clock.clone());

    let issued = m.generate(PHONE).unwrap();
    assert_eq!(issued.code.len(), 4);
    assert_eq!(issued.expires_in_seconds, 30);
    assert_eq!(m.verify(PHONE, &wrong(&issued.code)), Err(OtpError::AttemptsExceeded));
}
