//! veriface-otp: one-time passcode lifecycle.
//!
//! Issues attempt- and time-limited numeric codes keyed by a validated phone
//! number, verifies them, and hands message delivery to an [`SmsTransport`].

pub mod clock;
pub mod error;
pub mod manager;
pub mod phone;
pub mod record;
pub mod sms;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::OtpError;
pub use manager::{OtpConfig, OtpManager, MAX_CODE_LENGTH, MAX_TTL_SECS};
pub use phone::PhoneNumber;
pub use record::{IssuedOtp, OtpRecord, OtpStatus};
pub use sms::{otp_message, LogSmsTransport, SmsTransport};
pub use store::{MemoryOtpStore, OtpStore};
