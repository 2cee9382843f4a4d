use thiserror::Error;

/// Failure of an OTP operation. Every variant is user-actionable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtpError {
    #[error("invalid phone number: expected 10 digits starting with 6, 7, 8 or 9")]
    InvalidPhone,
    #[error("OTP must be exactly {expected} digits")]
    MalformedCode { expected: usize },
    #[error("no OTP found for this phone number; request a new one")]
    NoOtpFound,
    #[error("OTP has expired; request a new one")]
    OtpExpired,
    #[error("maximum verification attempts exceeded; request a new OTP")]
    AttemptsExceeded,
    #[error("invalid OTP, {attempts_remaining} attempt(s) remaining")]
    InvalidOtp { attempts_remaining: u32 },
    #[error("an OTP is already active for this number, expires in {expires_in_seconds}s")]
    OtpAlreadyActive { expires_in_seconds: i64 },
}

impl OtpError {
    /// Stable classification code exposed to callers.
    pub fn code(&self) -> &'static str {
        match self {
            OtpError::InvalidPhone => "INVALID_PHONE",
            OtpError::MalformedCode { .. } => "MALFORMED_OTP",
            OtpError::NoOtpFound => "NO_OTP_FOUND",
            OtpError::OtpExpired => "OTP_EXPIRED",
            OtpError::AttemptsExceeded => "ATTEMPTS_EXCEEDED",
            OtpError::InvalidOtp { .. } => "INVALID_OTP",
            OtpError::OtpAlreadyActive { .. } => "OTP_ALREADY_ACTIVE",
        }
    }

    /// Retry guidance for a wrong code.
    pub fn attempts_remaining(&self) -> Option<u32> {
        match self {
            OtpError::InvalidOtp { attempts_remaining } => Some(*attempts_remaining),
            OtpError::AttemptsExceeded => Some(0),
            _ => None,
        }
    }
}
