//! Verification flow: face match first, then an OTP to the supplied phone.

use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use veriface_core::{MatchResult, QualityReport};
use veriface_otp::{otp_message, IssuedOtp, OtpError, OtpManager, OtpStatus, PhoneNumber, SmsTransport};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What happened to the second factor after a face check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OtpDelivery {
    /// Face check failed or did not match.
    NotIssued,
    Sent { sms_sent: bool, expires_in_seconds: i64 },
    /// A code from an earlier request is still valid.
    AlreadyActive { expires_in_seconds: i64 },
}

/// Outcome of one orchestrated face verification. Returned, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationSession {
    pub id: Uuid,
    pub phone: PhoneNumber,
    pub started_at: DateTime<Utc>,
    pub face: MatchResult,
    pub otp: OtpDelivery,
}

/// A code issued outside the face flow.
#[derive(Debug, Clone, Serialize)]
pub struct OtpIssue {
    pub phone: PhoneNumber,
    pub sms_sent: bool,
    pub expires_in_seconds: i64,
}

pub struct Orchestrator {
    engine: EngineHandle,
    otp: Arc<OtpManager>,
    sms: Arc<dyn SmsTransport>,
}

impl Orchestrator {
    pub fn new(engine: EngineHandle, otp: Arc<OtpManager>, sms: Arc<dyn SmsTransport>) -> Self {
        Self { engine, otp, sms }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn sms_provider(&self) -> &str {
        self.sms.provider_name()
    }

    /// Compare the photos and, on a match, issue and send an OTP.
    ///
    /// The phone is validated before any face work runs.
    pub async fn verify_face(
        &self,
        phone: &str,
        reference: Vec<u8>,
        live: Vec<u8>,
    ) -> Result<VerificationSession, OrchestratorError> {
        let phone = PhoneNumber::parse(phone)?;
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(session = %id, phone = %phone.masked(), "face verification started");

        let face = self.engine.compare(reference, live).await?;

        let otp = if !face.matched {
            OtpDelivery::NotIssued
        } else {
            match self.otp.generate(phone.as_str()) {
                Ok(issued) => OtpDelivery::Sent {
                    sms_sent: self.deliver(&issued).await,
                    expires_in_seconds: issued.expires_in_seconds,
                },
                Err(OtpError::OtpAlreadyActive { expires_in_seconds }) => {
                    OtpDelivery::AlreadyActive { expires_in_seconds }
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            session = %id,
            matched = face.matched,
            confidence = face.confidence,
            code = face.error.as_ref().map(|e| e.code()),
            otp = ?otp,
            "face verification finished"
        );

        Ok(VerificationSession {
            id,
            phone,
            started_at,
            face,
            otp,
        })
    }

    pub async fn validate_quality(&self, image: Vec<u8>) -> Result<QualityReport, EngineError> {
        self.engine.validate_quality(image).await
    }

    pub async fn compare(&self, reference: Vec<u8>, live: Vec<u8>) -> Result<MatchResult, EngineError> {
        self.engine.compare(reference, live).await
    }

    /// Issue a code directly; refuses while one is active.
    pub async fn issue_otp(&self, phone: &str) -> Result<OtpIssue, OtpError> {
        let issued = self.otp.generate(phone)?;
        Ok(self.issue(issued).await)
    }

    /// Replace any existing code with a new one and send it.
    pub async fn resend_otp(&self, phone: &str) -> Result<OtpIssue, OtpError> {
        let issued = self.otp.resend(phone)?;
        Ok(self.issue(issued).await)
    }

    pub fn verify_otp(&self, phone: &str, code: &str) -> Result<(), OtpError> {
        self.otp.verify(phone, code)
    }

    pub fn otp_status(&self, phone: &str) -> Result<OtpStatus, OtpError> {
        self.otp.status(phone)
    }

    pub fn sweep(&self) -> usize {
        self.otp.sweep()
    }

    pub fn active_otps(&self) -> usize {
        self.otp.active_count()
    }

    async fn issue(&self, issued: IssuedOtp) -> OtpIssue {
        let sms_sent = self.deliver(&issued).await;
        OtpIssue {
            phone: issued.phone,
            sms_sent,
            expires_in_seconds: issued.expires_in_seconds,
        }
    }

    /// A failed send leaves the code issued.
    async fn deliver(&self, issued: &IssuedOtp) -> bool {
        let body = otp_message(&issued.code, self.otp.config().ttl);
        let sent = self.sms.send(&issued.phone, &body).await;
        if !sent {
            tracing::warn!(
                phone = %issued.phone.masked(),
                provider = self.sms.provider_name(),
                "OTP issued but SMS delivery failed"
            );
        }
        sent
    }
}
