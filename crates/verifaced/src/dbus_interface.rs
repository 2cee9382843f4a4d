use crate::orchestrator::{Orchestrator, OrchestratorError, OtpDelivery};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use veriface_core::MatchResult;
use veriface_otp::OtpError;
use zbus::interface;

pub const BUS_NAME: &str = "org.veriface.Verifier1";
pub const OBJECT_PATH: &str = "/org/veriface/Verifier1";

/// JSON envelope returned by every string-valued method.
///
/// User-actionable failures are `success: false` with a classification code;
/// internal faults are D-Bus errors.
///
/// Face codes: `DECODE_ERROR`, `NO_FACE`, `NO_FACE_REFERENCE`, `NO_FACE_LIVE`,
/// `NO_FACE_BOTH` (neither photo has a face), `MULTIPLE_FACES`,
/// `MULTIPLE_FACES_REFERENCE`, `MULTIPLE_FACES_LIVE`, `INSUFFICIENT_FEATURES`,
/// `COMPARISON_ERROR`, `LOW_QUALITY`, `FACE_MISMATCH`.
///
/// OTP codes: `INVALID_PHONE`, `MALFORMED_OTP`, `NO_OTP_FOUND`, `OTP_EXPIRED`,
/// `ATTEMPTS_EXCEEDED`, `INVALID_OTP`, `OTP_ALREADY_ACTIVE`.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
    pub error: Option<&'static str>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    fn fail(message: impl Into<String>, code: &'static str, data: Option<Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
            error: Some(code),
        }
    }

    fn otp_failure(e: &OtpError) -> Self {
        let data = e
            .attempts_remaining()
            .map(|remaining| json!({ "attempts_remaining": remaining }));
        Self::fail(e.to_string(), e.code(), data)
    }

    fn from_match(result: &MatchResult) -> Self {
        match result.error {
            Some(ref e) => Self::fail(result.message.clone(), e.code(), serde_json::to_value(result).ok()),
            None => Self::ok(result.message.clone(), result),
        }
    }

    fn into_json(self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn internal(e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "internal failure");
    zbus::fdo::Error::Failed(e.to_string())
}

/// D-Bus interface for the identity verification daemon.
///
/// Bus name: org.veriface.Verifier1
/// Object path: /org/veriface/Verifier1
pub struct VerifierService {
    orchestrator: Arc<Orchestrator>,
}

impl VerifierService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[interface(name = "org.veriface.Verifier1")]
impl VerifierService {
    /// Check a single photo for a usable face.
    async fn validate_quality(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "validate_quality requested");
        let report = self
            .orchestrator
            .validate_quality(image)
            .await
            .map_err(internal)?;

        let response = match report.error {
            Some(ref e) => ApiResponse::fail(report.reason.clone(), e.code(), serde_json::to_value(&report).ok()),
            None if report.is_valid => ApiResponse::ok(report.reason.clone(), &report),
            None => ApiResponse::fail(report.reason.clone(), "LOW_QUALITY", serde_json::to_value(&report).ok()),
        };
        response.into_json()
    }

    /// Compare a reference photo with a live photo.
    ///
    /// A mismatch is `success: true` with `matched: false`. When neither photo
    /// has a face the error is the single code `NO_FACE_BOTH`.
    async fn compare(&self, reference: Vec<u8>, live: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(reference = reference.len(), live = live.len(), "compare requested");
        let result = self
            .orchestrator
            .compare(reference, live)
            .await
            .map_err(internal)?;

        ApiResponse::from_match(&result).into_json()
    }

    /// Face comparison followed by OTP issuance on a match.
    async fn verify_face(&self, phone: &str, reference: Vec<u8>, live: Vec<u8>) -> zbus::fdo::Result<String> {
        let session = match self.orchestrator.verify_face(phone, reference, live).await {
            Ok(session) => session,
            Err(OrchestratorError::Otp(e)) => return ApiResponse::otp_failure(&e).into_json(),
            Err(OrchestratorError::Engine(e)) => return Err(internal(e)),
        };

        let response = match (&session.face.error, &session.otp) {
            (Some(e), _) => ApiResponse::fail(session.face.message.clone(), e.code(), serde_json::to_value(&session).ok()),
            (None, OtpDelivery::NotIssued) => ApiResponse::fail(
                session.face.message.clone(),
                "FACE_MISMATCH",
                serde_json::to_value(&session).ok(),
            ),
            (None, OtpDelivery::Sent { .. }) => ApiResponse::ok("Face verified, OTP sent", &session),
            (None, OtpDelivery::AlreadyActive { .. }) => {
                ApiResponse::ok("Face verified, an OTP is already active", &session)
            }
        };
        response.into_json()
    }

    /// Issue an OTP (side effect: SMS send attempt).
    async fn generate_otp(&self, phone: &str) -> zbus::fdo::Result<String> {
        let response = match self.orchestrator.issue_otp(phone).await {
            Ok(issue) => ApiResponse::ok("OTP sent", &issue),
            Err(e) => ApiResponse::otp_failure(&e),
        };
        response.into_json()
    }

    async fn verify_otp(&self, phone: &str, code: &str) -> zbus::fdo::Result<String> {
        let response = match self.orchestrator.verify_otp(phone, code) {
            Ok(()) => ApiResponse::ok("OTP verified", json!({ "verified": true })),
            Err(e) => ApiResponse::otp_failure(&e),
        };
        response.into_json()
    }

    async fn otp_status(&self, phone: &str) -> zbus::fdo::Result<String> {
        let response = match self.orchestrator.otp_status(phone) {
            Ok(status) if status.exists => ApiResponse::ok("OTP active", &status),
            Ok(status) => ApiResponse::ok("No active OTP", &status),
            Err(e) => ApiResponse::otp_failure(&e),
        };
        response.into_json()
    }

    /// Discard any existing OTP and send a new one.
    async fn resend_otp(&self, phone: &str) -> zbus::fdo::Result<String> {
        let response = match self.orchestrator.resend_otp(phone).await {
            Ok(issue) => ApiResponse::ok("OTP resent", &issue),
            Err(e) => ApiResponse::otp_failure(&e),
        };
        response.into_json()
    }

    /// Remove expired OTPs now; returns how many were removed.
    async fn sweep_expired(&self) -> u32 {
        u32::try_from(self.orchestrator.sweep()).unwrap_or(u32::MAX)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self.orchestrator.engine();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workers": engine.workers(),
            "detector": engine.detector_name(),
            "sms_provider": self.orchestrator.sms_provider(),
            "active_otps": self.orchestrator.active_otps(),
        })
        .to_string())
    }
}
