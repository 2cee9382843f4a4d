//! Client side of `org.veriface.Verifier1`.

#[zbus::proxy(
    interface = "org.veriface.Verifier1",
    default_service = "org.veriface.Verifier1",
    default_path = "/org/veriface/Verifier1"
)]
pub trait Verifier {
    fn validate_quality(&self, image: &[u8]) -> zbus::Result<String>;

    fn compare(&self, reference: &[u8], live: &[u8]) -> zbus::Result<String>;

    fn verify_face(&self, phone: &str, reference: &[u8], live: &[u8]) -> zbus::Result<String>;

    fn generate_otp(&self, phone: &str) -> zbus::Result<String>;

    fn verify_otp(&self, phone: &str, code: &str) -> zbus::Result<String>;

    fn otp_status(&self, phone: &str) -> zbus::Result<String>;

    fn resend_otp(&self, phone: &str) -> zbus::Result<String>;

    fn sweep_expired(&self) -> zbus::Result<u32>;

    fn status(&self) -> zbus::Result<String>;
}
