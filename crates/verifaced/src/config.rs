use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use veriface_core::{MatcherConfig, MultiFacePolicy};
use veriface_otp::{OtpConfig, MAX_TTL_SECS};

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus '{other}' (expected session|system)")),
        }
    }
}

/// Daemon configuration.
///
/// Defaults, overridden by an optional TOML file named by `VERIFACE_CONFIG`,
/// overridden by `VERIFACE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusKind,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum confidence percent for a face match.
    pub match_threshold: f32,
    /// Ratio-test factor.
    pub ratio: f32,
    /// Minimum face area (px²) accepted by quality validation.
    pub min_face_area: f32,
    pub multi_face: MultiFacePolicy,
    /// Face engine worker threads, each with its own detector session.
    pub engine_workers: usize,
    /// Timeout for one face operation; 0 disables it.
    pub compare_timeout_secs: u64,
    pub otp_ttl_secs: u64,
    pub otp_max_attempts: u32,
    pub sweep_interval_secs: u64,
    pub sms_provider: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusKind::Session,
            model_dir: veriface_core::default_model_dir(),
            match_threshold: 15.0,
            ratio: 0.7,
            min_face_area: 1000.0,
            multi_face: MultiFacePolicy::Reject,
            engine_workers: 2,
            compare_timeout_secs: 30,
            otp_ttl_secs: 300,
            otp_max_attempts: 3,
            sweep_interval_secs: 60,
            sms_provider: "log".into(),
        }
    }
}

/// Keys accepted in the TOML file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    bus: Option<BusKind>,
    model_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    ratio: Option<f32>,
    min_face_area: Option<f32>,
    multi_face: Option<MultiFacePolicy>,
    engine_workers: Option<usize>,
    compare_timeout_secs: Option<u64>,
    otp_ttl_secs: Option<u64>,
    otp_max_attempts: Option<u32>,
    sweep_interval_secs: Option<u64>,
    sms_provider: Option<String>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        let file = match std::env::var("VERIFACE_CONFIG") {
            Ok(path) => Some(
                std::fs::read_to_string(&path).with_context(|| format!("reading config file {path}"))?,
            ),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer a TOML document and an environment lookup over the defaults.
    pub fn from_sources(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(contents) = file {
            let f: ConfigFile = toml::from_str(contents).context("parsing config file")?;
            cfg.bus = f.bus.unwrap_or(cfg.bus);
            cfg.model_dir = f.model_dir.unwrap_or(cfg.model_dir);
            cfg.match_threshold = f.match_threshold.unwrap_or(cfg.match_threshold);
            cfg.ratio = f.ratio.unwrap_or(cfg.ratio);
            cfg.min_face_area = f.min_face_area.unwrap_or(cfg.min_face_area);
            cfg.multi_face = f.multi_face.unwrap_or(cfg.multi_face);
            cfg.engine_workers = f.engine_workers.unwrap_or(cfg.engine_workers);
            cfg.compare_timeout_secs = f.compare_timeout_secs.unwrap_or(cfg.compare_timeout_secs);
            cfg.otp_ttl_secs = f.otp_ttl_secs.unwrap_or(cfg.otp_ttl_secs);
            cfg.otp_max_attempts = f.otp_max_attempts.unwrap_or(cfg.otp_max_attempts);
            cfg.sweep_interval_secs = f.sweep_interval_secs.unwrap_or(cfg.sweep_interval_secs);
            cfg.sms_provider = f.sms_provider.unwrap_or(cfg.sms_provider);
        }

        cfg.bus = env_parse(&env, "VERIFACE_BUS", cfg.bus);
        if let Some(dir) = env("VERIFACE_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(dir);
        }
        cfg.match_threshold = env_parse(&env, "VERIFACE_MATCH_THRESHOLD", cfg.match_threshold);
        cfg.ratio = env_parse(&env, "VERIFACE_RATIO", cfg.ratio);
        cfg.min_face_area = env_parse(&env, "VERIFACE_MIN_FACE_AREA", cfg.min_face_area);
        cfg.multi_face = env_parse(&env, "VERIFACE_MULTI_FACE", cfg.multi_face);
        cfg.engine_workers = env_parse(&env, "VERIFACE_ENGINE_WORKERS", cfg.engine_workers);
        cfg.compare_timeout_secs = env_parse(&env, "VERIFACE_COMPARE_TIMEOUT_SECS", cfg.compare_timeout_secs);
        cfg.otp_ttl_secs = env_parse(&env, "VERIFACE_OTP_TTL_SECS", cfg.otp_ttl_secs);
        cfg.otp_max_attempts = env_parse(&env, "VERIFACE_OTP_MAX_ATTEMPTS", cfg.otp_max_attempts);
        cfg.sweep_interval_secs = env_parse(&env, "VERIFACE_SWEEP_INTERVAL_SECS", cfg.sweep_interval_secs);
        if let Some(provider) = env("VERIFACE_SMS_PROVIDER") {
            cfg.sms_provider = provider.trim().to_ascii_lowercase();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.engine_workers == 0 {
            bail!("engine_workers must be at least 1");
        }
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            bail!("ratio must be in (0, 1], got {}", self.ratio);
        }
        if !(0.0..=100.0).contains(&self.match_threshold) {
            bail!("match_threshold must be a percentage, got {}", self.match_threshold);
        }
        if self.otp_ttl_secs == 0 || self.otp_max_attempts == 0 {
            bail!("otp_ttl_secs and otp_max_attempts must be positive");
        }
        if self.otp_ttl_secs > MAX_TTL_SECS as u64 {
            bail!("otp_ttl_secs must be at most {MAX_TTL_SECS}, got {}", self.otp_ttl_secs);
        }
        self.otp_config().validate().map_err(anyhow::Error::msg)?;
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if self.sms_provider != "log" {
            bail!("unsupported SMS provider '{}' (available: log)", self.sms_provider);
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            match_threshold_percent: self.match_threshold,
            ratio: self.ratio,
            min_face_area: self.min_face_area,
            multi_face: self.multi_face,
            ..MatcherConfig::default()
        }
    }

    /// TTL is capped at [`MAX_TTL_SECS`]; `validate()` rejects anything longer.
    pub fn otp_config(&self) -> OtpConfig {
        let ttl_secs = i64::try_from(self.otp_ttl_secs).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS);
        OtpConfig {
            ttl: chrono::Duration::seconds(ttl_secs),
            max_attempts: self.otp_max_attempts,
            ..OtpConfig::default()
        }
    }

    pub fn compare_timeout(&self) -> Option<Duration> {
        (self.compare_timeout_secs > 0).then(|| Duration::from_secs(self.compare_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse an env value, keeping `current` when unset or unparsable.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match env(key) {
        None => current,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable config value");
                current
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_sources(None, lookup(&[])).unwrap();
        assert_eq!(cfg.bus, BusKind::Session);
        assert_eq!(cfg.match_threshold, 15.0);
        assert_eq!(cfg.multi_face, MultiFacePolicy::Reject);
        assert_eq!(cfg.otp_config().ttl, chrono::Duration::minutes(5));
        assert_eq!(cfg.compare_timeout(), Some(Duration::from_secs(30)));
        assert!(cfg.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = r#"
            bus = "system"
            match_threshold = 20.0
            multi_face = "largest"
            engine_workers = 4
        "#;
        let env = lookup(&[("VERIFACE_MATCH_THRESHOLD", "25"), ("VERIFACE_OTP_TTL_SECS", "120")]);
        let cfg = Config::from_sources(Some(file), env).unwrap();

        assert_eq!(cfg.bus, BusKind::System);
        assert_eq!(cfg.match_threshold, 25.0);
        assert_eq!(cfg.multi_face, MultiFacePolicy::Largest);
        assert_eq!(cfg.engine_workers, 4);
        assert_eq!(cfg.otp_ttl_secs, 120);
        assert_eq!(cfg.matcher_config().match_threshold_percent, 25.0);
    }

    #[test]
    fn test_bad_env_value_keeps_previous() {
        let cfg = Config::from_sources(None, lookup(&[("VERIFACE_ENGINE_WORKERS", "many")])).unwrap();
        assert_eq!(cfg.engine_workers, 2);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let cfg = Config::from_sources(None, lookup(&[("VERIFACE_COMPARE_TIMEOUT_SECS", "0")])).unwrap();
        assert_eq!(cfg.compare_timeout(), None);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(Config::from_sources(None, lookup(&[("VERIFACE_ENGINE_WORKERS", "0")])).is_err());
        assert!(Config::from_sources(None, lookup(&[("VERIFACE_RATIO", "1.5")])).is_err());
        assert!(Config::from_sources(Some("unknown_key = 1"), lookup(&[])).is_err());
        assert!(Config::from_sources(None, lookup(&[("VERIFACE_SMS_PROVIDER", "carrier-pigeon")])).is_err());
    }

    #[test]
    fn test_rejects_oversized_ttl() {
        let err = Config::from_sources(None, lookup(&[("VERIFACE_OTP_TTL_SECS", "100000000000000000")]))
            .unwrap_err();
        assert!(err.to_string().contains("otp_ttl_secs"), "{err}");
        assert!(Config::from_sources(Some("otp_ttl_secs = 86401"), lookup(&[])).is_err());

        let cfg = Config::from_sources(None, lookup(&[("VERIFACE_OTP_TTL_SECS", "86400")])).unwrap();
        assert_eq!(cfg.otp_config().ttl, chrono::Duration::days(1));
    }

    #[test]
    fn test_otp_config_never_panics() {
        let cfg = Config {
            otp_ttl_secs: u64::MAX,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.otp_config().ttl.num_seconds(), MAX_TTL_SECS);
    }
}
