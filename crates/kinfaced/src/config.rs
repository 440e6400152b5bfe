use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration.
///
/// Resolved from defaults, then the TOML file named by `KINFACE_CONFIG`
/// (if set), then `KINFACE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the roster file.
    pub roster_path: PathBuf,
    /// Cosine similarity a face must exceed to be identified.
    pub match_threshold: f32,
    /// Deadline for one enroll/recognize request, queueing included.
    pub request_timeout_secs: u64,
    /// Upper bound on photos per enrollment request.
    pub max_enroll_images: usize,
    /// Upper bound on a request body.
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            model_dir: kinface_core::default_model_dir(),
            roster_path: kinface_core::default_roster_path(),
            match_threshold: kinface_core::DEFAULT_MATCH_THRESHOLD,
            request_timeout_secs: 30,
            max_enroll_images: 10,
            max_body_bytes: 25 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("KINFACE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {path}"))
    }

    /// Override fields from `KINFACE_*` variables found by `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("KINFACE_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("KINFACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KINFACE_ROSTER_PATH") {
            self.roster_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "KINFACE_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "KINFACE_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        override_parsed(&lookup, "KINFACE_MAX_ENROLL_IMAGES", &mut self.max_enroll_images);
        override_parsed(&lookup, "KINFACE_MAX_BODY_BYTES", &mut self.max_body_bytes);
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config value"),
    }
}
