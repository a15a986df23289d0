use anyhow::{anyhow, Context};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-large";
pub const DEFAULT_FALLBACK_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";
pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub primary: String,
    pub fallback: String,
}

#[derive(Clone)]
pub struct ArtifactConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub cache_dir: PathBuf,
    pub allow_remote: bool,
}

// keep the token out of logs
impl fmt::Debug for ArtifactConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("cache_dir", &self.cache_dir)
            .field("allow_remote", &self.allow_remote)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub model: ModelConfig,
    pub artifacts: ArtifactConfig,
    pub enable_metrics: bool,
    /// only meaningful with `enable_metrics`, reports `edgeDensity` as 0 when off
    pub enable_edge_detection: bool,
    pub fetch_timeout: Duration,
    pub inference_timeout: Duration,
    pub max_image_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from a key lookup. Empty values count as unset,
    /// values that do not parse are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let cache_dir = match get("MODEL_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("caption-server")
                .join("models"),
        };

        Ok(Self {
            port: parse_var(&get, "PORT", DEFAULT_PORT)?,
            model: ModelConfig {
                primary: get("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
                fallback: get("FALLBACK_MODEL_ID")
                    .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL_ID.to_string()),
            },
            artifacts: ArtifactConfig {
                endpoint: get("HF_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_HF_ENDPOINT.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                token: get("HF_TOKEN"),
                cache_dir,
                allow_remote: parse_bool(&get, "ALLOW_REMOTE_MODELS", true)?,
            },
            enable_metrics: parse_bool(&get, "ENABLE_METRICS", true)?,
            enable_edge_detection: parse_bool(&get, "ENABLE_EDGE_DETECTION", true)?,
            fetch_timeout: Duration::from_secs(parse_positive(
                &get,
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            inference_timeout: Duration::from_secs(parse_positive(
                &get,
                "INFERENCE_TIMEOUT_SECS",
                DEFAULT_INFERENCE_TIMEOUT_SECS,
            )?),
            max_image_bytes: parse_positive(&get, "MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
        })
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("invalid value {:?} for {}", raw, key)),
        None => Ok(default),
    }
}

fn parse_positive<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let value = parse_var(get, key, default)?;
    if value <= T::default() {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(value)
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid value {:?} for {}, expected a boolean", raw, key)),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.model.primary, DEFAULT_MODEL_ID);
        assert_eq!(config.model.fallback, DEFAULT_FALLBACK_MODEL_ID);
        assert_eq!(config.artifacts.endpoint, DEFAULT_HF_ENDPOINT);
        assert!(config.artifacts.token.is_none());
        assert!(config.artifacts.allow_remote);
        assert!(config.enable_metrics);
        assert!(config.enable_edge_detection);
        assert_eq!(config.fetch_timeout, Duration::from_secs(15));
        assert_eq!(config.inference_timeout, Duration::from_secs(120));
        assert_eq!(config.max_image_bytes, 20 * 1024 * 1024);
        assert!(config.artifacts.cache_dir.ends_with("caption-server/models"));
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("MODEL_ID", "acme/blip-tiny"),
            ("FALLBACK_MODEL_ID", "acme/blip-nano"),
            ("HF_ENDPOINT", "http://mirror.local/"),
            ("HF_TOKEN", "secret"),
            ("MODEL_CACHE_DIR", "/tmp/models"),
            ("ALLOW_REMOTE_MODELS", "no"),
            ("ENABLE_METRICS", "FALSE"),
            ("ENABLE_EDGE_DETECTION", "off"),
            ("FETCH_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.model.primary, "acme/blip-tiny");
        assert_eq!(config.model.fallback, "acme/blip-nano");
        assert_eq!(config.artifacts.endpoint, "http://mirror.local");
        assert_eq!(config.artifacts.token.as_deref(), Some("secret"));
        assert_eq!(config.artifacts.cache_dir, PathBuf::from("/tmp/models"));
        assert!(!config.artifacts.allow_remote);
        assert!(!config.enable_metrics);
        assert!(!config.enable_edge_detection);
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = config_from(&[("PORT", ""), ("MODEL_ID", "  ")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.model.primary, DEFAULT_MODEL_ID);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("PORT", "http")]).is_err());
        assert!(config_from(&[("PORT", "70000")]).is_err());
        assert!(config_from(&[("ENABLE_METRICS", "maybe")]).is_err());
        assert!(config_from(&[("INFERENCE_TIMEOUT_SECS", "0")]).is_err());
        assert!(config_from(&[("MAX_IMAGE_BYTES", "-1")]).is_err());
    }

    #[test]
    fn token_is_redacted_in_debug_output() {
        let config = config_from(&[("HF_TOKEN", "hf_very_secret")]).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hf_very_secret"));
        assert!(printed.contains("<redacted>"));
    }
}
