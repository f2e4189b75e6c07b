use facekeep_core::matcher::{Metric, DEFAULT_MATCH_THRESHOLD};
use facekeep_core::oracle::{OracleShape, DEFAULT_DESCRIPTOR_LEN, DEFAULT_LANDMARK_COUNT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `FACEKEEP_CONFIG`,
/// then `FACEKEEP_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Acquisition tick period in milliseconds.
    pub capture_interval_ms: u64,
    /// Samples collected per label before the record is stored.
    pub required_samples: usize,
    /// Maximum descriptor distance for a positive match.
    pub match_threshold: f32,
    pub metric: Metric,
    /// Descriptor length produced by the oracle.
    pub descriptor_len: usize,
    /// Landmarks per detection produced by the oracle.
    pub landmark_count: usize,
    /// Path to the SQLite label database.
    pub db_path: PathBuf,
    /// JSON-lines detection feed; `-` reads stdin.
    pub feed_path: String,
    /// Overlay size for the drawing surface. Unset means frame size.
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_interval_ms: 100,
            required_samples: 30,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            metric: Metric::Euclidean,
            descriptor_len: DEFAULT_DESCRIPTOR_LEN,
            landmark_count: DEFAULT_LANDMARK_COUNT,
            db_path: facekeep_core::default_db_path(),
            feed_path: "-".to_string(),
            display_width: None,
            display_height: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("FACEKEEP_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        config.capture_interval_ms = env_parse(&lookup, "FACEKEEP_CAPTURE_INTERVAL_MS", config.capture_interval_ms);
        config.required_samples = env_parse(&lookup, "FACEKEEP_REQUIRED_SAMPLES", config.required_samples);
        config.match_threshold = env_parse(&lookup, "FACEKEEP_MATCH_THRESHOLD", config.match_threshold);
        config.metric = env_parse(&lookup, "FACEKEEP_METRIC", config.metric);
        config.descriptor_len = env_parse(&lookup, "FACEKEEP_DESCRIPTOR_LEN", config.descriptor_len);
        config.landmark_count = env_parse(&lookup, "FACEKEEP_LANDMARK_COUNT", config.landmark_count);
        if let Some(path) = lookup("FACEKEEP_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(feed) = lookup("FACEKEEP_FEED_PATH") {
            config.feed_path = feed;
        }
        config.display_width = env_parse_opt(&lookup, "FACEKEEP_DISPLAY_WIDTH", config.display_width);
        config.display_height = env_parse_opt(&lookup, "FACEKEEP_DISPLAY_HEIGHT", config.display_height);

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_interval_ms == 0 {
            return Err(ConfigError::Invalid("capture_interval_ms must be positive".into()));
        }
        if self.required_samples == 0 {
            return Err(ConfigError::Invalid("required_samples must be positive".into()));
        }
        if self.descriptor_len == 0 {
            return Err(ConfigError::Invalid("descriptor_len must be positive".into()));
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        Ok(())
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn oracle_shape(&self) -> OracleShape {
        OracleShape {
            descriptor_len: self.descriptor_len,
            landmark_count: self.landmark_count,
        }
    }

    pub fn display_size(&self) -> Option<(u32, u32)> {
        self.display_width.zip(self.display_height)
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    let Some(raw) = lookup(key) else {
        return current;
    };
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            current
        }
    }
}

fn env_parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: Option<T>,
) -> Option<T> {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable config value");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(lookup(&[])).unwrap();
        assert_eq!(config.capture_interval_ms, 100);
        assert_eq!(config.required_samples, 30);
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.oracle_shape(), OracleShape::default());
        assert_eq!(config.feed_path, "-");
        assert_eq!(config.display_size(), None);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::load(lookup(&[
            ("FACEKEEP_CAPTURE_INTERVAL_MS", "500"),
            ("FACEKEEP_REQUIRED_SAMPLES", "5"),
            ("FACEKEEP_MATCH_THRESHOLD", "0.45"),
            ("FACEKEEP_METRIC", "cosine"),
            ("FACEKEEP_DB_PATH", "/var/lib/facekeep/faces.db"),
            ("FACEKEEP_DISPLAY_WIDTH", "320"),
            ("FACEKEEP_DISPLAY_HEIGHT", "240"),
        ]))
        .unwrap();
        assert_eq!(config.capture_interval(), Duration::from_millis(500));
        assert_eq!(config.required_samples, 5);
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facekeep/faces.db"));
        assert_eq!(config.display_size(), Some((320, 240)));
    }

    #[test]
    fn test_unparseable_env_keeps_default() {
        let config = Config::load(lookup(&[("FACEKEEP_REQUIRED_SAMPLES", "lots")])).unwrap();
        assert_eq!(config.required_samples, 30);
    }

    #[test]
    fn test_rejects_zero_samples() {
        let err = Config::load(lookup(&[("FACEKEEP_REQUIRED_SAMPLES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_negative_threshold() {
        assert!(Config::load(lookup(&[("FACEKEEP_MATCH_THRESHOLD", "-1")])).is_err());
    }

    #[test]
    fn test_toml_file_then_env() {
        let path = std::env::temp_dir().join(format!("facekeep-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "required_samples = 10\nmatch_threshold = 0.5\nmetric = \"cosine\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let config = Config::load(lookup(&[
            ("FACEKEEP_CONFIG", path_str.as_str()),
            ("FACEKEEP_MATCH_THRESHOLD", "0.3"),
        ]))
        .unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.required_samples, 10);
        assert_eq!(config.metric, Metric::Cosine);
        assert!((config.match_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.capture_interval_ms, 100);
    }

    #[test]
    fn test_unparseable_display_env_keeps_file_value() {
        let path = std::env::temp_dir().join(format!("facekeep-display-{}.toml", std::process::id()));
        std::fs::write(&path, "display_width = 640\ndisplay_height = 480\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let config = Config::load(lookup(&[
            ("FACEKEEP_CONFIG", path_str.as_str()),
            ("FACEKEEP_DISPLAY_WIDTH", "wide"),
            ("FACEKEEP_DISPLAY_HEIGHT", "360"),
        ]))
        .unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.display_size(), Some((640, 360)));
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let path = std::env::temp_dir().join(format!("facekeep-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "requiredSamples = 10\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
