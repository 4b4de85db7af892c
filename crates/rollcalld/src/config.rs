use rollcall_core::decision::{DecisionPolicy, DEFAULT_NEAR_MATCH_THRESHOLD};
use rollcall_core::extractor::{ExtractorConfig, DEFAULT_MIN_CONFIDENCE};
use rollcall_core::scorer::{
    ScoringPolicy, DEFAULT_COSINE_WEIGHT, DEFAULT_EUCLIDEAN_WEIGHT, DEFAULT_MATCH_THRESHOLD,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the SCRFD and ArcFace ONNX models.
    pub model_dir: PathBuf,
    /// SQLite database holding profiles, policies and events.
    pub db_path: PathBuf,
    /// Root directory for uploaded reference and attendance photos.
    pub media_dir: PathBuf,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    pub match_threshold: f32,
    pub near_match_threshold: f32,
    pub euclidean_weight: f32,
    pub cosine_weight: f32,
    /// Detector confidence floor used by the extraction cascade.
    pub detection_confidence: f32,
    /// Budget for image decode and descriptor extraction.
    pub extraction_timeout_ms: u64,
    /// Budget for each profile/policy/event lookup.
    pub lookup_timeout_ms: u64,
    /// Budget for each profile/event write.
    pub write_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            media_dir: data_dir.join("media"),
            system_bus: false,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            near_match_threshold: DEFAULT_NEAR_MATCH_THRESHOLD,
            euclidean_weight: DEFAULT_EUCLIDEAN_WEIGHT,
            cosine_weight: DEFAULT_COSINE_WEIGHT,
            detection_confidence: DEFAULT_MIN_CONFIDENCE,
            extraction_timeout_ms: 15_000,
            lookup_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
        }
    }
}

/// Per-collaborator call budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub extraction: Duration,
    pub lookup: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Config::default().timeouts()
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Override fields from `ROLLCALL_*` variables as returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MEDIA_DIR") {
            self.media_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold)?;
        env_parse(&lookup, "ROLLCALL_NEAR_MATCH_THRESHOLD", &mut self.near_match_threshold)?;
        env_parse(&lookup, "ROLLCALL_EUCLIDEAN_WEIGHT", &mut self.euclidean_weight)?;
        env_parse(&lookup, "ROLLCALL_COSINE_WEIGHT", &mut self.cosine_weight)?;
        env_parse(&lookup, "ROLLCALL_DETECTION_CONFIDENCE", &mut self.detection_confidence)?;
        env_parse(&lookup, "ROLLCALL_EXTRACTION_TIMEOUT_MS", &mut self.extraction_timeout_ms)?;
        env_parse(&lookup, "ROLLCALL_LOOKUP_TIMEOUT_MS", &mut self.lookup_timeout_ms)?;
        env_parse(&lookup, "ROLLCALL_WRITE_TIMEOUT_MS", &mut self.write_timeout_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("match_threshold", self.match_threshold)?;
        unit("near_match_threshold", self.near_match_threshold)?;
        unit("euclidean_weight", self.euclidean_weight)?;
        unit("cosine_weight", self.cosine_weight)?;
        unit("detection_confidence", self.detection_confidence)?;

        if ((self.euclidean_weight + self.cosine_weight) - 1.0).abs() > 1e-3 {
            return Err(ConfigError::Invalid(format!(
                "euclidean_weight + cosine_weight must be 1.0, got {}",
                self.euclidean_weight + self.cosine_weight
            )));
        }
        if self.near_match_threshold > self.match_threshold {
            return Err(ConfigError::Invalid(format!(
                "near_match_threshold ({}) must not exceed match_threshold ({})",
                self.near_match_threshold, self.match_threshold
            )));
        }
        if self.extraction_timeout_ms == 0 || self.lookup_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn scoring_policy(&self) -> ScoringPolicy {
        ScoringPolicy {
            euclidean_weight: self.euclidean_weight,
            cosine_weight: self.cosine_weight,
            match_threshold: self.match_threshold,
        }
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            near_match_threshold: self.near_match_threshold,
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            min_confidence: self.detection_confidence,
            ..ExtractorConfig::default()
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            extraction: Duration::from_millis(self.extraction_timeout_ms),
            lookup: Duration::from_millis(self.lookup_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key}={raw} is not a valid value")))?;
    }
    Ok(())
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
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.match_threshold, 0.5);
        assert_eq!(c.near_match_threshold, 0.45);
        assert_eq!(c.scoring_policy(), ScoringPolicy::default());
        assert_eq!(c.decision_policy(), DecisionPolicy::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(lookup(&[
            ("ROLLCALL_MODEL_DIR", "/opt/models"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.6"),
            ("ROLLCALL_LOOKUP_TIMEOUT_MS", "250"),
            ("ROLLCALL_SYSTEM_BUS", "1"),
        ]))
        .unwrap();
        assert_eq!(c.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(c.match_threshold, 0.6);
        assert_eq!(c.timeouts().lookup, Duration::from_millis(250));
        assert!(c.system_bus);
    }

    #[test]
    fn test_unparsable_env_is_rejected() {
        let mut c = Config::default();
        let err = c
            .apply_env(lookup(&[("ROLLCALL_COSINE_WEIGHT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("ROLLCALL_COSINE_WEIGHT")));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let c = Config {
            euclidean_weight: 0.5,
            cosine_weight: 0.7,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_near_match_above_match_is_rejected() {
        let c = Config {
            near_match_threshold: 0.6,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_toml_file_with_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "db_path = \"/var/lib/rollcall/a.db\"\nnear_match_threshold = 0.4\n",
        )
        .unwrap();

        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/var/lib/rollcall/a.db"));
        assert_eq!(c.near_match_threshold, 0.4);
        assert_eq!(c.match_threshold, DEFAULT_MATCH_THRESHOLD);
        c.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/rollcall.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_extractor_config_uses_detection_confidence() {
        let c = Config {
            detection_confidence: 0.25,
            ..Config::default()
        };
        let ex = c.extractor_config();
        assert_eq!(ex.min_confidence, 0.25);
        assert_eq!(ex.resolutions.len(), 3);
    }
}
