use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use truly_faces_core::ModelPaths;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Tagging configuration: optional TOML file, then `TRULY_*` environment
/// overrides, then defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum suggestions returned per unconfirmed face.
    pub suggestion_limit: usize,
    /// Suggestions below this match confidence are not shown.
    pub min_suggestion_confidence: f32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("truly")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("faces.db"),
            suggestion_limit: 3,
            min_suggestion_confidence: 0.45,
            intra_threads: 2,
        }
    }
}

impl Config {
    /// Load from `TRULY_CONFIG` (if set) and `TRULY_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TRULY_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production).
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("TRULY_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TRULY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("TRULY_SUGGESTION_LIMIT") {
            self.suggestion_limit = parse_value("TRULY_SUGGESTION_LIMIT", v)?;
        }
        if let Some(v) = get("TRULY_MIN_SUGGESTION_CONFIDENCE") {
            self.min_suggestion_confidence = parse_value("TRULY_MIN_SUGGESTION_CONFIDENCE", v)?;
        }
        if let Some(v) = get("TRULY_INTRA_THREADS") {
            self.intra_threads = parse_value("TRULY_INTRA_THREADS", v)?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_suggestion_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "min_suggestion_confidence",
                value: self.min_suggestion_confidence.to_string(),
            });
        }
        if self.intra_threads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "intra_threads",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}
