use facewatch_core::{PipelineConfig, RotationPolicy, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// CLI configuration.
///
/// Resolved in order: built-in defaults, the TOML file named by
/// `FACEWATCH_CONFIG` (if set), `FACEWATCH_*` environment variables, and
/// finally command-line flags applied by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// JSON file holding enrolled identities.
    pub registry_path: PathBuf,
    /// Maximum embedding distance for a positive match.
    pub threshold: f32,
    /// Camera sensor mounting angle in degrees.
    pub sensor_orientation: i32,
    /// Initial device rotation compensation in degrees.
    pub rotation_compensation: i32,
    pub rotation_policy: RotationPolicy,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// Pending requests the recognition worker will queue.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        Self {
            model_dir: facewatch_models::default_model_dir(),
            registry_path: data_dir.join("registry.json"),
            threshold: DEFAULT_THRESHOLD,
            sensor_orientation: 0,
            rotation_compensation: 0,
            rotation_policy: RotationPolicy::SensorOnly,
            detection_confidence: 0.5,
            queue_depth: 1,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEWATCH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
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

    /// Apply `FACEWATCH_*` overrides. Unparseable values are ignored with a warning.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FACEWATCH_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "FACEWATCH_THRESHOLD", &mut self.threshold);
        override_parsed(&lookup, "FACEWATCH_SENSOR_ORIENTATION", &mut self.sensor_orientation);
        override_parsed(&lookup, "FACEWATCH_ROTATION_COMPENSATION", &mut self.rotation_compensation);
        override_parsed(&lookup, "FACEWATCH_ROTATION_POLICY", &mut self.rotation_policy);
        override_parsed(&lookup, "FACEWATCH_DETECTION_CONFIDENCE", &mut self.detection_confidence);
        override_parsed(&lookup, "FACEWATCH_QUEUE_DEPTH", &mut self.queue_depth);
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.threshold,
            sensor_orientation: self.sensor_orientation,
            rotation_compensation: self.rotation_compensation,
            rotation_policy: self.rotation_policy,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facewatch_models::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facewatch_models::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.threshold, 0.8);
        assert_eq!(config.rotation_policy, RotationPolicy::SensorOnly);
        assert!(config.registry_path.ends_with("facewatch/registry.json"));
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            threshold = 0.6
            sensor_orientation = 270
            rotation_policy = "compensated"
            "#,
        )
        .unwrap();
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.sensor_orientation, 270);
        assert_eq!(config.rotation_policy, RotationPolicy::Compensated);
        assert_eq!(config.queue_depth, 1);
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.toml");
        std::fs::write(&path, "threshold = \"high\"").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("facewatch.toml"));

        let missing = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEWATCH_THRESHOLD", "0.55"),
            ("FACEWATCH_ROTATION_POLICY", "compensated"),
            ("FACEWATCH_ROTATION_COMPENSATION", "90"),
            ("FACEWATCH_SENSOR_ORIENTATION", "not-a-number"),
            ("FACEWATCH_MODEL_DIR", "/opt/models"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.threshold, 0.55);
        assert_eq!(config.rotation_policy, RotationPolicy::Compensated);
        assert_eq!(config.rotation_compensation, 90);
        // Bad value leaves the default in place.
        assert_eq!(config.sensor_orientation, 0);
        assert_eq!(config.arcface_model_path(), "/opt/models/w600k_r50.onnx");

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.threshold, 0.55);
        assert_eq!(pipeline.rotation_policy, RotationPolicy::Compensated);
    }
}
