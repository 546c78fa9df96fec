use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TRIGGER_RESET_URL: &str = "https://api.thingspeak.com/update.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("trigger_read_url is not set (config file or ROLLCALL_TRIGGER_READ_URL)")]
    MissingTriggerUrl,
}

/// Daemon configuration.
///
/// Layered as: built-in defaults, then the TOML file named by
/// `ROLLCALL_CONFIG` (if any), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root for the face gallery and attendance ledger.
    pub data_dir: PathBuf,
    /// Euclidean distance below which a face matches an enrolled one.
    ///
    /// The 0.5 default is tight for unit-length ArcFace embeddings (cosine
    /// above 0.875). Calibrate `ROLLCALL_MATCH_THRESHOLD` against enrolled
    /// staff before deploying; cosine 0.40 corresponds to about 1.095.
    pub match_threshold: f32,
    /// Downscale factor applied to live frames before classification.
    pub classify_scale: f32,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Delay between trigger polls.
    pub poll_interval_secs: u64,
    /// Timeout for each trigger HTTP request.
    pub http_timeout_secs: u64,
    /// GET endpoint returning the trigger JSON object.
    pub trigger_read_url: String,
    /// Optional `api_key` query parameter for the read endpoint.
    pub trigger_read_key: Option<String>,
    /// POST endpoint used to clear the trigger.
    pub trigger_reset_url: String,
    /// `api_key` form field sent with the reset.
    pub trigger_write_key: Option<String>,
    /// JSON field carrying the trigger value.
    pub trigger_field: String,
}

/// On-disk shape: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    classify_scale: Option<f32>,
    warmup_frames: Option<usize>,
    poll_interval_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    trigger_read_url: Option<String>,
    trigger_read_key: Option<String>,
    trigger_reset_url: Option<String>,
    trigger_write_key: Option<String>,
    trigger_field: Option<String>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file values and environment lookups over the defaults.
    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, from_file: Option<String>| env(key).or(from_file);

        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(rollcall_core::default_data_dir);
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let trigger_read_url = string("ROLLCALL_TRIGGER_READ_URL", file.trigger_read_url)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingTriggerUrl)?;

        Ok(Self {
            camera_device: string("ROLLCALL_CAMERA_DEVICE", file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            data_dir,
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(rollcall_core::DEFAULT_MATCH_THRESHOLD),
            classify_scale: parsed(&env, "ROLLCALL_CLASSIFY_SCALE")
                .or(file.classify_scale)
                .unwrap_or(rollcall_core::encoder::DEFAULT_CLASSIFY_SCALE),
            warmup_frames: parsed(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            poll_interval_secs: parsed(&env, "ROLLCALL_POLL_INTERVAL_SECS")
                .or(file.poll_interval_secs)
                .unwrap_or(3),
            http_timeout_secs: parsed(&env, "ROLLCALL_HTTP_TIMEOUT_SECS")
                .or(file.http_timeout_secs)
                .unwrap_or(10),
            trigger_read_url,
            trigger_read_key: string("ROLLCALL_TRIGGER_READ_KEY", file.trigger_read_key),
            trigger_reset_url: string("ROLLCALL_TRIGGER_RESET_URL", file.trigger_reset_url)
                .unwrap_or_else(|| DEFAULT_TRIGGER_RESET_URL.to_string()),
            trigger_write_key: string("ROLLCALL_TRIGGER_WRITE_KEY", file.trigger_write_key),
            trigger_field: string("ROLLCALL_TRIGGER_FIELD", file.trigger_field)
                .unwrap_or_else(|| "field1".to_string()),
        })
    }

    /// Defaults rooted at `data_dir`, for tests that need a full config.
    #[cfg(test)]
    pub(crate) fn for_data_dir(data_dir: &Path) -> Self {
        let data_dir = data_dir.display().to_string();
        Self::resolve(FileConfig::default(), |key| match key {
            "ROLLCALL_DATA_DIR" => Some(data_dir.clone()),
            "ROLLCALL_TRIGGER_READ_URL" => Some("http://127.0.0.1:9/trigger.json".to_string()),
            _ => None,
        })
        .expect("test config resolves")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn faces_dir(&self) -> PathBuf {
        rollcall_core::faces_dir(&self.data_dir)
    }

    pub fn attendance_dir(&self) -> PathBuf {
        rollcall_core::attendance_dir(&self.data_dir)
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
