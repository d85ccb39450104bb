use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
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
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub bind_addr: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// When false, no camera is opened and the stream endpoint is unavailable.
    pub camera_enabled: bool,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory of labeled reference images (`<identity>.jpg`).
    pub gallery_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite attendance database. Left empty by `Default`;
    /// `load` fills it in under the XDG data directory when unset.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Downsample factor applied before face detection.
    pub detect_scale: f32,
    pub jpeg_quality: u8,
    /// TrueType font used for identity labels on the stream.
    pub label_font: Option<PathBuf>,
    /// Request body limit for submitted images.
    pub max_image_bytes: usize,
    /// Sleep between checks for stream viewers while nobody is watching.
    pub idle_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_enabled: true,
            frame_width: 640,
            frame_height: 480,
            gallery_dir: PathBuf::from("known_faces"),
            model_dir: rollcall_core::default_model_dir(),
            db_path: PathBuf::new(),
            similarity_threshold: 0.40,
            detect_scale: rollcall_core::pipeline::DEFAULT_DETECT_SCALE,
            jpeg_quality: 80,
            label_font: Some(PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")),
            max_image_bytes: 10 * 1024 * 1024,
            idle_poll_ms: 100,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load configuration with `lookup` standing in for the environment.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(&lookup);
        if config.db_path.as_os_str().is_empty() {
            config.db_path = default_db_path(&lookup);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_CAMERA_ENABLED") {
            self.camera_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_LABEL_FONT") {
            self.label_font = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        parse_into(lookup, "ROLLCALL_FRAME_WIDTH", &mut self.frame_width);
        parse_into(lookup, "ROLLCALL_FRAME_HEIGHT", &mut self.frame_height);
        parse_into(lookup, "ROLLCALL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        parse_into(lookup, "ROLLCALL_DETECT_SCALE", &mut self.detect_scale);
        parse_into(lookup, "ROLLCALL_JPEG_QUALITY", &mut self.jpeg_quality);
        parse_into(lookup, "ROLLCALL_MAX_IMAGE_BYTES", &mut self.max_image_bytes);
        parse_into(lookup, "ROLLCALL_IDLE_POLL_MS", &mut self.idle_poll_ms);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                reason: format!("{} is outside [-1, 1]", self.similarity_threshold),
            });
        }
        if !(self.detect_scale > 0.0 && self.detect_scale <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "detect_scale",
                reason: format!("{} is outside (0, 1]", self.detect_scale),
            });
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid {
                key: "jpeg_quality",
                reason: format!("{} is outside 1..=100", self.jpeg_quality),
            });
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/rollcall/attendance.db`, falling back to
/// `$HOME/.local/share`, then `/tmp/.local/share`.
fn default_db_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let data_dir = lookup("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_dir.join("rollcall").join("attendance.db")
}

/// Overwrite `slot` with the parsed value of `key`; unparsable values are
/// logged and ignored.
fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else { return };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}
