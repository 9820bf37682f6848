use lookout_core::GalleryLayout;
use lookout_hw::SourceSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lookout/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Daemon configuration: TOML file, then `LOOKOUT_*` environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub camera: CameraConfig,
    pub recognition: RecognitionConfig,
    pub greeting: GreetingConfig,
    pub security: SecurityConfig,
    pub dbus: DbusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds `known/`, `pending/`, `backups/` and the template key.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/lookout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    V4l2,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub kind: CameraKind,
    /// V4L2 device path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Image directory for the replay source.
    pub replay_dir: Option<PathBuf>,
    pub replay_interval_ms: u64,
    /// Frames discarded after opening, for camera AGC/AE stabilization.
    pub warmup_frames: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            kind: CameraKind::V4l2,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            replay_dir: None,
            replay_interval_ms: 200,
            warmup_frames: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Maximum Euclidean distance for a match.
    pub tolerance: f32,
    /// Minimum Laplacian variance accepted at enrollment.
    pub blur_threshold: f64,
    /// Sightings of the same unknown face before it is captured.
    pub capture_threshold: u32,
    pub capture_unknown: bool,
    /// Pixels added around a face box when saving an unknown capture, so the
    /// saved image still shows a detectable face.
    pub capture_margin: u32,
    pub model_dir: PathBuf,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            tolerance: 1.09,
            blur_threshold: 100.0,
            capture_threshold: 10,
            capture_unknown: true,
            capture_margin: 50,
            model_dir: PathBuf::from("/usr/share/lookout/models"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    pub enabled: bool,
    pub cooldown_secs: u64,
    /// Default greeting; `{name}` is replaced with the recognized name.
    pub template: String,
    /// Per-name greetings that replace the template.
    pub custom: HashMap<String, String>,
    /// Announced after an unknown face is saved. Empty disables it.
    pub capture_message: String,
    /// TTS program and leading arguments; the greeting is appended. Empty
    /// means greetings are only logged.
    pub command: String,
    pub drain_timeout_secs: u64,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 30,
            template: "Hello {name}!".into(),
            custom: HashMap::new(),
            capture_message: "New face detected and saved".into(),
            command: "espeak-ng".into(),
            drain_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub encrypt_templates: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encrypt_templates: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    pub bus: BusKind,
}

impl Config {
    /// Load from `$LOOKOUT_CONFIG` (or the default path), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("LOOKOUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `LOOKOUT_*` overrides read through `lookup`. Unparsable values
    /// are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LOOKOUT_BASE_DIR") {
            self.storage.base_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOOKOUT_CAMERA_DEVICE") {
            self.camera.device = v;
        }
        if let Some(v) = lookup("LOOKOUT_MODEL_DIR") {
            self.recognition.model_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "LOOKOUT_TOLERANCE") {
            self.recognition.tolerance = v;
        }
        if let Some(v) = lookup("LOOKOUT_GREETING_ENABLED") {
            self.greeting.enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = lookup("LOOKOUT_BUS") {
            match v.as_str() {
                "system" => self.dbus.bus = BusKind::System,
                "session" => self.dbus.bus = BusKind::Session,
                other => tracing::warn!(value = other, "LOOKOUT_BUS must be 'system' or 'session'; ignored"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));
        let r = &self.recognition;
        if !(r.tolerance.is_finite() && r.tolerance > 0.0) {
            return invalid("recognition.tolerance must be a positive number");
        }
        if r.capture_threshold < 1 {
            return invalid("recognition.capture_threshold must be at least 1");
        }
        if !(r.blur_threshold.is_finite() && r.blur_threshold >= 0.0) {
            return invalid("recognition.blur_threshold must not be negative");
        }
        match self.camera.kind {
            CameraKind::V4l2 if self.camera.width == 0 || self.camera.height == 0 => {
                return invalid("camera.width and camera.height must be non-zero");
            }
            CameraKind::Replay if self.camera.replay_dir.is_none() => {
                return invalid("camera.replay_dir is required when camera.kind = \"replay\"");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn layout(&self) -> GalleryLayout {
        GalleryLayout::new(&self.storage.base_dir)
    }

    pub fn source_spec(&self) -> SourceSpec {
        match (self.camera.kind, &self.camera.replay_dir) {
            (CameraKind::Replay, Some(dir)) => SourceSpec::Replay {
                dir: dir.clone(),
                interval: Duration::from_millis(self.camera.replay_interval_ms),
            },
            _ => SourceSpec::V4l2 {
                device: self.camera.device.clone(),
                width: self.camera.width,
                height: self.camera.height,
            },
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.greeting.cooldown_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.greeting.drain_timeout_secs)
    }

    /// Greeting command, or `None` when greetings should only be logged.
    pub fn greeting_command(&self) -> Option<&str> {
        let cmd = self.greeting.command.trim();
        (!cmd.is_empty()).then_some(cmd)
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable override ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.recognition.tolerance, 1.09);
        assert_eq!(config.recognition.capture_threshold, 10);
        assert_eq!(config.recognition.capture_margin, 50);
        assert_eq!(config.greeting.cooldown_secs, 30);
        assert_eq!(config.greeting.capture_message, "New face detected and saved");
        assert_eq!(config.greeting_command(), Some("espeak-ng"));
        assert!(config.security.encrypt_templates);
        assert_eq!(config.dbus.bus, BusKind::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [recognition]
            tolerance = 0.6

            [greeting]
            command = ""
            custom = { Alice = "Good morning, Alice" }

            [camera]
            kind = "replay"
            replay_dir = "/tmp/frames"
            "#,
        )
        .unwrap();
        assert_eq!(config.recognition.tolerance, 0.6);
        assert_eq!(config.recognition.blur_threshold, 100.0);
        assert_eq!(config.greeting_command(), None);
        assert_eq!(config.greeting.custom["Alice"], "Good morning, Alice");
        assert!(matches!(config.source_spec(), SourceSpec::Replay { .. }));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.base_dir, PathBuf::from("/var/lib/lookout"));
    }

    #[test]
    fn test_bad_toml_names_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[recognition\ntolerance = ").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("LOOKOUT_BASE_DIR", "/srv/lookout"),
            ("LOOKOUT_TOLERANCE", "0.45"),
            ("LOOKOUT_GREETING_ENABLED", "0"),
            ("LOOKOUT_BUS", "session"),
            ("LOOKOUT_CAMERA_DEVICE", "/dev/video2"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage.base_dir, PathBuf::from("/srv/lookout"));
        assert_eq!(config.recognition.tolerance, 0.45);
        assert!(!config.greeting.enabled);
        assert_eq!(config.dbus.bus, BusKind::Session);
        assert_eq!(config.camera.device, "/dev/video2");
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "LOOKOUT_TOLERANCE").then(|| "close".to_string()));
        assert_eq!(config.recognition.tolerance, 1.09);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.recognition.tolerance = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.recognition.capture_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.camera.kind = CameraKind::Replay;
        assert!(config.validate().is_err());
    }
}
