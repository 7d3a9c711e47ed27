use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on frames per capture; one upload carries them all.
const MAX_FRAMES_PER_CAPTURE: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution; the driver may negotiate another.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the recognition service (also serves training).
    pub recognition_url: String,
    /// Base URL of the ID resolution service.
    pub resolution_url: String,
    /// Upper bound on one recognition call.
    pub recognition_timeout_secs: u64,
    pub frames_per_capture: usize,
    pub capture_interval_ms: u64,
    pub jpeg_quality: u8,
    /// Roster TOML imported at startup, if set.
    pub roster_file: Option<PathBuf>,
}

/// Shape of the optional config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    db_path: Option<PathBuf>,
    recognition_url: Option<String>,
    resolution_url: Option<String>,
    recognition_timeout_secs: Option<u64>,
    frames_per_capture: Option<usize>,
    capture_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    roster_file: Option<PathBuf>,
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file values with environment overrides read through `env`.
    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let recognition_url = env("ROLLCALL_RECOGNITION_URL")
            .or(file.recognition_url)
            .unwrap_or_else(|| "http://localhost:8000".to_string());
        let resolution_url = env("ROLLCALL_RESOLUTION_URL")
            .or(file.resolution_url)
            .unwrap_or_else(|| recognition_url.clone());

        let config = Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: env_parse(&env, "ROLLCALL_CAMERA_WIDTH")?
                .or(file.camera_width)
                .unwrap_or(640),
            camera_height: env_parse(&env, "ROLLCALL_CAMERA_HEIGHT")?
                .or(file.camera_height)
                .unwrap_or(480),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            recognition_url,
            resolution_url,
            recognition_timeout_secs: env_parse(&env, "ROLLCALL_RECOGNITION_TIMEOUT_SECS")?
                .or(file.recognition_timeout_secs)
                .unwrap_or(60),
            frames_per_capture: env_parse(&env, "ROLLCALL_FRAMES_PER_CAPTURE")?
                .or(file.frames_per_capture)
                .unwrap_or(8),
            capture_interval_ms: env_parse(&env, "ROLLCALL_CAPTURE_INTERVAL_MS")?
                .or(file.capture_interval_ms)
                .unwrap_or(400),
            jpeg_quality: env_parse(&env, "ROLLCALL_JPEG_QUALITY")?
                .or(file.jpeg_quality)
                .unwrap_or(85),
            roster_file: env("ROLLCALL_ROSTER_FILE").map(PathBuf::from).or(file.roster_file),
        };

        if !(1..=MAX_FRAMES_PER_CAPTURE).contains(&config.frames_per_capture) {
            return Err(ConfigError::InvalidValue {
                key: "frames_per_capture".into(),
                value: config.frames_per_capture.to_string(),
            });
        }
        if !(1..=100).contains(&config.jpeg_quality) {
            return Err(ConfigError::InvalidValue {
                key: "jpeg_quality".into(),
                value: config.jpeg_quality.to_string(),
            });
        }
        Ok(config)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
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

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/prof")])).unwrap();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/prof/.local/share/rollcall/attendance.db")
        );
        assert_eq!(config.recognition_url, "http://localhost:8000");
        assert_eq!(config.resolution_url, config.recognition_url);
        assert_eq!(config.recognition_timeout(), Duration::from_secs(60));
        assert_eq!(config.frames_per_capture, 8);
        assert_eq!(config.capture_interval(), Duration::from_millis(400));
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.roster_file, None);
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            camera_device = "/dev/video4"
            recognition_url = "http://recog:9000"
            frames_per_capture = 5
            "#,
        )
        .unwrap();
        let env = env_of(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("ROLLCALL_FRAMES_PER_CAPTURE", "12"),
            ("ROLLCALL_RESOLUTION_URL", "http://ids:7000"),
        ]);
        let config = Config::resolve(file, env).unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.recognition_url, "http://recog:9000");
        assert_eq!(config.resolution_url, "http://ids:7000");
        assert_eq!(config.frames_per_capture, 12);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/attendance.db"));
    }

    #[test]
    fn test_invalid_env_value_is_error() {
        let err = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_RECOGNITION_TIMEOUT_SECS", "soon")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "ROLLCALL_RECOGNITION_TIMEOUT_SECS"));
    }

    #[test]
    fn test_zero_frames_rejected() {
        let err = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_FRAMES_PER_CAPTURE", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_oversized_frame_count_rejected() {
        let huge = usize::MAX.to_string();
        let err = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_FRAMES_PER_CAPTURE", huge.as_str())]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "frames_per_capture"));

        let config = Config::resolve(FileConfig::default(), env_of(&[("ROLLCALL_FRAMES_PER_CAPTURE", "64")])).unwrap();
        assert_eq!(config.frames_per_capture, 64);
    }

    #[test]
    fn test_read_file_unknown_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera = \"/dev/video1\"").unwrap();
        assert!(matches!(read_file(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_read_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "roster_file = \"/etc/rollcall/roster.toml\"\njpeg_quality = 70").unwrap();
        let parsed = read_file(file.path()).unwrap();
        let config = Config::resolve(parsed, env_of(&[])).unwrap();
        assert_eq!(config.roster_file, Some(PathBuf::from("/etc/rollcall/roster.toml")));
        assert_eq!(config.jpeg_quality, 70);
    }
}
