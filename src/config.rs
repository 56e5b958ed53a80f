//! Daemon configuration: TOML file, `VIGIL_*` environment overrides, and
//! validation. Resolution order is file, then environment, then defaults
//! for anything still unset.

use anyhow::{anyhow, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::logging::{parse_severity, StyleMode};

const DEFAULT_CONFIG_PATH: &str = "vigil.toml";
const DEFAULT_LOG_LEVEL: &str = "INFO";
const DEFAULT_MQTT_HOST: &str = "127.0.0.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_CLIENT_ID: &str = "vigil";
const DEFAULT_MQTT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_RETAIN_DAYS: u64 = 7;
const DEFAULT_CLEANUP_INTERVAL_HOURS: u64 = 24;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 10;
const MAX_FPS: u32 = 60;
const MAX_RETAIN_DAYS: u64 = 3_650;
const MAX_CLEANUP_INTERVAL_HOURS: u64 = 8_760;

#[derive(Debug, Deserialize, Default)]
struct VigilConfigFile {
    log_level: Option<String>,
    log_style: Option<String>,
    mqtt: Option<MqttConfigFile>,
    cleanup: Option<CleanupConfigFile>,
    capture: Option<CaptureConfigFile>,
    #[serde(default)]
    camera: Vec<CameraConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CleanupConfigFile {
    recordings_dir: Option<PathBuf>,
    retain_days: Option<u64>,
    interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    name: String,
    source: String,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

/// Immutable post-load daemon configuration. The camera set is fixed for
/// the process lifetime.
#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub log_level: LevelFilter,
    pub log_style: StyleMode,
    pub mqtt: MqttSettings,
    pub cleanup: CleanupSettings,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub recordings_dir: PathBuf,
    pub retain_days: u64,
    pub interval_hours: u64,
}

/// Per-camera view: camera-specific overrides resolved against the global
/// `[capture]` defaults.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl VigilConfig {
    /// Load from a TOML file, apply `VIGIL_*` environment overrides,
    /// validate. An explicitly given path must exist; with no path, the
    /// default `vigil.toml` is used when present and built-in defaults
    /// otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_PATH);
                if fallback.exists() {
                    read_config_file(fallback)?
                } else {
                    VigilConfigFile::default()
                }
            }
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigilConfigFile) -> Result<Self> {
        let log_level = parse_severity(file.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL))?;
        let log_style = match file.log_style.as_deref() {
            Some(style) => StyleMode::parse(style)?,
            None => StyleMode::Auto,
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            host: mqtt_file
                .host
                .unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: mqtt_file.port.unwrap_or(DEFAULT_MQTT_PORT),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
            keep_alive_secs: mqtt_file
                .keep_alive_secs
                .unwrap_or(DEFAULT_MQTT_KEEP_ALIVE_SECS),
        };

        let cleanup_file = file.cleanup.unwrap_or_default();
        let cleanup = CleanupSettings {
            recordings_dir: cleanup_file
                .recordings_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR)),
            retain_days: cleanup_file.retain_days.unwrap_or(DEFAULT_RETAIN_DAYS),
            interval_hours: cleanup_file
                .interval_hours
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_HOURS),
        };

        let defaults = file.capture.unwrap_or_default();
        let cameras = file
            .camera
            .into_iter()
            .map(|camera| CameraConfig {
                name: camera.name,
                source: camera.source,
                width: camera.width.or(defaults.width).unwrap_or(DEFAULT_FRAME_WIDTH),
                height: camera
                    .height
                    .or(defaults.height)
                    .unwrap_or(DEFAULT_FRAME_HEIGHT),
                fps: camera.fps.or(defaults.fps).unwrap_or(DEFAULT_FPS),
            })
            .collect();

        Ok(Self {
            log_level,
            log_style,
            mqtt,
            cleanup,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("VIGIL_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = parse_severity(&level)?;
            }
        }
        if let Ok(style) = std::env::var("VIGIL_LOG_STYLE") {
            if !style.trim().is_empty() {
                self.log_style = StyleMode::parse(&style)?;
            }
        }
        if let Ok(host) = std::env::var("VIGIL_MQTT_HOST") {
            if !host.trim().is_empty() {
                self.mqtt.host = host;
            }
        }
        if let Ok(port) = std::env::var("VIGIL_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| anyhow!("VIGIL_MQTT_PORT must be a port number"))?;
        }
        if let Ok(username) = std::env::var("VIGIL_MQTT_USERNAME") {
            if !username.trim().is_empty() {
                self.mqtt.username = Some(username);
            }
        }
        if let Ok(password) = std::env::var("VIGIL_MQTT_PASSWORD") {
            if !password.trim().is_empty() {
                self.mqtt.password = Some(password);
            }
        }
        if let Ok(dir) = std::env::var("VIGIL_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.cleanup.recordings_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!(
                "no cameras configured (at least one [[camera]] entry is required)"
            ));
        }
        let mut names: HashSet<&str> = HashSet::new();
        for camera in &self.cameras {
            validate_camera_name(&camera.name)?;
            if !names.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera name '{}'", camera.name));
            }
            if camera.source.trim().is_empty() {
                return Err(anyhow!("camera '{}' has an empty source", camera.name));
            }
            if camera.fps == 0 || camera.fps > MAX_FPS {
                return Err(anyhow!(
                    "camera '{}': fps must be between 1 and {}",
                    camera.name,
                    MAX_FPS
                ));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!(
                    "camera '{}': width and height must be nonzero",
                    camera.name
                ));
            }
        }

        if self.mqtt.port == 0 {
            return Err(anyhow!("mqtt port must be nonzero"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt client_id must not be empty"));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(anyhow!("mqtt keep_alive_secs must be nonzero"));
        }
        match (&self.mqtt.username, &self.mqtt.password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!(
                    "mqtt username and password must be supplied together"
                ));
            }
            _ => {}
        }

        if self.cleanup.retain_days == 0 || self.cleanup.retain_days > MAX_RETAIN_DAYS {
            return Err(anyhow!(
                "cleanup retain_days must be between 1 and {}",
                MAX_RETAIN_DAYS
            ));
        }
        if self.cleanup.interval_hours == 0
            || self.cleanup.interval_hours > MAX_CLEANUP_INTERVAL_HOURS
        {
            return Err(anyhow!(
                "cleanup interval_hours must be between 1 and {}",
                MAX_CLEANUP_INTERVAL_HOURS
            ));
        }
        Ok(())
    }
}

/// Camera names become MQTT topic segments, log targets, and thread names,
/// so they are restricted to lowercase snake case.
pub fn validate_camera_name(name: &str) -> Result<()> {
    // Compile once for hot paths.
    static CAMERA_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_]{1,32}$").unwrap());

    if !re.is_match(name) {
        return Err(anyhow!(
            "invalid camera name '{}' (must match ^[a-z0-9_]{{1,32}}$)",
            name
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<VigilConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
