use crate::enrollment::EnrollmentSettings;
use crate::geofence::{AllowedZone, FixedLocation, GeoCoordinate, GeofenceGate, IpLocator, LocationProvider};
use crate::session::SessionSettings;
use geoattend_core::DetectorParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Pipeline configuration: TOML file, then `GEOATTEND_*` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub camera: CameraConfig,
    pub enrollment: EnrollmentConfig,
    pub session: SessionConfig,
    pub geofence: GeofenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Enrollment registry CSV.
    pub registry: PathBuf,
    /// Root of the per-identity sample folders.
    pub training_dir: PathBuf,
    /// Trained LBPH template store (JSON).
    pub template_store: PathBuf,
    /// Haar cascade: OpenCV XML or JSON.
    pub cascade: PathBuf,
    /// Root of the per-subject attendance ledgers.
    pub attendance_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            registry: data_dir.join("registry.csv"),
            training_dir: data_dir.join("samples"),
            template_store: data_dir.join("templates.json"),
            cascade: data_dir.join("haarcascade_frontalface_default.xml"),
            attendance_dir: data_dir.join("attendance"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Opens `/dev/video<index>`.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after opening (auto-exposure settle).
    pub warmup_frames: usize,
    /// Delay before retrying a failed frame read.
    pub read_retry_ms: u64,
    /// Longest wait for a single frame before the read fails.
    pub read_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            warmup_frames: 4,
            read_retry_ms: 10,
            read_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub sample_quota: usize,
    pub detector: DetectorParams,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            sample_quota: 50,
            detector: DetectorParams::ENROLLMENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub window_secs: u64,
    /// LBPH distance; strictly below counts as a match.
    pub threshold: f64,
    pub detector: DetectorParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_secs: 20,
            threshold: 70.0,
            detector: DetectorParams::ATTENDANCE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Applies to every zone.
    pub radius_km: f64,
    /// Checked in order; the first containing zone is reported.
    pub zones: Vec<ZoneConfig>,
    pub locator_url: String,
    pub timeout_secs: u64,
    /// Skip the network lookup and use this coordinate.
    pub fixed_location: Option<GeoCoordinate>,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            radius_km: 10.0,
            zones: vec![
                ZoneConfig {
                    name: "Home".into(),
                    latitude: 12.9719,
                    longitude: 77.5937,
                },
                ZoneConfig {
                    name: "Bommanahalli".into(),
                    latitude: 9.3559,
                    longitude: 77.9246,
                },
            ],
            locator_url: "https://ipinfo.io/json".into(),
            timeout_secs: 5,
            fixed_location: None,
        }
    }
}

impl Config {
    /// Load `path` (or the default location if it exists), then apply
    /// environment overrides and validate.
    ///
    /// An explicitly given path must exist; a missing default file means
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `GEOATTEND_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("GEOATTEND_DATA_DIR") {
            let dir = PathBuf::from(dir);
            self.paths.registry = dir.join("registry.csv");
            self.paths.training_dir = dir.join("samples");
            self.paths.template_store = dir.join("templates.json");
            self.paths.attendance_dir = dir.join("attendance");
        }
        if let Some(cascade) = lookup("GEOATTEND_CASCADE") {
            self.paths.cascade = PathBuf::from(cascade);
        }

        override_parsed(&lookup, "GEOATTEND_CAMERA_INDEX", &mut self.camera.index);
        override_parsed(&lookup, "GEOATTEND_WARMUP_FRAMES", &mut self.camera.warmup_frames);
        override_parsed(&lookup, "GEOATTEND_CAMERA_TIMEOUT_MS", &mut self.camera.read_timeout_ms);
        override_parsed(&lookup, "GEOATTEND_SAMPLE_QUOTA", &mut self.enrollment.sample_quota);
        override_parsed(&lookup, "GEOATTEND_WINDOW_SECS", &mut self.session.window_secs);
        override_parsed(&lookup, "GEOATTEND_MATCH_THRESHOLD", &mut self.session.threshold);
        override_parsed(&lookup, "GEOATTEND_RADIUS_KM", &mut self.geofence.radius_km);
        override_parsed(&lookup, "GEOATTEND_LOCATOR_TIMEOUT_SECS", &mut self.geofence.timeout_secs);

        if let Some(url) = lookup("GEOATTEND_LOCATOR_URL") {
            self.geofence.locator_url = url;
        }
        if let Some(loc) = lookup("GEOATTEND_LOCATION") {
            match loc.parse::<GeoCoordinate>() {
                Ok(coord) => self.geofence.fixed_location = Some(coord),
                Err(e) => tracing::warn!(value = %loc, error = %e, "ignoring GEOATTEND_LOCATION"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.session.threshold > 0.0) {
            return invalid(format!("session.threshold must be > 0, got {}", self.session.threshold));
        }
        if self.session.window_secs == 0 {
            return invalid("session.window_secs must be > 0".into());
        }
        if self.enrollment.sample_quota == 0 {
            return invalid("enrollment.sample_quota must be > 0".into());
        }
        for (section, params) in [
            ("session.detector", &self.session.detector),
            ("enrollment.detector", &self.enrollment.detector),
        ] {
            if !(params.scale_factor > 1.0) {
                return invalid(format!("{section}.scale_factor must be > 1.0, got {}", params.scale_factor));
            }
        }
        if !(self.geofence.radius_km >= 0.0) {
            return invalid(format!("geofence.radius_km must be >= 0, got {}", self.geofence.radius_km));
        }
        if self.geofence.zones.is_empty() {
            return invalid("geofence.zones must not be empty".into());
        }
        for zone in &self.geofence.zones {
            GeoCoordinate::checked(zone.latitude, zone.longitude)
                .map_err(|e| ConfigError::Invalid(format!("zone {:?}: {e}", zone.name)))?;
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("camera.width and camera.height must be > 0".into());
        }
        if self.camera.read_timeout_ms == 0 {
            return invalid("camera.read_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    /// Zones in configured order, each with the global radius.
    pub fn zones(&self) -> Vec<AllowedZone> {
        self.geofence
            .zones
            .iter()
            .map(|z| AllowedZone {
                name: z.name.clone(),
                center: GeoCoordinate::new(z.latitude, z.longitude),
                radius_km: self.geofence.radius_km,
            })
            .collect()
    }

    pub fn geofence_gate(&self) -> GeofenceGate {
        GeofenceGate::new(self.zones())
    }

    /// Fixed location if configured, otherwise the IP locator.
    pub fn location_provider(&self) -> Box<dyn LocationProvider + Send> {
        match self.geofence.fixed_location {
            Some(coord) => Box::new(FixedLocation(coord)),
            None => Box::new(IpLocator::new(
                self.geofence.locator_url.clone(),
                Duration::from_secs(self.geofence.timeout_secs),
            )),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            window: Duration::from_secs(self.session.window_secs),
            threshold: self.session.threshold,
            warmup_frames: self.camera.warmup_frames,
            read_retry: Duration::from_millis(self.camera.read_retry_ms),
        }
    }

    pub fn enrollment_settings(&self) -> EnrollmentSettings {
        EnrollmentSettings {
            sample_quota: self.enrollment.sample_quota,
            warmup_frames: self.camera.warmup_frames,
            read_retry: Duration::from_millis(self.camera.read_retry_ms),
        }
    }

    pub fn camera_read_timeout(&self) -> Duration {
        Duration::from_millis(self.camera.read_timeout_ms)
    }

    pub fn cascade_path(&self) -> String {
        self.paths.cascade.to_string_lossy().into_owned()
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
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
        .join("geoattend")
}

/// `$XDG_CONFIG_HOME/geoattend/config.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("geoattend")
        .join("config.toml")
}
