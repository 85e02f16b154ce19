//! Enrollment store: identity registry (CSV) plus raw face samples (PNG).

use crate::events::{SessionEvent, SessionObserver};
use crate::session::CancelToken;
use geoattend_core::{FaceDetector, Identity};
use geoattend_hw::{CameraError, FrameSource};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const REGISTRY_HEADER: [&str; 2] = ["identity", "display_name"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry {path} is malformed: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("sample I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("camera unavailable: {0}")]
    Device(#[from] CameraError),
    #[error("failed to store sample: {0}")]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("enrollment cancelled before any sample was captured")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity: Identity,
    pub display_name: String,
}

/// Append-only `identity,display_name` CSV.
///
/// Duplicate identities are kept; lookups return the first row.
#[derive(Debug)]
pub struct EnrollmentRegistry {
    path: PathBuf,
    records: Vec<EnrollmentRecord>,
}

impl EnrollmentRegistry {
    /// Read the registry at `path`. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let records = if path.exists() {
            Self::read_records(&path)?
        } else {
            Vec::new()
        };
        tracing::debug!(path = %path.display(), records = records.len(), "registry loaded");
        Ok(Self { path, records })
    }

    fn read_records(path: &Path) -> Result<Vec<EnrollmentRecord>, RegistryError> {
        let csv_err = |source| RegistryError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;
        reader
            .deserialize()
            .collect::<Result<Vec<EnrollmentRecord>, _>>()
            .map_err(csv_err)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rows, in file order.
    pub fn records(&self) -> &[EnrollmentRecord] {
        &self.records
    }

    pub fn display_name(&self, identity: Identity) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.identity == identity)
            .map(|r| r.display_name.as_str())
    }

    /// Append one row. The header is written when the file is new or empty;
    /// a hand-edited file missing its final newline gets one first.
    pub fn append(&mut self, record: EnrollmentRecord) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        let needs_header = len == 0;
        if len > 0 && !ends_with_newline(&mut file).map_err(io_err)? {
            file.write_all(b"\n").map_err(io_err)?;
        }

        let csv_err = |source| RegistryError::Csv {
            path: self.path.clone(),
            source,
        };
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(REGISTRY_HEADER).map_err(csv_err)?;
        }
        writer.serialize(&record).map_err(csv_err)?;
        writer.flush().map_err(io_err)?;

        tracing::info!(
            identity = %record.identity,
            name = %record.display_name,
            path = %self.path.display(),
            "registry row appended"
        );
        self.records.push(record);
        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Per-identity sample folders under one root:
/// `<root>/<identity>_<name>/<name>_<identity>_<n>.png`.
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, identity: Identity, display_name: &str) -> PathBuf {
        self.root.join(format!("{identity}_{display_name}"))
    }

    /// Save sample number `n` (1-based) as PNG.
    pub fn save(
        &self,
        identity: Identity,
        display_name: &str,
        n: usize,
        sample: &GrayImage,
    ) -> Result<PathBuf, SampleError> {
        let dir = self.dir_for(identity, display_name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{display_name}_{identity}_{n}.png"));
        sample.save(&path)?;
        Ok(path)
    }

    /// Every stored sample, labelled by the identity in its folder name.
    ///
    /// Folders whose name does not start with `<identity>_` and files that
    /// fail to decode are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<(Identity, GrayImage)>, SampleError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut samples = Vec::new();
        for dir in dirs {
            let Some(identity) = folder_identity(&dir) else {
                tracing::warn!(dir = %dir.display(), "skipping folder without identity prefix");
                continue;
            };

            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")))
                .collect();
            files.sort();

            for file in files {
                match image::open(&file) {
                    Ok(img) => samples.push((identity, img.to_luma8())),
                    Err(e) => tracing::warn!(file = %file.display(), error = %e, "skipping unreadable sample"),
                }
            }
        }

        tracing::info!(root = %self.root.display(), samples = samples.len(), "samples loaded");
        Ok(samples)
    }
}

fn folder_identity(dir: &Path) -> Option<Identity> {
    let name = dir.file_name()?.to_str()?;
    let (prefix, _) = name.split_once('_')?;
    prefix.parse().ok()
}

#[derive(Debug, Clone)]
pub struct EnrollmentSettings {
    pub sample_quota: usize,
    pub warmup_frames: usize,
    pub read_retry: Duration,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            sample_quota: 50,
            warmup_frames: 4,
            read_retry: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentSummary {
    pub record: EnrollmentRecord,
    pub samples: usize,
    pub sample_dir: PathBuf,
    pub cancelled: bool,
}

fn validate_enrollment(identity: &str, display_name: &str) -> Result<(Identity, String), EnrollError> {
    let identity = identity.trim();
    let display_name = display_name.trim();
    if identity.is_empty() {
        return Err(EnrollError::Validation("enrollment number is empty".into()));
    }
    if display_name.is_empty() {
        return Err(EnrollError::Validation("name is empty".into()));
    }
    let identity: Identity = identity.parse().map_err(|_| {
        EnrollError::Validation(format!("enrollment number {identity:?} is not a non-negative integer"))
    })?;
    if display_name.contains(['/', '\\']) {
        return Err(EnrollError::Validation(format!(
            "name {display_name:?} must not contain path separators"
        )));
    }
    Ok((identity, display_name.to_string()))
}

/// Captures face samples for one new identity and registers it.
pub struct EnrollmentCapture<'a, D: FaceDetector> {
    settings: EnrollmentSettings,
    registry: &'a mut EnrollmentRegistry,
    samples: &'a SampleStore,
    detector: D,
    observer: &'a mut dyn SessionObserver,
    cancel: CancelToken,
}

impl<'a, D: FaceDetector> EnrollmentCapture<'a, D> {
    pub fn new(
        settings: EnrollmentSettings,
        registry: &'a mut EnrollmentRegistry,
        samples: &'a SampleStore,
        detector: D,
        observer: &'a mut dyn SessionObserver,
        cancel: CancelToken,
    ) -> Self {
        Self {
            settings,
            registry,
            samples,
            detector,
            observer,
            cancel,
        }
    }

    /// Validate, capture up to the sample quota, then append the registry row.
    ///
    /// The camera is opened only after validation and is released before
    /// the registry is touched.
    pub fn enroll<S, C>(
        &mut self,
        identity: &str,
        display_name: &str,
        open_camera: C,
    ) -> Result<EnrollmentSummary, EnrollError>
    where
        S: FrameSource,
        C: FnOnce() -> Result<S, CameraError>,
    {
        let (identity, display_name) = validate_enrollment(identity, display_name)?;
        if self.settings.sample_quota == 0 {
            return Err(EnrollError::Validation("sample quota must be > 0".into()));
        }

        let (count, cancelled) = {
            let mut camera = open_camera()?;
            tracing::info!(%identity, name = %display_name, quota = self.settings.sample_quota, "enrollment started");
            camera.warm_up(self.settings.warmup_frames);
            self.collect(&mut camera, identity, &display_name)?
        };

        if count == 0 {
            tracing::info!(%identity, "enrollment cancelled with no samples");
            return Err(EnrollError::Cancelled);
        }

        let record = EnrollmentRecord {
            identity,
            display_name,
        };
        self.registry.append(record.clone())?;

        Ok(EnrollmentSummary {
            sample_dir: self.samples.dir_for(identity, &record.display_name),
            record,
            samples: count,
            cancelled,
        })
    }

    fn collect<S: FrameSource>(
        &mut self,
        camera: &mut S,
        identity: Identity,
        display_name: &str,
    ) -> Result<(usize, bool), EnrollError> {
        let quota = self.settings.sample_quota;
        let mut count = 0usize;

        while count < quota {
            if self.cancel.is_cancelled() {
                return Ok((count, true));
            }

            let frame = match camera.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "frame read failed; retrying");
                    std::thread::sleep(self.settings.read_retry);
                    continue;
                }
            };

            let faces = match self.detector.detect(&frame.image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "detection failed; skipping frame");
                    continue;
                }
            };

            for face in faces.iter().take(quota - count) {
                count += 1;
                self.samples.save(identity, display_name, count, &face.region)?;
                self.observer.on_event(&SessionEvent::SampleSaved {
                    identity,
                    count,
                    quota,
                });
            }
        }

        Ok((count, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validation() {
        assert!(validate_enrollment("101", "Alice").is_ok());
        assert_eq!(validate_enrollment(" 7 ", " Bob ").unwrap(), (Identity(7), "Bob".to_string()));
        assert!(matches!(validate_enrollment("", "Alice"), Err(EnrollError::Validation(_))));
        assert!(matches!(validate_enrollment("101", "  "), Err(EnrollError::Validation(_))));
        assert!(matches!(validate_enrollment("A-1", "Alice"), Err(EnrollError::Validation(_))));
        assert!(matches!(validate_enrollment("-3", "Alice"), Err(EnrollError::Validation(_))));
        assert!(matches!(validate_enrollment("3", "a/b"), Err(EnrollError::Validation(_))));
    }

    #[test]
    fn test_registry_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
        assert!(registry.records().is_empty());
        assert_eq!(registry.display_name(Identity(1)), None);
    }

    #[test]
    fn test_registry_append_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/registry.csv");

        let mut registry = EnrollmentRegistry::open(&path).unwrap();
        registry
            .append(EnrollmentRecord { identity: Identity(101), display_name: "Alice".into() })
            .unwrap();
        registry
            .append(EnrollmentRecord { identity: Identity(102), display_name: "Bob".into() })
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "identity,display_name\n101,Alice\n102,Bob\n");

        let reloaded = EnrollmentRegistry::open(&path).unwrap();
        assert_eq!(reloaded.records(), registry.records());
        assert_eq!(reloaded.display_name(Identity(102)), Some("Bob"));
    }

    #[test]
    fn test_registry_append_after_missing_final_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.csv");
        fs::write(&path, "identity,display_name\n101,Alice").unwrap();

        let mut registry = EnrollmentRegistry::open(&path).unwrap();
        registry
            .append(EnrollmentRecord { identity: Identity(102), display_name: "Bob".into() })
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "identity,display_name\n101,Alice\n102,Bob\n");
        let reloaded = EnrollmentRegistry::open(&path).unwrap();
        assert_eq!(reloaded.display_name(Identity(101)), Some("Alice"));
        assert_eq!(reloaded.display_name(Identity(102)), Some("Bob"));
    }

    #[test]
    fn test_registry_duplicates_first_wins() {
        let dir = TempDir::new().unwrap();
        let mut registry = EnrollmentRegistry::open(dir.path().join("r.csv")).unwrap();
        registry
            .append(EnrollmentRecord { identity: Identity(5), display_name: "First".into() })
            .unwrap();
        registry
            .append(EnrollmentRecord { identity: Identity(5), display_name: "Second".into() })
            .unwrap();

        assert_eq!(registry.records().len(), 2);
        assert_eq!(registry.display_name(Identity(5)), Some("First"));
    }

    #[test]
    fn test_registry_malformed_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.csv");
        fs::write(&path, "identity,display_name\nabc,Alice\n").unwrap();
        assert!(matches!(EnrollmentRegistry::open(&path), Err(RegistryError::Csv { .. })));
    }

    #[test]
    fn test_sample_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SampleStore::new(dir.path());
        let img = GrayImage::from_pixel(8, 8, image::Luma([90]));

        let path = store.save(Identity(101), "Alice", 1, &img).unwrap();
        assert_eq!(path, dir.path().join("101_Alice").join("Alice_101_1.png"));
        store.save(Identity(102), "Bob", 1, &img).unwrap();
        fs::create_dir_all(dir.path().join("stray")).unwrap();

        let loaded = store.load_all().unwrap();
        let ids: Vec<_> = loaded.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [Identity(101), Identity(102)]);
        assert_eq!(loaded[0].1, img);
    }

    #[test]
    fn test_folder_identity() {
        assert_eq!(folder_identity(Path::new("/x/101_Alice")), Some(Identity(101)));
        assert_eq!(folder_identity(Path::new("/x/101_Mary_Ann")), Some(Identity(101)));
        assert_eq!(folder_identity(Path::new("/x/Alice")), None);
        assert_eq!(folder_identity(Path::new("/x/abc_Alice")), None);
    }
}
