use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::config::METADATA_PREFIX;
use crate::core::metadata::{self, CaptureTime};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which root a file was discovered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Primary,
    Import,
}

/// File modification time, split so it serializes losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mtime {
    pub secs: i64,
    pub nanos: u32,
}

impl Mtime {
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self {
                        secs: -(d.as_secs() as i64),
                        nanos: 0,
                    }
                } else {
                    Self {
                        secs: -(d.as_secs() as i64) - 1,
                        nanos: 1_000_000_000 - d.subsec_nanos(),
                    }
                }
            }
        }
    }

    pub fn of(path: &Path) -> io::Result<Self> {
        Ok(Self::from_system_time(fs::metadata(path)?.modified()?))
    }
}

/// A discovered image. Resolution and capture time are computed on first use.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub path: PathBuf,
    pub mtime: Mtime,
    pub source: Source,
    resolution: OnceCell<u64>,
    captured: OnceCell<Option<CaptureTime>>,
}

impl ImageFile {
    pub fn new(path: PathBuf, mtime: Mtime, source: Source) -> Self {
        Self {
            path,
            mtime,
            source,
            resolution: OnceCell::new(),
            captured: OnceCell::new(),
        }
    }

    /// Pixel count, 0 when the file cannot be read.
    pub fn resolution(&self) -> u64 {
        *self
            .resolution
            .get_or_init(|| metadata::resolution(&self.path))
    }

    pub fn capture_time(&self) -> Option<&CaptureTime> {
        self.captured
            .get_or_init(|| metadata::capture_time(&self.path, self.mtime))
            .as_ref()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Ordered scan result plus a path lookup.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    files: Vec<ImageFile>,
    index: HashMap<PathBuf, usize>,
}

impl Inventory {
    /// Returns false when the path is already present; the first source wins.
    pub fn push(&mut self, file: ImageFile) -> bool {
        if self.index.contains_key(&file.path) {
            return false;
        }
        self.index.insert(file.path.clone(), self.files.len());
        self.files.push(file);
        true
    }

    pub fn files(&self) -> &[ImageFile] {
        &self.files
    }

    pub fn get(&self, path: &Path) -> Option<&ImageFile> {
        self.index.get(path).map(|&i| &self.files[i])
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    pub fn source_of(&self, path: &Path) -> Option<Source> {
        self.get(path).map(|f| f.source)
    }

    pub fn sources(&self) -> HashMap<PathBuf, Source> {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.source))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn count(&self, source: Source) -> usize {
        self.files.iter().filter(|f| f.source == source).count()
    }

    /// Digest of every (path, mtime) pair, independent of discovery order.
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<_> = self.files.iter().map(|f| (&f.path, f.mtime)).collect();
        entries.sort();
        let mut hasher = blake3::Hasher::new();
        for (path, mtime) in entries {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(&mtime.secs.to_le_bytes());
            hasher.update(&mtime.nanos.to_le_bytes());
            hasher.update(b"\0");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Recursively enumerates candidate images.
pub struct Scanner {
    extensions: HashSet<String>,
}

impl Scanner {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn is_candidate(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if name.starts_with(METADATA_PREFIX) {
            return false;
        }
        path.extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    /// Files under `primary` are tagged primary; import files not already
    /// present by identical path are appended and tagged import.
    pub fn scan(&self, primary: &Path, import: Option<&Path>) -> Result<Inventory, ScanError> {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message("Scanning for images…");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let mut inventory = Inventory::default();
        self.collect(primary, Source::Primary, &mut inventory, &spinner)?;
        if let Some(import) = import {
            self.collect(import, Source::Import, &mut inventory, &spinner)?;
        }

        spinner.finish_with_message(format!(
            "Scan complete: {} primary, {} import",
            inventory.count(Source::Primary),
            inventory.count(Source::Import)
        ));
        Ok(inventory)
    }

    fn collect(
        &self,
        root: &Path,
        source: Source,
        inventory: &mut Inventory,
        spinner: &ProgressBar,
    ) -> Result<(), ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: format!("{} is not a directory", root.display()),
            });
        }
        let root = std::path::absolute(root)?;

        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            spinner.tick();
            if !entry.file_type().is_file() || !self.is_candidate(entry.path()) {
                continue;
            }

            let mtime = match entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
                Ok(t) => Mtime::from_system_time(t),
                Err(e) => {
                    log::warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let file = ImageFile::new(entry.path().to_path_buf(), mtime, source);
            if !inventory.push(file) {
                log::debug!("{} already discovered, keeping first source", entry.path().display());
            }
        }
        Ok(())
    }
}
