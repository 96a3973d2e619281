use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version stamped into every cache envelope.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a {expected} cache, found {found}")]
    Format { expected: String, found: String },

    #[error("Unsupported cache version {found} (expected {SCHEMA_VERSION})")]
    Version { found: u32 },

    #[error("Cache file {path} is not writable and no fallback location accepted it")]
    Unwritable { path: PathBuf },
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format: String,
    version: u32,
    payload: T,
}

/// Wrap `payload` in a versioned envelope tagged with `kind`.
pub fn encode<T: Serialize>(kind: &str, payload: &T) -> Result<Vec<u8>, CacheError> {
    let envelope = Envelope {
        format: kind.to_string(),
        version: SCHEMA_VERSION,
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Unwrap an envelope; a foreign kind or unknown version is rejected before the payload is touched.
pub fn decode<T: DeserializeOwned>(kind: &str, bytes: &[u8]) -> Result<T, CacheError> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(bytes)?;
    if envelope.format != kind {
        return Err(CacheError::Format {
            expected: kind.to_string(),
            found: envelope.format,
        });
    }
    if envelope.version != SCHEMA_VERSION {
        return Err(CacheError::Version {
            found: envelope.version,
        });
    }
    Ok(serde_json::from_value(envelope.payload)?)
}

/// Replace `path` with `bytes` via a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let tmp = parent.join(format!(".tmp-{}-{}-{}", file_name, std::process::id(), nanos));

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Clear the read-only attribute of `path`.
#[cfg(unix)]
pub fn make_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o200);
    fs::set_permissions(path, perms)
}

/// Clear the read-only attribute of `path`.
#[cfg(not(unix))]
pub fn make_writable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

/// One persisted cache: its primary location in the target directory plus an
/// optional fallback used when the primary cannot be written.
#[derive(Debug, Clone)]
pub struct CacheFile {
    kind: &'static str,
    primary: PathBuf,
    fallback: Option<PathBuf>,
}

impl CacheFile {
    pub fn new(kind: &'static str, primary: PathBuf, fallback: Option<PathBuf>) -> Self {
        Self {
            kind,
            primary,
            fallback,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Path> {
        self.fallback.as_deref()
    }

    /// The copy to read: the fallback wins only when it is newer than the primary.
    fn read_path(&self) -> Option<&Path> {
        let primary_time = modified(&self.primary);
        let fallback = self
            .fallback
            .as_deref()
            .and_then(|f| modified(f).map(|t| (f, t)));

        match (primary_time, fallback) {
            (Some(p), Some((f, t))) if t > p => Some(f),
            (Some(_), _) => Some(&self.primary),
            (None, Some((f, _))) => Some(f),
            (None, None) => None,
        }
    }

    /// Load the payload. Missing, unreadable, corrupt, and foreign-version files all yield `None`.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let path = self.read_path()?;
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to read {} cache {}: {}", self.kind, path.display(), e);
                return None;
            }
        };
        match decode(self.kind, &bytes) {
            Ok(payload) => {
                log::debug!("Loaded {} cache from {}", self.kind, path.display());
                Some(payload)
            }
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable {} cache {}: {}",
                    self.kind,
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Persist `payload` and return where it landed.
    ///
    /// A permission failure on the primary first clears its read-only attribute
    /// and retries, then writes the fallback copy. Only when both fail is the
    /// error returned.
    pub fn save<T: Serialize>(&self, payload: &T) -> Result<PathBuf, CacheError> {
        let bytes = encode(self.kind, payload)?;

        match write_atomic(&self.primary, &bytes) {
            Ok(()) => {
                self.discard_fallback();
                return Ok(self.primary.clone());
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                log::warn!("Cannot write to {} (permission denied)", self.primary.display());
            }
            Err(e) => {
                return Err(CacheError::Io {
                    path: self.primary.clone(),
                    source: e,
                });
            }
        }

        if self.primary.exists()
            && make_writable(&self.primary).is_ok()
            && write_atomic(&self.primary, &bytes).is_ok()
        {
            log::info!("Cleared read-only attribute on {}", self.primary.display());
            self.discard_fallback();
            return Ok(self.primary.clone());
        }

        if let Some(fallback) = &self.fallback {
            match write_atomic(fallback, &bytes) {
                Ok(()) => {
                    log::warn!("Cache saved to fallback location: {}", fallback.display());
                    return Ok(fallback.clone());
                }
                Err(e) => {
                    log::error!(
                        "Failed to save cache to fallback location {}: {}",
                        fallback.display(),
                        e
                    );
                }
            }
        }

        Err(CacheError::Unwritable {
            path: self.primary.clone(),
        })
    }

    /// Delete both copies. Missing files are not an error.
    pub fn remove(&self) -> Result<(), CacheError> {
        for path in std::iter::once(&self.primary).chain(self.fallback.iter()) {
            if !path.exists() {
                continue;
            }
            let _ = make_writable(path);
            fs::remove_file(path).map_err(|e| CacheError::Io {
                path: path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn discard_fallback(&self) {
        if let Some(fallback) = &self.fallback {
            if fallback.exists() {
                let _ = fs::remove_file(fallback);
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
