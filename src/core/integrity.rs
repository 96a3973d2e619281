use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::config::CachePaths;
use crate::core::hash::HashFunction;
use crate::core::hash_cache;
use crate::core::store::{self, make_writable, CacheError};

const SENTINEL_KIND: &str = "sentinel";

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Could not create cache file {path}: {source}")]
    Create { path: PathBuf, source: CacheError },

    #[error("Cache self-test failed for {path}: {reason}")]
    SelfTest { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Files that passed the write/read-back test.
    pub checked: Vec<PathBuf>,
    /// Files whose read-only attribute had to be cleared.
    pub repaired: Vec<PathBuf>,
    /// Files that stay read-only; their writes go to the fallback location.
    pub unwritable: Vec<PathBuf>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sentinel {
    marker: String,
    pid: u32,
}

/// Check that every cache file in the target directory can be written and
/// read back before any destructive work starts.
///
/// The active hash cache is created empty when missing. A file that fails the
/// round trip is deleted and the run must stop.
pub fn verify_cache_files(
    paths: &CachePaths,
    active: HashFunction,
) -> Result<IntegrityReport, IntegrityError> {
    let active_cache = paths.hash_cache(active);
    if !active_cache.path().exists() {
        hash_cache::create_empty(&active_cache).map_err(|source| IntegrityError::Create {
            path: active_cache.path().to_path_buf(),
            source,
        })?;
    }

    let mut candidates: Vec<PathBuf> = vec![
        paths.groups().path().to_path_buf(),
        paths.groups_meta().path().to_path_buf(),
        paths.reviewed().path().to_path_buf(),
        paths.deleted().path().to_path_buf(),
    ];
    candidates.extend(paths.existing_hash_caches());
    candidates.push(active_cache.path().to_path_buf());
    candidates.sort();
    candidates.dedup();

    let mut report = IntegrityReport::default();
    for path in candidates {
        if fs::symlink_metadata(&path).is_err() {
            continue;
        }
        match ensure_writable(&path) {
            Ok(Access::Writable) => {}
            Ok(Access::Repaired) => report.repaired.push(path.clone()),
            Ok(Access::ReadOnly) => {
                log::warn!(
                    "{} is not writable; cache writes will use the fallback location",
                    path.display()
                );
                report.unwritable.push(path);
                continue;
            }
            Err(e) => return Err(fail(&path, format!("cannot open: {e}"))),
        }

        self_test(&path).map_err(|reason| fail(&path, reason))?;
        log::debug!("Cache file {} passed the self-test", path.display());
        report.checked.push(path);
    }

    log::info!(
        "Cache integrity: {} file(s) verified, {} repaired, {} read-only",
        report.checked.len(),
        report.repaired.len(),
        report.unwritable.len()
    );
    Ok(report)
}

enum Access {
    Writable,
    Repaired,
    ReadOnly,
}

fn ensure_writable(path: &Path) -> io::Result<Access> {
    match open_append(path) {
        // Atomic saves need a sibling temp file, not just a writable target.
        Ok(()) if !accepts_new_entries(path) => Ok(Access::ReadOnly),
        Ok(()) => Ok(Access::Writable),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            if make_writable(path).is_ok() && open_append(path).is_ok() {
                log::info!("Cleared read-only attribute on {}", path.display());
                Ok(Access::Repaired)
            } else {
                Ok(Access::ReadOnly)
            }
        }
        Err(e) => Err(e),
    }
}

fn open_append(path: &Path) -> io::Result<()> {
    OpenOptions::new().append(true).open(path).map(|_| ())
}

fn accepts_new_entries(path: &Path) -> bool {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let scratch = parent.join(format!(".tmp-integrity-{}", std::process::id()));
    match OpenOptions::new().write(true).create_new(true).open(&scratch) {
        Ok(_) => {
            let _ = fs::remove_file(&scratch);
            true
        }
        Err(e) => e.kind() != io::ErrorKind::PermissionDenied,
    }
}

/// Write a sentinel, read it back, then put the original bytes back in place
/// with the same kind of write.
fn self_test(path: &Path) -> Result<(), String> {
    let original = fs::read(path).map_err(|e| format!("read failed: {e}"))?;
    let sentinel = Sentinel {
        marker: "photosift".to_string(),
        pid: std::process::id(),
    };
    let bytes = store::encode(SENTINEL_KIND, &sentinel).map_err(|e| e.to_string())?;

    fs::write(path, &bytes).map_err(|e| format!("write failed: {e}"))?;
    let read_back = fs::read(path).map_err(|e| format!("read-back failed: {e}"))?;
    let round_trip: Result<Sentinel, _> = store::decode(SENTINEL_KIND, &read_back);

    fs::write(path, &original).map_err(|e| format!("restore failed: {e}"))?;

    match round_trip {
        Ok(found) if found == sentinel => Ok(()),
        Ok(_) => Err("sentinel mismatch".to_string()),
        Err(e) => Err(format!("sentinel unreadable: {e}")),
    }
}

fn fail(path: &Path, reason: String) -> IntegrityError {
    log::error!("Cache file {} failed verification: {}", path.display(), reason);
    let removed = if path.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = removed {
        log::warn!("Could not remove {}: {}", path.display(), e);
    }
    IntegrityError::SelfTest {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash_cache::HashCache;
    use crate::core::hash::{ImageHasher, PerceptualHash};
    use crate::core::scanner::Mtime;
    use tempfile::TempDir;

    fn paths_in(dir: &Path) -> CachePaths {
        CachePaths::new(dir).with_fallback_dir(None)
    }

    #[test]
    fn test_creates_missing_active_hash_cache() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path());

        let report = verify_cache_files(&paths, HashFunction::Wavelet).unwrap();

        let active = paths.hash_cache(HashFunction::Wavelet);
        assert!(active.path().exists());
        assert_eq!(report.checked, vec![active.path().to_path_buf()]);
        let cache = HashCache::load(active, ImageHasher::new(HashFunction::Wavelet));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_existing_contents_survive_the_self_test() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path());

        let mut cache = HashCache::load(
            paths.hash_cache(HashFunction::Difference),
            ImageHasher::new(HashFunction::Difference),
        );
        cache.insert(PathBuf::from("/p/a.jpg"), Mtime { secs: 7, nanos: 0 }, PerceptualHash::new("h"));
        cache.flush().unwrap();
        let before = fs::read(paths.hash_cache(HashFunction::Difference).path()).unwrap();

        let report = verify_cache_files(&paths, HashFunction::Perceptual).unwrap();
        assert_eq!(report.checked.len(), 2);
        assert_eq!(
            fs::read(paths.hash_cache(HashFunction::Difference).path()).unwrap(),
            before
        );

        let reloaded = HashCache::load(
            paths.hash_cache(HashFunction::Difference),
            ImageHasher::new(HashFunction::Difference),
        );
        assert_eq!(
            reloaded.get(Path::new("/p/a.jpg"), Mtime { secs: 7, nanos: 0 }),
            Some(&PerceptualHash::new("h"))
        );
    }

    #[test]
    fn test_unusable_cache_path_is_fatal_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path());
        fs::create_dir(paths.reviewed().path()).unwrap();

        let err = verify_cache_files(&paths, HashFunction::Perceptual).unwrap_err();

        assert!(matches!(err, IntegrityError::SelfTest { .. }));
        assert!(!paths.reviewed().path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_cache_is_repaired() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path());
        let groups = paths.groups();
        groups.save(&Vec::<String>::new()).unwrap();
        fs::set_permissions(groups.path(), fs::Permissions::from_mode(0o444)).unwrap();

        let report = verify_cache_files(&paths, HashFunction::Perceptual).unwrap();

        // Root ignores mode bits, so only assert the file ends up usable.
        assert!(report.checked.contains(&groups.path().to_path_buf()));
        assert!(report.unwritable.is_empty());
        assert_eq!(groups.load::<Vec<String>>(), Some(Vec::new()));
    }

    #[cfg(unix)]
    #[test]
    fn test_locked_directory_falls_back_without_touching_the_cache() {
        use crate::core::test_support::{lock_dir, unlock_dir};

        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path());
        let file = paths.hash_cache(HashFunction::Difference);
        let mut cache = HashCache::load(file.clone(), ImageHasher::new(HashFunction::Difference));
        cache.insert(PathBuf::from("/p/a.jpg"), Mtime { secs: 7, nanos: 0 }, PerceptualHash::new("h"));
        cache.flush().unwrap();
        let before = fs::read(file.path()).unwrap();
        if !lock_dir(temp_dir.path()) {
            return;
        }

        let result = verify_cache_files(&paths, HashFunction::Difference);
        unlock_dir(temp_dir.path());

        let report = result.unwrap();
        assert_eq!(report.unwritable, vec![file.path().to_path_buf()]);
        assert!(report.checked.is_empty());
        assert_eq!(fs::read(file.path()).unwrap(), before);
    }
}
