use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::core::hash::{HashFunction, ImageHasher, PerceptualHash};
use crate::core::scanner::{ImageFile, Mtime};
use crate::core::store::{CacheError, CacheFile};

#[derive(Debug, Serialize, Deserialize)]
struct HashRecord {
    path: PathBuf,
    mtime: Mtime,
    hash: PerceptualHash,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HashCachePayload {
    entries: Vec<HashRecord>,
}

/// Write an empty hash cache, creating the file if needed.
pub fn create_empty(file: &CacheFile) -> Result<PathBuf, CacheError> {
    file.save(&HashCachePayload::default())
}

/// Persistent `(path, mtime) -> hash` map for one hash function.
///
/// A changed modification time is a different key, so edited files are
/// rehashed and their old entries are simply left behind.
pub struct HashCache {
    file: CacheFile,
    hasher: ImageHasher,
    entries: HashMap<(PathBuf, Mtime), PerceptualHash>,
    dirty: bool,
    flush_every: usize,
}

impl HashCache {
    /// Load from disk; an unreadable or corrupt file starts an empty cache.
    pub fn load(file: CacheFile, hasher: ImageHasher) -> Self {
        let payload: HashCachePayload = file.load().unwrap_or_default();
        let entries = payload
            .entries
            .into_iter()
            .map(|r| ((r.path, r.mtime), r.hash))
            .collect::<HashMap<_, _>>();
        log::info!(
            "Loaded {} cached {} hashes from {}",
            entries.len(),
            hasher.function(),
            file.path().display()
        );
        Self {
            file,
            hasher,
            entries,
            dirty: false,
            flush_every: crate::core::config::DEFAULT_FLUSH_EVERY,
        }
    }

    pub fn with_flush_interval(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    pub fn function(&self) -> HashFunction {
        self.hasher.function()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, path: &Path, mtime: Mtime) -> Option<&PerceptualHash> {
        self.entries.get(&(path.to_path_buf(), mtime))
    }

    pub fn insert(&mut self, path: PathBuf, mtime: Mtime, hash: PerceptualHash) {
        self.entries.insert((path, mtime), hash);
        self.dirty = true;
    }

    /// Cached hash for the key, computing and storing it on a miss.
    /// Unreadable or malformed images yield `None` and are reported.
    pub fn hash(&mut self, path: &Path, mtime: Mtime) -> Option<PerceptualHash> {
        if let Some(hash) = self.get(path, mtime) {
            return Some(hash.clone());
        }
        match self.hasher.hash_file(path) {
            Ok(hash) => {
                self.insert(path.to_path_buf(), mtime, hash.clone());
                Some(hash)
            }
            Err(e) => {
                log::warn!("Error hashing {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist if there are unsaved entries.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        let mut records: Vec<HashRecord> = self
            .entries
            .iter()
            .map(|((path, mtime), hash)| HashRecord {
                path: path.clone(),
                mtime: *mtime,
                hash: hash.clone(),
            })
            .collect();
        records.sort_by(|a, b| (&a.path, a.mtime).cmp(&(&b.path, b.mtime)));

        let written = self.file.save(&HashCachePayload { entries: records })?;
        log::debug!("Flushed {} hash entries to {}", self.entries.len(), written.display());
        self.dirty = false;
        Ok(())
    }

    /// Hash every file, flushing after each block of `flush_every` files and
    /// once more at the end. Files that cannot be hashed are left out.
    pub fn hash_all(&mut self, files: &[ImageFile]) -> Result<Vec<HashedImage>, CacheError> {
        self.hash_all_with(files, |_, _| {})
    }

    /// `hash_all` with a callback run after each file and its flush check.
    pub(crate) fn hash_all_with<F>(
        &mut self,
        files: &[ImageFile],
        mut on_file: F,
    ) -> Result<Vec<HashedImage>, CacheError>
    where
        F: FnMut(usize, &Self),
    {
        let pb = ProgressBar::new(files.len() as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg} [{elapsed_precise}]")
        {
            pb.set_style(style);
        }
        pb.set_message("Hashing images");

        let mut hashes = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            if let Some(hash) = self.hash(&file.path, file.mtime) {
                hashes.push(HashedImage {
                    path: file.path.clone(),
                    mtime: file.mtime,
                    hash,
                });
            }
            pb.inc(1);
            if (i + 1) % self.flush_every == 0 {
                self.flush()?;
            }
            on_file(i, &*self);
        }
        self.flush()?;
        pb.finish_with_message("Hashing complete");

        Ok(hashes)
    }
}

/// An image together with the modification time its hash was taken at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedImage {
    pub path: PathBuf,
    pub mtime: Mtime,
    pub hash: PerceptualHash,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CachePaths;
    use crate::core::scanner::Source;
    use crate::core::test_support::{create_pattern_image, Pattern};
    use std::fs;
    use tempfile::TempDir;

    fn cache_for(dir: &Path) -> HashCache {
        let paths = CachePaths::new(dir).with_fallback_dir(None);
        HashCache::load(
            paths.hash_cache(HashFunction::Average),
            ImageHasher::new(HashFunction::Average),
        )
    }

    #[test]
    fn test_miss_computes_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("a.png");
        create_pattern_image(&image, Pattern::LeftHalf, 64, 64);
        let mtime = Mtime::of(&image).unwrap();

        let mut cache = cache_for(temp_dir.path());
        let hash = cache.hash(&image, mtime).unwrap();
        assert!(cache.is_dirty());
        cache.flush().unwrap();
        assert!(!cache.is_dirty());

        let reloaded = cache_for(temp_dir.path());
        assert_eq!(reloaded.get(&image, mtime), Some(&hash));
    }

    #[test]
    fn test_hit_does_not_touch_the_image() {
        let temp_dir = TempDir::new().unwrap();
        let ghost = temp_dir.path().join("ghost.png");
        let mtime = Mtime { secs: 1, nanos: 0 };

        let mut cache = cache_for(temp_dir.path());
        cache.insert(ghost.clone(), mtime, PerceptualHash::new("cached"));
        cache.flush().unwrap();

        let mut cache = cache_for(temp_dir.path());
        assert_eq!(cache.hash(&ghost, mtime), Some(PerceptualHash::new("cached")));
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_changed_mtime_rehashes_and_keeps_stale_entry() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("c.png");
        create_pattern_image(&image, Pattern::TopHalf, 64, 64);
        let t1 = Mtime { secs: 100, nanos: 0 };
        let t2 = Mtime::of(&image).unwrap();

        let mut cache = cache_for(temp_dir.path());
        cache.insert(image.clone(), t1, PerceptualHash::new("stale"));

        let fresh = cache.hash(&image, t2).unwrap();
        assert_ne!(fresh, PerceptualHash::new("stale"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&image, t1), Some(&PerceptualHash::new("stale")));
        assert_eq!(cache.get(&image, t2), Some(&fresh));
    }

    #[test]
    fn test_unreadable_image_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("broken.png");
        fs::write(&broken, b"garbage").unwrap();

        let mut cache = cache_for(temp_dir.path());
        assert!(cache.hash(&broken, Mtime::of(&broken).unwrap()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_cache_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let paths = CachePaths::new(temp_dir.path()).with_fallback_dir(None);
        fs::write(paths.hash_cache(HashFunction::Average).path(), b"{ truncated").unwrap();

        let cache = cache_for(temp_dir.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hash_all_skips_failures_and_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..5 {
            let path = temp_dir.path().join(format!("img_{i}.png"));
            create_pattern_image(&path, Pattern::Checker, 32, 32);
            files.push(ImageFile::new(path.clone(), Mtime::of(&path).unwrap(), Source::Primary));
        }
        let broken = temp_dir.path().join("broken.png");
        fs::write(&broken, b"garbage").unwrap();
        files.push(ImageFile::new(broken.clone(), Mtime::of(&broken).unwrap(), Source::Primary));

        let mut cache = cache_for(temp_dir.path()).with_flush_interval(2);
        let hashes = cache.hash_all(&files).unwrap();

        assert_eq!(hashes.len(), 5);
        assert!(hashes.iter().all(|h| h.path != broken));
        assert!(!cache.is_dirty());
        assert_eq!(cache_for(temp_dir.path()).len(), 5);
    }

    #[test]
    fn test_hash_all_persists_progress_before_finishing() {
        let temp_dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..5 {
            let path = temp_dir.path().join(format!("img_{i}.png"));
            create_pattern_image(&path, Pattern::TopHalf, 32, 32);
            files.push(ImageFile::new(path.clone(), Mtime::of(&path).unwrap(), Source::Primary));
        }

        let mut on_disk = Vec::new();
        let mut cache = cache_for(temp_dir.path()).with_flush_interval(2);
        cache
            .hash_all_with(&files, |i, cache| {
                on_disk.push((i, cache.len(), cache_for(temp_dir.path()).len()));
            })
            .unwrap();

        // Flushed after the 2nd and 4th files, not after the 1st, 3rd or 5th.
        assert_eq!(
            on_disk,
            vec![(0, 1, 0), (1, 2, 2), (2, 3, 2), (3, 4, 4), (4, 5, 4)]
        );
        assert_eq!(cache_for(temp_dir.path()).len(), 5);
    }
}
