use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};

use crate::core::hash::HashFunction;
use crate::core::store::CacheFile;

/// Extensions considered images, compared case-insensitively.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif", "bmp", "tiff", "gif"];

/// Filename prefix of filesystem metadata artifacts (AppleDouble resource forks).
pub const METADATA_PREFIX: &str = "._";

/// Accepted on the command line; grouping still compares hashes for exact equality.
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Seconds used when `--auto` is given without a value.
pub const DEFAULT_AUTO_SECS: u64 = 10;

/// Flush the hash cache after this many files when it has unsaved entries.
pub const DEFAULT_FLUSH_EVERY: usize = 100;

const HASH_CACHE_PREFIX: &str = ".hash_cache_";
const CACHE_EXTENSION: &str = ".json";
const GROUPS_CACHE: &str = ".groups_cache.json";
const GROUPS_META: &str = ".groups_cache.meta";
const REVIEWED_CACHE: &str = ".reviewed_groups.json";
const DELETED_CACHE: &str = ".deleted_images.json";
const DELETION_LOG: &str = "deleted_files.log";
const FALLBACK_PREFIX: &str = ".photosift_cache_";

/// A calendar month, used to demote candidates taken during it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl Default for YearMonth {
    fn default() -> Self {
        Self {
            year: 2023,
            month: 11,
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s:?}"))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in {s:?}"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in {s:?}"))?;
        Self::new(year, month).ok_or_else(|| format!("{s:?} is not a valid month"))
    }
}

/// Location and naming scheme of every cache file for one target directory.
#[derive(Debug, Clone)]
pub struct CachePaths {
    dir: PathBuf,
    fallback_dir: Option<PathBuf>,
}

impl CachePaths {
    /// Caches live in `dir`; writes that hit a permission error fall back to the home directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback_dir: dirs::home_dir(),
        }
    }

    pub fn with_fallback_dir(mut self, fallback_dir: Option<PathBuf>) -> Self {
        self.fallback_dir = fallback_dir;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hash_cache(&self, function: HashFunction) -> CacheFile {
        self.cache_file(
            "hash-cache",
            &format!("{HASH_CACHE_PREFIX}{}{CACHE_EXTENSION}", function.name()),
        )
    }

    pub fn groups(&self) -> CacheFile {
        self.cache_file("group-cache", GROUPS_CACHE)
    }

    pub fn groups_meta(&self) -> CacheFile {
        self.cache_file("group-cache-meta", GROUPS_META)
    }

    pub fn reviewed(&self) -> CacheFile {
        self.cache_file("reviewed-groups", REVIEWED_CACHE)
    }

    pub fn deleted(&self) -> CacheFile {
        self.cache_file("deleted-images", DELETED_CACHE)
    }

    /// Append-only audit trail, one deleted path per line.
    pub fn deletion_log(&self) -> PathBuf {
        self.dir.join(DELETION_LOG)
    }

    /// Hash caches for every hash function that has ever been used in this directory.
    pub fn existing_hash_caches(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(HASH_CACHE_PREFIX) && name.ends_with(CACHE_EXTENSION)
            })
            .map(|entry| entry.path())
            .collect();
        found.sort();
        found
    }

    fn cache_file(&self, kind: &'static str, name: &str) -> CacheFile {
        let primary = self.dir.join(name);
        let fallback = self.fallback_dir.as_ref().map(|home| {
            // Several target directories can share one home directory.
            let tag = blake3::hash(self.dir.to_string_lossy().as_bytes()).to_hex();
            home.join(format!("{FALLBACK_PREFIX}{}_{name}", &tag.as_str()[..12]))
        });
        CacheFile::new(kind, primary, fallback)
    }
}

/// Everything a run needs, threaded explicitly through every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_dir: PathBuf,
    pub import_dir: Option<PathBuf>,
    pub hash_function: HashFunction,
    pub threshold: u32,
    pub auto_timeout: Option<Duration>,
    pub headless: bool,
    pub demote_month: YearMonth,
    pub extensions: Vec<String>,
    pub flush_every: usize,
    pub cache: CachePaths,
}

impl Config {
    pub fn new(target_dir: impl Into<PathBuf>, hash_function: HashFunction) -> Self {
        let target_dir = target_dir.into();
        Self {
            cache: CachePaths::new(&target_dir),
            target_dir,
            import_dir: None,
            hash_function,
            threshold: DEFAULT_THRESHOLD,
            auto_timeout: None,
            headless: false,
            demote_month: YearMonth::default(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }

    pub fn with_import_dir(mut self, import_dir: Option<PathBuf>) -> Self {
        self.import_dir = import_dir;
        self
    }

    /// A zero timeout disables automatic resolution.
    pub fn with_auto_timeout(mut self, secs: Option<u64>) -> Self {
        self.auto_timeout = secs.filter(|s| *s > 0).map(Duration::from_secs);
        self
    }

    pub fn with_cache(mut self, cache: CachePaths) -> Self {
        self.cache = cache;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_parsing() {
        let ym: YearMonth = "2023-11".parse().unwrap();
        assert_eq!(ym, YearMonth::default());
        assert_eq!(ym.to_string(), "2023-11");
        assert!("2023-13".parse::<YearMonth>().is_err());
        assert!("november".parse::<YearMonth>().is_err());
        assert!(ym.contains(NaiveDate::from_ymd_opt(2023, 11, 30).unwrap()));
        assert!(!ym.contains(NaiveDate::from_ymd_opt(2022, 11, 30).unwrap()));
    }

    #[test]
    fn test_cache_naming_scheme() {
        let paths = CachePaths::new("/photos").with_fallback_dir(Some(PathBuf::from("/home/u")));

        assert_eq!(
            paths.hash_cache(HashFunction::Wavelet).path(),
            Path::new("/photos/.hash_cache_whash.json")
        );
        assert_eq!(paths.groups().path(), Path::new("/photos/.groups_cache.json"));
        assert_eq!(paths.deletion_log(), Path::new("/photos/deleted_files.log"));

        let fallback = paths.reviewed().fallback().unwrap().to_path_buf();
        assert!(fallback.starts_with("/home/u"));
        let name = fallback.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".photosift_cache_"));
        assert!(name.ends_with(".reviewed_groups.json"));
    }

    #[test]
    fn test_fallback_names_differ_per_directory() {
        let home = Some(PathBuf::from("/home/u"));
        let a = CachePaths::new("/a").with_fallback_dir(home.clone()).groups();
        let b = CachePaths::new("/b").with_fallback_dir(home).groups();
        assert_ne!(a.fallback(), b.fallback());
    }

    #[test]
    fn test_zero_timeout_disables_auto() {
        let config = Config::new("/photos", HashFunction::Perceptual).with_auto_timeout(Some(0));
        assert!(config.auto_timeout.is_none());
        let config = config.with_auto_timeout(Some(DEFAULT_AUTO_SECS));
        assert_eq!(config.auto_timeout, Some(Duration::from_secs(10)));
    }
}
