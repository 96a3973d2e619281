use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use crate::core::config::{Config, DEFAULT_THRESHOLD};
use crate::core::group_store::{GroupStore, Reconciliation};
use crate::core::grouper::GroupingReport;
use crate::core::hash::ImageHasher;
use crate::core::hash_cache::HashCache;
use crate::core::integrity::{self, IntegrityReport};
use crate::core::presenter::Presenter;
use crate::core::review::{ReviewEngine, ReviewReport};
use crate::core::scanner::{Mtime, Scanner, Source};

#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub integrity: IntegrityReport,
    pub primary_images: usize,
    pub import_images: usize,
    pub hashed: usize,
    pub reconciliation: Reconciliation,
    pub grouping: GroupingReport,
    pub groups: usize,
    pub review: ReviewReport,
}

/// One full pass over a library: verify caches, scan, hash, group, review.
pub struct Session<P> {
    config: Config,
    presenter: P,
}

impl<P: Presenter> Session<P> {
    pub fn new(config: Config, presenter: P) -> Self {
        Self { config, presenter }
    }

    pub fn run(self) -> Result<SessionSummary> {
        let Session { config, presenter } = self;
        let mut summary = SessionSummary::default();

        if !config.target_dir.is_dir() {
            bail!("{} is not a directory", config.target_dir.display());
        }

        summary.integrity = integrity::verify_cache_files(&config.cache, config.hash_function)
            .context("Cache integrity check failed; nothing was changed")?;

        if config.threshold != DEFAULT_THRESHOLD {
            log::warn!(
                "--threshold {} has no effect: images are grouped by identical hashes",
                config.threshold
            );
        }

        let scanner = Scanner::new(&config.extensions);
        let inventory = benchmark("Scanning", || {
            scanner.scan(&config.target_dir, config.import_dir.as_deref())
        })
        .with_context(|| format!("Failed to scan {}", config.target_dir.display()))?;
        summary.primary_images = inventory.count(Source::Primary);
        summary.import_images = inventory.count(Source::Import);

        let mut store = GroupStore::load(&config.cache, config.hash_function);
        summary.reconciliation = store
            .reconcile(&inventory)
            .context("Failed to update the group cache")?;

        let mut hashes = HashCache::load(
            config.cache.hash_cache(config.hash_function),
            ImageHasher::new(config.hash_function),
        )
        .with_flush_interval(config.flush_every);
        let hashed = benchmark("Hashing", || hashes.hash_all(inventory.files()))
            .context("Failed to save the hash cache")?;
        summary.hashed = hashed.len();

        // Unreadable images would otherwise count as new on every run.
        let hashed_paths: HashSet<&PathBuf> = hashed.iter().map(|h| &h.path).collect();
        let unhashable: Vec<(PathBuf, Mtime)> = inventory
            .files()
            .iter()
            .filter(|f| !hashed_paths.contains(&f.path))
            .map(|f| (f.path.clone(), f.mtime))
            .collect();
        store.state_mut().scanned.extend(unhashable);

        summary.grouping = benchmark("Grouping", || store.group_ungrouped(&hashed))
            .context("Failed to save the group cache")?;
        store
            .write_meta(&inventory)
            .context("Failed to save the group cache marker")?;
        summary.groups = store.groups().len();

        let mut engine = ReviewEngine::new(&config, presenter)?;
        summary.review = engine.run(store.groups(), &inventory)?;

        Ok(summary)
    }
}

fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
