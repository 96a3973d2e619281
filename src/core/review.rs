use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::config::Config;
use crate::core::group_store::{GroupId, SimilarityGroup};
use crate::core::metadata::MonthMarker;
use crate::core::presenter::{Candidate, Decision, Presenter, PresenterError, ReviewGroup};
use crate::core::scanner::{ImageFile, Inventory, Mtime, Source};
use crate::core::store::{make_writable, CacheError, CacheFile};

const MAX_RENAME_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Presenter error: {0}")]
    Presenter(#[from] PresenterError),

    #[error("Invalid demotion month pattern: {0}")]
    Marker(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewReport {
    pub presented: usize,
    pub already_reviewed: usize,
    pub deleted: usize,
    pub failed_deletions: usize,
    pub relocated: usize,
    pub failed_relocations: usize,
}

/// Order candidates for presentation: largest resolution first, ties kept in
/// group order. A pair whose smaller-or-equal member carries the demotion
/// marker puts that member last.
pub fn canonical_order(mut candidates: Vec<Candidate>, marker: &MonthMarker) -> Vec<Candidate> {
    if let [first, second] = candidates.as_slice() {
        let (r0, r1) = (first.file.resolution(), second.file.resolution());
        if marker.matches(&first.file) && r0 <= r1 {
            candidates.swap(0, 1);
            return candidates;
        }
        if marker.matches(&second.file) && r1 <= r0 {
            return candidates;
        }
    }
    candidates.sort_by_key(|c| Reverse(c.file.resolution()));
    candidates
}

/// Move `src` into `dest_dir`, renaming on collision to
/// `<stem>_imported_<n><ext>`. Returns the new path.
pub fn relocate_into(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let file_name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", src.display()),
        )
    })?;

    let mut dest = dest_dir.join(file_name);
    if dest.exists() {
        let stem = src
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        dest = (1..MAX_RENAME_ATTEMPTS)
            .map(|i| dest_dir.join(format!("{stem}_imported_{i}{ext}")))
            .find(|candidate| !candidate.exists())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("no free name for {} in {}", src.display(), dest_dir.display()),
                )
            })?;
    }

    match fs::rename(src, &dest) {
        Ok(()) => Ok(dest),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(src, &dest)?;
            if let Err(e) = fs::remove_file(src) {
                // Leave exactly one copy behind.
                let _ = fs::remove_file(&dest);
                return Err(e);
            }
            Ok(dest)
        }
        Err(e) => Err(e),
    }
}

/// Walks the cached groups, asks the presenter for a decision on each one
/// not yet reviewed, and applies it.
pub struct ReviewEngine<P> {
    presenter: P,
    primary_dir: PathBuf,
    marker: MonthMarker,
    reviewed_file: CacheFile,
    deleted_file: CacheFile,
    log_path: PathBuf,
    reviewed: BTreeSet<GroupId>,
    deleted: BTreeSet<PathBuf>,
}

impl<P: Presenter> ReviewEngine<P> {
    pub fn new(config: &Config, presenter: P) -> Result<Self, ReviewError> {
        let reviewed_file = config.cache.reviewed();
        let deleted_file = config.cache.deleted();
        let reviewed: BTreeSet<GroupId> = reviewed_file.load().unwrap_or_default();
        let deleted: BTreeSet<PathBuf> = deleted_file.load().unwrap_or_default();
        log::info!(
            "{} group(s) already reviewed, {} image(s) previously deleted",
            reviewed.len(),
            deleted.len()
        );

        Ok(Self {
            presenter,
            primary_dir: std::path::absolute(&config.target_dir)
                .unwrap_or_else(|_| config.target_dir.clone()),
            marker: MonthMarker::new(config.demote_month)?,
            reviewed_file,
            deleted_file,
            log_path: config.cache.deletion_log(),
            reviewed,
            deleted,
        })
    }

    pub fn reviewed(&self) -> &BTreeSet<GroupId> {
        &self.reviewed
    }

    pub fn deleted(&self) -> &BTreeSet<PathBuf> {
        &self.deleted
    }

    pub fn into_presenter(self) -> P {
        self.presenter
    }

    pub fn run(
        &mut self,
        groups: &[SimilarityGroup],
        inventory: &Inventory,
    ) -> Result<ReviewReport, ReviewError> {
        let mut report = ReviewReport::default();
        let mut sources = inventory.sources();
        let total = groups.len();

        for (i, group) in groups.iter().enumerate() {
            let id = group.id();
            if self.reviewed.contains(&id) {
                report.already_reviewed += 1;
                continue;
            }

            let candidates: Vec<Candidate> = group
                .members()
                .iter()
                .map(|m| Candidate {
                    file: inventory
                        .get(&m.path)
                        .cloned()
                        .unwrap_or_else(|| detached_file(&m.path)),
                    hash: m.hash.clone(),
                })
                .collect();
            let candidates = canonical_order(candidates, &self.marker);

            let decision = self.presenter.present(&ReviewGroup {
                position: i + 1,
                total,
                candidates: &candidates,
            })?;
            report.presented += 1;
            log::debug!("Group {}/{}: {:?}", i + 1, total, decision);

            let deleted_before = self.deleted.len();
            self.apply(&decision, &candidates, &mut sources, &mut report);
            if self.deleted.len() != deleted_before {
                self.deleted_file.save(&self.deleted)?;
            }

            self.reviewed.insert(id);
            self.reviewed_file.save(&self.reviewed)?;
        }

        self.relocate_leftover_imports(inventory, &mut sources, &mut report);

        log::info!(
            "Review finished: {} presented, {} already reviewed, {} deleted, {} relocated",
            report.presented,
            report.already_reviewed,
            report.deleted,
            report.relocated
        );
        Ok(report)
    }

    fn apply(
        &mut self,
        decision: &Decision,
        candidates: &[Candidate],
        sources: &mut HashMap<PathBuf, Source>,
        report: &mut ReviewReport,
    ) {
        match decision {
            Decision::KeepOne(target) => {
                if !candidates.iter().any(|c| c.path() == target) {
                    log::warn!(
                        "Ignoring decision to keep {}: not in this group",
                        target.display()
                    );
                    return;
                }
                if sources.get(target) == Some(&Source::Import) {
                    self.relocate(target, sources, report);
                }
                for candidate in candidates.iter().filter(|c| c.path() != target) {
                    self.delete(candidate.path(), report);
                }
            }
            Decision::DeleteAll => {
                for candidate in candidates {
                    self.delete(candidate.path(), report);
                }
            }
            Decision::Keep | Decision::NoAction => {}
        }
    }

    fn relocate(
        &self,
        path: &Path,
        sources: &mut HashMap<PathBuf, Source>,
        report: &mut ReviewReport,
    ) {
        match relocate_into(path, &self.primary_dir) {
            Ok(dest) => {
                log::info!("Moved {} -> {}", path.display(), dest.display());
                sources.remove(path);
                sources.insert(dest, Source::Primary);
                report.relocated += 1;
            }
            Err(e) => {
                log::warn!("Error moving {}: {}", path.display(), e);
                report.failed_relocations += 1;
            }
        }
    }

    fn delete(&mut self, path: &Path, report: &mut ReviewReport) {
        let _ = make_writable(path);
        match fs::remove_file(path) {
            Ok(()) => {
                log::info!("Deleted {}", path.display());
                self.append_to_log(path);
                self.deleted.insert(path.to_path_buf());
                report.deleted += 1;
            }
            Err(e) => {
                log::warn!("Error deleting {}: {}", path.display(), e);
                report.failed_deletions += 1;
            }
        }
    }

    fn append_to_log(&self, path: &Path) {
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut log| writeln!(log, "{}", path.display()));
        if let Err(e) = written {
            log::warn!(
                "Could not record deletion in {}: {}",
                self.log_path.display(),
                e
            );
        }
    }

    /// Import files nobody deleted still belong in the library.
    fn relocate_leftover_imports(
        &self,
        inventory: &Inventory,
        sources: &mut HashMap<PathBuf, Source>,
        report: &mut ReviewReport,
    ) {
        for file in inventory.files() {
            let path = file.path.as_path();
            if sources.get(path) != Some(&Source::Import)
                || self.deleted.contains(path)
                || !path.exists()
            {
                continue;
            }
            self.relocate(path, sources, report);
        }
    }
}

fn detached_file(path: &Path) -> ImageFile {
    let mtime = Mtime::of(path).unwrap_or(Mtime { secs: 0, nanos: 0 });
    ImageFile::new(path.to_path_buf(), mtime, Source::Primary)
}
