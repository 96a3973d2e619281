use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::CachePaths;
use crate::core::grouper::{self, GroupingReport};
use crate::core::hash::{HashFunction, PerceptualHash};
use crate::core::hash_cache::HashedImage;
use crate::core::scanner::{ImageFile, Inventory, Mtime};
use crate::core::store::{CacheError, CacheFile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub path: PathBuf,
    pub hash: PerceptualHash,
}

/// Review-tracking identity of a group: its member paths, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Vec<PathBuf>);

impl GroupId {
    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }
}

/// Two or more images sharing one hash string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimilarityGroup {
    members: Vec<GroupMember>,
}

impl SimilarityGroup {
    pub fn new(members: Vec<GroupMember>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.members.iter().any(|m| m.path == path)
    }

    pub fn id(&self) -> GroupId {
        let mut paths: Vec<PathBuf> = self.members.iter().map(|m| m.path.clone()).collect();
        paths.sort();
        GroupId(paths)
    }
}

/// Groups formed so far plus the bookkeeping that keeps grouping incremental.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupCacheState {
    pub groups: Vec<SimilarityGroup>,
    /// Paths already assigned to a group; never re-seeded.
    pub visited: BTreeSet<PathBuf>,
    /// Paths the grouper has processed, grouped or not, with the
    /// modification time they had then.
    #[serde(default)]
    pub scanned: BTreeMap<PathBuf, Mtime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_members: usize,
    pub dropped_groups: usize,
}

impl PruneReport {
    pub fn changed(&self) -> bool {
        self.removed_members > 0 || self.dropped_groups > 0
    }
}

impl GroupCacheState {
    pub fn grouped_paths(&self) -> HashSet<PathBuf> {
        self.groups
            .iter()
            .flat_map(|g| g.members().iter().map(|m| m.path.clone()))
            .collect()
    }

    /// Drop members for which `exists` is false, and groups left with one member or none.
    pub fn prune(&mut self, exists: impl Fn(&Path) -> bool) -> PruneReport {
        let mut report = PruneReport::default();
        let mut kept = Vec::with_capacity(self.groups.len());

        for group in self.groups.drain(..) {
            let before = group.len();
            let members: Vec<GroupMember> = group
                .members
                .into_iter()
                .filter(|m| exists(&m.path))
                .collect();
            report.removed_members += before - members.len();
            if members.len() > 1 {
                kept.push(SimilarityGroup::new(members));
            } else {
                report.dropped_groups += 1;
            }
        }
        self.groups = kept;

        // Survivors of a dropped group are no longer assigned anywhere.
        let grouped = self.grouped_paths();
        self.visited.retain(|p| grouped.contains(p));
        self.scanned.retain(|p, _| exists(p));
        report
    }

    /// Files that are neither in a cached group nor processed at their
    /// current modification time.
    pub fn unseen<'a>(&self, on_disk: impl IntoIterator<Item = &'a ImageFile>) -> Vec<&'a Path> {
        let grouped = self.grouped_paths();
        on_disk
            .into_iter()
            .filter(|f| !grouped.contains(&f.path) && self.scanned.get(&f.path) != Some(&f.mtime))
            .map(|f| f.path.as_path())
            .collect()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.visited.clear();
        self.scanned.clear();
    }
}

/// Auxiliary marker written next to the group cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCacheMeta {
    pub hash_function: HashFunction,
    pub groups: usize,
    pub inventory_fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub pruned: PruneReport,
    /// The inventory matches the one recorded after the last grouping pass.
    pub unchanged: bool,
    pub new_files: usize,
    pub reset: bool,
}

/// Owns the persisted group cache for one target directory.
pub struct GroupStore {
    file: CacheFile,
    meta_file: CacheFile,
    hash_function: HashFunction,
    state: GroupCacheState,
    previous_meta: Option<GroupCacheMeta>,
}

impl GroupStore {
    /// Load the cached state; a corrupt file, or one built with another hash function, starts empty.
    pub fn load(paths: &CachePaths, hash_function: HashFunction) -> Self {
        let file = paths.groups();
        let meta_file = paths.groups_meta();
        let previous_meta: Option<GroupCacheMeta> = meta_file.load();

        let mut state: GroupCacheState = file.load().unwrap_or_default();
        if let Some(meta) = &previous_meta {
            if meta.hash_function != hash_function {
                log::warn!(
                    "Group cache was built with {}, not {}; regrouping",
                    meta.hash_function,
                    hash_function
                );
                state.clear();
            }
        }
        log::info!(
            "Group cache: {} groups, {} visited",
            state.groups.len(),
            state.visited.len()
        );

        Self {
            file,
            meta_file,
            hash_function,
            state,
            previous_meta,
        }
    }

    pub fn state(&self) -> &GroupCacheState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut GroupCacheState {
        &mut self.state
    }

    pub fn groups(&self) -> &[SimilarityGroup] {
        &self.state.groups
    }

    pub fn save(&self) -> Result<(), CacheError> {
        self.file.save(&self.state).map(|_| ())
    }

    /// Bring the cache in line with what is on disk: prune vanished files,
    /// then discard everything if a genuinely new file appeared.
    pub fn reconcile(&mut self, inventory: &Inventory) -> Result<Reconciliation, CacheError> {
        let mut outcome = Reconciliation {
            pruned: self.state.prune(|p| inventory.contains(p)),
            ..Default::default()
        };
        if outcome.pruned.changed() {
            log::info!(
                "Pruned {} missing file(s) from cache; {} groups remain",
                outcome.pruned.removed_members,
                self.state.groups.len()
            );
            self.save()?;
        }

        if let Some(meta) = &self.previous_meta {
            if meta.hash_function == self.hash_function
                && meta.inventory_fingerprint == inventory.fingerprint()
            {
                log::debug!("Inventory unchanged since {}", meta.updated_at.to_rfc3339());
                outcome.unchanged = true;
                return Ok(outcome);
            }
        }

        outcome.new_files = self.state.unseen(inventory.files()).len();
        if outcome.new_files > 0 {
            log::info!(
                "Detected {} new file(s); regenerating groups cache",
                outcome.new_files
            );
            self.file.remove()?;
            self.state.clear();
            self.save()?;
            outcome.reset = true;
        }
        Ok(outcome)
    }

    /// Group every image not already in a group, persisting after each seed.
    pub fn group_ungrouped(
        &mut self,
        hashes: &[HashedImage],
    ) -> Result<GroupingReport, CacheError> {
        let file = &self.file;
        grouper::group_ungrouped(&mut self.state, hashes, |state| file.save(state).map(|_| ()))
    }

    pub fn write_meta(&self, inventory: &Inventory) -> Result<(), CacheError> {
        let meta = GroupCacheMeta {
            hash_function: self.hash_function,
            groups: self.state.groups.len(),
            inventory_fingerprint: inventory.fingerprint(),
            updated_at: Utc::now(),
        };
        self.meta_file.save(&meta).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::Source;
    use std::fs;
    use tempfile::TempDir;

    const EPOCH: Mtime = Mtime { secs: 0, nanos: 0 };

    fn member(path: &str, hash: &str) -> GroupMember {
        GroupMember {
            path: PathBuf::from(path),
            hash: PerceptualHash::new(hash),
        }
    }

    fn inventory_of(paths: &[&str]) -> Inventory {
        let mut inventory = Inventory::default();
        for p in paths {
            inventory.push(ImageFile::new(
                PathBuf::from(p),
                EPOCH,
                Source::Primary,
            ));
        }
        inventory
    }

    fn state_with_groups() -> GroupCacheState {
        let mut state = GroupCacheState::default();
        state.groups.push(SimilarityGroup::new(vec![
            member("/p/a.jpg", "h1"),
            member("/p/b.jpg", "h1"),
        ]));
        state.groups.push(SimilarityGroup::new(vec![
            member("/p/c.jpg", "h2"),
            member("/p/d.jpg", "h2"),
            member("/p/e.jpg", "h2"),
        ]));
        for p in ["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"] {
            state.visited.insert(PathBuf::from(p));
            state.scanned.insert(PathBuf::from(p), EPOCH);
        }
        state.scanned.insert(PathBuf::from("/p/single.jpg"), EPOCH);
        state
    }

    fn store_in(dir: &Path) -> GroupStore {
        let paths = CachePaths::new(dir).with_fallback_dir(None);
        GroupStore::load(&paths, HashFunction::Perceptual)
    }

    #[test]
    fn test_group_id_is_sorted_member_paths() {
        let group = SimilarityGroup::new(vec![member("/z.jpg", "h"), member("/a.jpg", "h")]);
        assert_eq!(
            group.id().paths(),
            &[PathBuf::from("/a.jpg"), PathBuf::from("/z.jpg")]
        );
    }

    #[test]
    fn test_prune_drops_missing_members_and_collapsed_groups() {
        let mut state = state_with_groups();
        let gone: HashSet<PathBuf> = ["/p/a.jpg", "/p/e.jpg"].iter().map(PathBuf::from).collect();

        let report = state.prune(|p| !gone.contains(p));

        assert_eq!(report.removed_members, 2);
        assert_eq!(report.dropped_groups, 1);
        assert_eq!(state.groups.len(), 1);
        assert_eq!(state.groups[0].len(), 2);
        assert!(!state.visited.contains(Path::new("/p/a.jpg")));
        assert!(!state.visited.contains(Path::new("/p/e.jpg")));
        assert!(!state.visited.contains(Path::new("/p/b.jpg")));
        assert!(state.visited.contains(Path::new("/p/c.jpg")));
        assert!(state.scanned.contains_key(Path::new("/p/b.jpg")));
    }

    #[test]
    fn test_unseen_ignores_processed_singletons() {
        let state = state_with_groups();
        let disk = inventory_of(&["/p/a.jpg", "/p/single.jpg", "/p/new.jpg"]);
        assert_eq!(state.unseen(disk.files()), vec![Path::new("/p/new.jpg")]);
    }

    #[test]
    fn test_edited_singleton_is_unseen_again() {
        let state = state_with_groups();
        let edited = ImageFile::new(
            PathBuf::from("/p/single.jpg"),
            Mtime { secs: 60, nanos: 0 },
            Source::Primary,
        );
        assert_eq!(state.unseen([&edited]), vec![Path::new("/p/single.jpg")]);
    }

    #[test]
    fn test_state_round_trips_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_in(temp_dir.path());
        *store.state_mut() = state_with_groups();
        store.save().unwrap();

        let reloaded = store_in(temp_dir.path());
        assert_eq!(reloaded.state(), &state_with_groups());
    }

    #[test]
    fn test_corrupt_group_cache_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".groups_cache.json"), b"\x80\x04\x95garbage").unwrap();

        let store = store_in(temp_dir.path());
        assert!(store.groups().is_empty());
        assert!(store.state().visited.is_empty());
    }

    #[test]
    fn test_reconcile_prunes_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_in(temp_dir.path());
        *store.state_mut() = state_with_groups();
        store.save().unwrap();

        let inventory = inventory_of(&["/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg", "/p/single.jpg"]);
        let outcome = store.reconcile(&inventory).unwrap();

        assert!(!outcome.reset);
        assert_eq!(outcome.pruned.dropped_groups, 1);
        assert_eq!(store_in(temp_dir.path()).groups().len(), 1);
    }

    #[test]
    fn test_reconcile_resets_on_new_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_in(temp_dir.path());
        *store.state_mut() = state_with_groups();
        store.save().unwrap();

        let inventory = inventory_of(&[
            "/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg", "/p/single.jpg", "/p/new.jpg",
        ]);
        let outcome = store.reconcile(&inventory).unwrap();

        assert!(outcome.reset);
        assert_eq!(outcome.new_files, 1);
        assert_eq!(store.state(), &GroupCacheState::default());
        assert_eq!(store_in(temp_dir.path()).state(), &GroupCacheState::default());
    }

    #[test]
    fn test_unchanged_inventory_keeps_cache() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_in(temp_dir.path());
        *store.state_mut() = state_with_groups();
        store.save().unwrap();

        let inventory = inventory_of(&[
            "/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg", "/p/single.jpg",
        ]);
        let outcome = store.reconcile(&inventory).unwrap();

        assert_eq!(outcome, Reconciliation::default());
        assert_eq!(store.state(), &state_with_groups());
    }

    #[test]
    fn test_recorded_inventory_skips_the_new_file_scan() {
        let temp_dir = TempDir::new().unwrap();
        let paths = CachePaths::new(temp_dir.path()).with_fallback_dir(None);
        let inventory = inventory_of(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"]);
        let mut store = GroupStore::load(&paths, HashFunction::Perceptual);
        *store.state_mut() = state_with_groups();
        store.save().unwrap();
        store.write_meta(&inventory).unwrap();

        let mut store = GroupStore::load(&paths, HashFunction::Perceptual);
        let outcome = store.reconcile(&inventory).unwrap();
        assert!(outcome.unchanged);
        assert!(!outcome.reset);
        assert_eq!(store.groups().len(), 2);

        let mut grown = inventory_of(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"]);
        grown.push(ImageFile::new(PathBuf::from("/p/new.jpg"), EPOCH, Source::Primary));
        let mut store = GroupStore::load(&paths, HashFunction::Perceptual);
        let outcome = store.reconcile(&grown).unwrap();
        assert!(!outcome.unchanged);
        assert!(outcome.reset);
        assert_eq!(outcome.new_files, 1);
    }

    #[test]
    fn test_hash_function_change_discards_groups() {
        let temp_dir = TempDir::new().unwrap();
        let paths = CachePaths::new(temp_dir.path()).with_fallback_dir(None);
        let mut store = GroupStore::load(&paths, HashFunction::Perceptual);
        *store.state_mut() = state_with_groups();
        store.save().unwrap();
        store.write_meta(&inventory_of(&["/p/a.jpg"])).unwrap();

        assert_eq!(GroupStore::load(&paths, HashFunction::Perceptual).groups().len(), 2);
        assert!(GroupStore::load(&paths, HashFunction::Difference).groups().is_empty());
    }
}
