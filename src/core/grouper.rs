use std::collections::HashMap;

use indicatif::{ProgressBar, ProgressStyle};

use crate::core::group_store::{GroupCacheState, GroupMember, SimilarityGroup};
use crate::core::hash_cache::HashedImage;
use crate::core::store::CacheError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingReport {
    /// Images that were not in any cached group.
    pub ungrouped: usize,
    /// Groups added during this pass.
    pub formed: usize,
}

/// Group the hashed images that are not yet members of a cached group.
///
/// Images are grouped only when their hash strings are identical, so groups
/// are the equivalence classes of that equality. Existing groups are never
/// revisited. `checkpoint` runs after every seed, whether or not it formed a
/// group.
pub fn group_ungrouped<F>(
    state: &mut GroupCacheState,
    hashes: &[HashedImage],
    mut checkpoint: F,
) -> Result<GroupingReport, CacheError>
where
    F: FnMut(&GroupCacheState) -> Result<(), CacheError>,
{
    let grouped = state.grouped_paths();
    let ungrouped: Vec<&HashedImage> =
        hashes.iter().filter(|h| !grouped.contains(&h.path)).collect();
    let mut report = GroupingReport {
        ungrouped: ungrouped.len(),
        formed: 0,
    };

    if ungrouped.len() < 2 {
        log::info!("No new groups to form. All remaining images are singletons.");
        state.scanned.extend(ungrouped.iter().map(|h| (h.path.clone(), h.mtime)));
        checkpoint(state)?;
        return Ok(report);
    }

    let mut index: HashMap<&str, Vec<&HashedImage>> = HashMap::new();
    for entry in ungrouped.iter().copied() {
        index.entry(entry.hash.as_str()).or_default().push(entry);
    }

    let pb = ProgressBar::new(ungrouped.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.green/white} {pos}/{len} {msg}") {
        pb.set_style(style);
    }
    pb.set_message("Grouping images");

    for seed in ungrouped.iter().copied() {
        pb.inc(1);
        if state.visited.contains(&seed.path) {
            continue;
        }

        let mut batch = vec![seed];
        for other in index.get(seed.hash.as_str()).into_iter().flatten().copied() {
            if other.path != seed.path && !state.visited.contains(&other.path) {
                state.visited.insert(other.path.clone());
                batch.push(other);
            }
        }

        state.scanned.extend(batch.iter().map(|h| (h.path.clone(), h.mtime)));
        let members: Vec<GroupMember> = batch
            .iter()
            .map(|h| GroupMember {
                path: h.path.clone(),
                hash: h.hash.clone(),
            })
            .collect();
        if members.len() > 1 {
            state.visited.insert(seed.path.clone());
            state.groups.push(SimilarityGroup::new(members));
            report.formed += 1;
        }
        checkpoint(state)?;
    }
    pb.finish_with_message("Grouping complete");

    log::info!(
        "Formed {} new group(s) from {} ungrouped image(s)",
        report.formed,
        report.ungrouped
    );
    Ok(report)
}
