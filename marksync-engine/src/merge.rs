use marksync_core::Snapshot;
use std::sync::Arc;

/// Fold snapshots left to right; a later snapshot's origin, timestamp and
/// categories replace an earlier one's.
///
/// The same `Arc` appearing more than once is only folded the first time.
/// Absent entries are skipped. Returns `None` when nothing was folded.
pub fn merge_snapshots(candidates: &[Option<Arc<Snapshot>>]) -> Option<Snapshot> {
    let mut seen: Vec<&Arc<Snapshot>> = Vec::new();
    let mut merged: Option<Snapshot> = None;
    for candidate in candidates.iter().flatten() {
        if seen.iter().any(|s| Arc::ptr_eq(s, candidate)) {
            continue;
        }
        seen.push(candidate);
        merged = Some(match merged.take() {
            None => Snapshot::clone(candidate),
            Some(mut acc) => {
                acc.origin_tag.clone_from(&candidate.origin_tag);
                acc.last_update = candidate.last_update;
                acc.categories.extend(
                    candidate
                        .categories
                        .iter()
                        .map(|(category, nodes)| (*category, nodes.clone())),
                );
                acc
            }
        });
    }
    merged
}
