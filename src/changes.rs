//! Change detection between two path-to-hash snapshots.

use std::collections::BTreeMap;

use crate::models::ChangeSet;

/// Partition paths into added, modified and deleted.
///
/// A path present in both snapshots with the same hash is unchanged, even if
/// its mtime moved. The three sets are disjoint and cover exactly the
/// symmetric difference plus the hash-mismatched intersection.
pub fn detect_changes(
    current: &BTreeMap<String, String>,
    previous: &BTreeMap<String, String>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (path, hash) in current {
        match previous.get(path) {
            None => {
                changes.added.insert(path.clone());
            }
            Some(old) if old != hash => {
                changes.modified.insert(path.clone());
            }
            Some(_) => {}
        }
    }

    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.deleted.insert(path.clone());
        }
    }

    changes
}

/// Change set for a full rebuild: every current path is treated as added.
pub fn rebuild_all<'a>(paths: impl IntoIterator<Item = &'a String>) -> ChangeSet {
    ChangeSet {
        added: paths.into_iter().cloned().collect(),
        ..ChangeSet::default()
    }
}
