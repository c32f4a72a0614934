//! Transitive dependents of a file.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::graph::{Direction, EdgeKind, GraphStore, NodeKey, StoreError};

/// A file affected by a change, at its minimum hop distance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImpactEntry {
    pub depth: usize,
    pub path: String,
}

/// Files that import `path`, directly or transitively, within `max_depth`
/// hops (at least one). Ordered by depth, then path.
///
/// Breadth-first, so each file is reported once at its minimum depth; the
/// visited set makes import cycles terminate.
pub async fn dependents(
    store: &dyn GraphStore,
    path: &str,
    max_depth: usize,
) -> Result<Vec<ImpactEntry>, StoreError> {
    let max_depth = max_depth.max(1);
    let mut visited: HashSet<String> = HashSet::from([path.to_string()]);
    let mut queue: VecDeque<(String, usize)> = VecDeque::from([(path.to_string(), 0)]);
    let mut affected = Vec::new();

    while let Some((current, depth)) = queue.pop_front() {
        if depth == max_depth {
            continue;
        }
        let importers = store
            .neighbors(&NodeKey::File(current), EdgeKind::Imports, Direction::Incoming)
            .await?;
        for importer in importers {
            let Some(importer) = importer.as_file() else {
                continue;
            };
            if visited.insert(importer.to_string()) {
                affected.push(ImpactEntry {
                    depth: depth + 1,
                    path: importer.to_string(),
                });
                queue.push_back((importer.to_string(), depth + 1));
            }
        }
    }

    affected.sort();
    Ok(affected)
}
