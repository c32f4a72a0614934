//! Hybrid re-ranking of semantic search results.
//!
//! Each candidate gets three signals in `[0, 1]`:
//! - semantic: its similarity to the query, clamped
//! - centrality: how many files import its file, relative to the candidate
//!   set's maximum
//! - churn: commits touching its file inside the window, relative to the
//!   candidate set's maximum
//!
//! The final score is their weighted sum.

use std::collections::HashMap;

use codemem_config::HybridWeights;
use serde::{Deserialize, Serialize};

use super::SearchHit;

/// Per-file structural and history signals for a candidate set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSignals {
    /// Importer count per path
    pub fan_in: HashMap<String, usize>,
    /// Commits in the window per path
    pub churn: HashMap<String, usize>,
}

/// A candidate with its combined score and the signals behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    #[serde(flatten)]
    pub hit: SearchHit,
    pub hybrid_score: f64,
    pub semantic: f64,
    pub centrality: f64,
    pub churn: f64,
}

fn normalized(value: usize, max: usize) -> f64 {
    if max == 0 {
        0.0
    } else {
        value as f64 / max as f64
    }
}

/// Score and sort `candidates`. Equal scores keep their input order.
pub fn rank(candidates: Vec<SearchHit>, signals: &FileSignals, weights: &HybridWeights) -> Vec<RankedHit> {
    let count = |map: &HashMap<String, usize>, path: &str| map.get(path).copied().unwrap_or(0);
    let max_fan_in = candidates
        .iter()
        .map(|hit| count(&signals.fan_in, &hit.path))
        .max()
        .unwrap_or(0);
    let max_churn = candidates
        .iter()
        .map(|hit| count(&signals.churn, &hit.path))
        .max()
        .unwrap_or(0);

    let mut ranked: Vec<RankedHit> = candidates
        .into_iter()
        .map(|hit| {
            let semantic = if hit.score.is_finite() {
                f64::from(hit.score).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let centrality = normalized(count(&signals.fan_in, &hit.path), max_fan_in);
            let churn = normalized(count(&signals.churn, &hit.path), max_churn);
            let hybrid_score = weights.semantic * semantic
                + weights.structural * centrality
                + weights.recency * churn;
            RankedHit {
                hit,
                hybrid_score,
                semantic,
                centrality,
                churn,
            }
        })
        .collect();

    ranked.sort_by(|a, b| b.hybrid_score.total_cmp(&a.hybrid_score));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::UnitKind;

    fn hit(path: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id: format!("chunk-{}", path),
            score,
            unit_id: format!("{}:f", path),
            path: path.to_string(),
            name: "f".to_string(),
            qualified_name: "f".to_string(),
            kind: UnitKind::Function,
            line_start: 1,
            line_end: 2,
            signature: None,
            text: String::new(),
        }
    }

    #[test]
    fn test_semantic_only_keeps_similarity_order() {
        let ranked = rank(
            vec![hit("a.py", 0.4), hit("b.py", 0.9)],
            &FileSignals::default(),
            &HybridWeights::default(),
        );
        assert_eq!(ranked[0].hit.path, "b.py");
        assert!((ranked[0].hybrid_score - 0.65 * 0.9).abs() < 1e-6);
        assert_eq!(ranked[1].centrality, 0.0);
    }

    #[test]
    fn test_structure_and_churn_can_reorder() {
        let signals = FileSignals {
            fan_in: HashMap::from([("core.py".to_string(), 10), ("leaf.py".to_string(), 0)]),
            churn: HashMap::from([("core.py".to_string(), 4)]),
        };
        let ranked = rank(
            vec![hit("leaf.py", 0.80), hit("core.py", 0.70)],
            &signals,
            &HybridWeights::default(),
        );
        assert_eq!(ranked[0].hit.path, "core.py");
        assert_eq!(ranked[0].centrality, 1.0);
        assert_eq!(ranked[0].churn, 1.0);
        let expected = 0.65 * f64::from(0.70f32) + 0.20 + 0.15;
        assert!((ranked[0].hybrid_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_ties_are_stable_and_scores_clamped() {
        let ranked = rank(
            vec![hit("x.py", 1.5), hit("y.py", 1.0), hit("z.py", -0.3)],
            &FileSignals::default(),
            &HybridWeights::default(),
        );
        let order: Vec<&str> = ranked.iter().map(|r| r.hit.path.as_str()).collect();
        assert_eq!(order, vec!["x.py", "y.py", "z.py"]);
        assert_eq!(ranked[0].semantic, 1.0);
        assert_eq!(ranked[2].semantic, 0.0);
    }
}
