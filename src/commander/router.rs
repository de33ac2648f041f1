//! Keyword routing.

use serde::{Deserialize, Serialize};

use crate::store::WorkerDefinition;

/// Where a piece of work should go, and how strongly it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub worker_id: String,
    pub worker_name: String,
    /// Number of the worker's triggers found in the text. Zero means fallback.
    pub score: usize,
}

/// Count how many of the worker's triggers occur in `text_lower`.
pub fn score(text_lower: &str, worker: &WorkerDefinition) -> usize {
    worker
        .triggers
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && text_lower.contains(t.as_str()))
        .count()
}

/// Pick the worker whose triggers best match `text`.
///
/// Ties go to the earlier worker in `workers`. When nothing matches the
/// fallback worker is returned with a score of zero.
pub fn route(text: &str, workers: &[WorkerDefinition], fallback: &str) -> RouteDecision {
    let text_lower = text.to_lowercase();

    let mut best: Option<(&WorkerDefinition, usize)> = None;
    for worker in workers {
        let s = score(&text_lower, worker);
        if s > best.map_or(0, |(_, b)| b) {
            best = Some((worker, s));
        }
    }

    match best {
        Some((worker, score)) => RouteDecision {
            worker_id: worker.id.clone(),
            worker_name: worker.name.clone(),
            score,
        },
        None => RouteDecision {
            worker_id: fallback.to_string(),
            worker_name: workers
                .iter()
                .find(|w| w.id == fallback)
                .map_or_else(|| fallback.to_string(), |w| w.name.clone()),
            score: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::seed::base_workers;

    #[test]
    fn test_routes_to_best_match() {
        let d = route(
            "Analyze BTC trading signals for the weekly report",
            &base_workers(),
            "commander",
        );
        assert_eq!(d.worker_id, "quant");
        assert_eq!(d.worker_name, "Quant Analyst");
        assert!(d.score >= 2);
    }

    #[test]
    fn test_zero_match_falls_back() {
        let d = route("zzz qqq", &base_workers(), "commander");
        assert_eq!(d.worker_id, "commander");
        assert_eq!(d.worker_name, "Commander");
        assert_eq!(d.score, 0);

        let d = route("zzz", &[], "nobody");
        assert_eq!(d.worker_name, "nobody");
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let workers = vec![
            WorkerDefinition::new("first", "First").with_triggers(["alpha"]),
            WorkerDefinition::new("second", "Second").with_triggers(["beta"]),
        ];
        assert_eq!(route("beta alpha", &workers, "x").worker_id, "first");
    }

    #[test]
    fn test_matching_is_case_insensitive_substring() {
        let w = WorkerDefinition::new("ops", "Ops").with_triggers(["Docker", "  ", "deploy"]);
        assert_eq!(score("redeploy the docker stack", &w), 2);
    }
}
