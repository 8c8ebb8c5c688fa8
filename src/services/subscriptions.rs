//! Reconciliation of feed topic subscriptions against the selected lines.
//!
//! Selection changes arrive from user interaction and can outpace the
//! subscribe/unsubscribe round-trips they trigger. Every reconciliation is
//! stamped with a generation; only the newest stamp may commit, so a slow
//! in-flight reconciliation can never clobber one that superseded it.

use std::collections::HashSet;
use tracing::debug;

use crate::models::{RouteSelection, VehicleKind};

/// Root of the vehicle-position topic tree.
pub const TOPIC_ROOT: &str = "/hfp/v2/journey/ongoing/vp";

/// Computed subscription delta for one reconciliation.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    /// Generation stamp of this reconciliation; pass back to `apply_update`
    pub request_id: u64,
    /// Complete topic set the selection expands to
    pub new_topics: HashSet<String>,
    /// Topics to subscribe, sorted for deterministic issue order
    pub to_subscribe: Vec<String>,
    /// Topics to unsubscribe, sorted for deterministic issue order
    pub to_unsubscribe: Vec<String>,
}

/// Tracks the active topic set and stamps reconciliations with a generation
/// counter.
#[derive(Debug, Default)]
pub struct SubscriptionReconciler {
    active_topics: HashSet<String>,
    generation: u64,
}

/// The upstream topic hierarchy is not consistent across deployments: the
/// route id has been observed both four and five levels below the kind
/// prefix. Each candidate id therefore expands to both wildcard layouts.
fn topic_variants(prefix: &str, id: &str) -> [String; 2] {
    [
        format!("{TOPIC_ROOT}/{prefix}/+/+/{id}/#"),
        format!("{TOPIC_ROOT}/{prefix}/+/+/+/{id}/#"),
    ]
}

impl SubscriptionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_topics(&self) -> &HashSet<String> {
        &self.active_topics
    }

    /// Compute the minimal subscribe/unsubscribe delta for `selections`.
    ///
    /// Increments the generation; the returned `request_id` must match the
    /// counter at `apply_update` time for the result to commit. The active
    /// set is not touched here.
    pub fn compute_change(
        &mut self,
        selections: &[RouteSelection],
        kind: VehicleKind,
    ) -> SubscriptionChange {
        self.generation += 1;
        let request_id = self.generation;

        let mut new_topics = HashSet::new();
        for selection in selections {
            for id in selection.candidate_ids() {
                for topic in topic_variants(kind.as_str(), &id) {
                    new_topics.insert(topic);
                }
            }
        }

        let mut to_subscribe: Vec<String> =
            new_topics.difference(&self.active_topics).cloned().collect();
        let mut to_unsubscribe: Vec<String> =
            self.active_topics.difference(&new_topics).cloned().collect();
        to_subscribe.sort();
        to_unsubscribe.sort();

        debug!(
            request_id,
            subscribe = to_subscribe.len(),
            unsubscribe = to_unsubscribe.len(),
            "Computed subscription change"
        );

        SubscriptionChange {
            request_id,
            new_topics,
            to_subscribe,
            to_unsubscribe,
        }
    }

    /// Commit a completed reconciliation. Returns `false` when a newer
    /// reconciliation started in the meantime; the caller must then discard
    /// every side effect of the stale one.
    pub fn apply_update(&mut self, request_id: u64, new_topics: HashSet<String>) -> bool {
        if request_id != self.generation {
            debug!(
                request_id,
                generation = self.generation,
                "Discarding superseded subscription update"
            );
            return false;
        }
        self.active_topics = new_topics;
        true
    }

    /// Drop all subscription state, e.g. on teardown. The generation keeps
    /// counting so stale in-flight reconciliations still fail to commit.
    pub fn reset(&mut self) {
        self.active_topics.clear();
        self.generation += 1;
    }
}
