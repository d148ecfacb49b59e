use crate::config::PruningConfig;
use crate::error::Result;
use crate::models::{Filter, FilterPatch};
use crate::store::FilterStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneDecision {
    Keep,
    /// Deactivate but keep the record for audit.
    Disable,
    /// Hard delete, performance history included.
    Prune,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub pruned_ids: Vec<String>,
    pub disabled_ids: Vec<String>,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.pruned_ids.is_empty() && self.disabled_ids.is_empty()
    }
}

pub struct FilterPruner {
    config: PruningConfig,
}

impl FilterPruner {
    pub fn new(config: PruningConfig) -> Self {
        Self { config }
    }

    /// The effectiveness check runs first, so a filter failing both
    /// thresholds is disabled rather than deleted.
    pub fn evaluate(&self, filter: &Filter, now: DateTime<Utc>) -> PruneDecision {
        if filter.effectiveness_score < self.config.effectiveness_threshold {
            return PruneDecision::Disable;
        }

        let age_days = (now - filter.created_at).num_days();
        if filter.usage_count < self.config.usage_threshold
            && age_days > self.config.age_threshold_days
        {
            return PruneDecision::Prune;
        }

        PruneDecision::Keep
    }

    /// Evaluate a single snapshot of the active filters and apply the
    /// resulting mutations. Store errors abort the pass and propagate.
    pub async fn prune_all(&self, store: &dyn FilterStore) -> Result<PruneReport> {
        let now = Utc::now();
        let snapshot = store.list_active().await?;
        let mut report = PruneReport::default();

        for filter in &snapshot {
            match self.evaluate(filter, now) {
                PruneDecision::Keep => {}
                PruneDecision::Disable => {
                    if store
                        .update(&filter.filter_id, &FilterPatch::active(false))
                        .await?
                    {
                        log::info!(
                            "Disabled filter {} ({}): effectiveness {:.2}",
                            filter.filter_id,
                            filter.name,
                            filter.effectiveness_score
                        );
                        report.disabled_ids.push(filter.filter_id.clone());
                    }
                }
                PruneDecision::Prune => {
                    if store.delete(&filter.filter_id).await? {
                        log::info!(
                            "Pruned filter {} ({}): {} uses since {}",
                            filter.filter_id,
                            filter.name,
                            filter.usage_count,
                            filter.created_at.to_rfc3339()
                        );
                        report.pruned_ids.push(filter.filter_id.clone());
                    }
                }
            }
        }

        log::info!(
            "Pruning pass over {} filters: {} pruned, {} disabled",
            snapshot.len(),
            report.pruned_ids.len(),
            report.disabled_ids.len()
        );
        Ok(report)
    }
}
