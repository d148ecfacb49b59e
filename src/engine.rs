//! Public entry point of the filtering subsystem.
//!
//! `FilterEngine` wires the store, caches, matcher, synthesizer, pruner and
//! usage tracker together. It is `Send + Sync`; share it behind an `Arc`.
//! Callers only ever receive clones of filter records.

use crate::cache::{ResultCache, ResultCacheStats};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::matcher::{EmailContext, FilterMatcher};
use crate::models::{
    ApplyResult, EmailRecord, Filter, FilterActions, FilterCriteria, FilterPatch,
    FilterPerformance, MatchedFilter,
};
use crate::pruner::{FilterPruner, PruneReport};
use crate::store::{FilterStore, SqliteFilterStore};
use crate::synthesizer::{builtin_templates, FilterSynthesizer, SynthesisOutcome};
use crate::usage::UsageTracker;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStatistics {
    pub total_filters: usize,
    pub active_filters: usize,
    pub inactive_filters: usize,
    pub total_usage: u64,
    pub average_effectiveness: f64,
    pub cache: ResultCacheStats,
}

pub struct FilterEngine {
    store: Arc<dyn FilterStore>,
    cache: Arc<ResultCache>,
    pruner: FilterPruner,
    synthesizer: FilterSynthesizer,
}

impl FilterEngine {
    pub fn new(store: Arc<dyn FilterStore>, cache: Arc<ResultCache>, config: &EngineConfig) -> Self {
        let templates = config
            .synthesis
            .templates
            .clone()
            .unwrap_or_else(builtin_templates);
        Self {
            store,
            cache,
            pruner: FilterPruner::new(config.pruning.clone()),
            synthesizer: FilterSynthesizer::new(templates),
        }
    }

    /// Engine over the SQLite database named in the configuration.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let store = SqliteFilterStore::open(&config.database_path, config.store.clone())?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(ResultCache::new(&config.cache)),
            config,
        ))
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Active filters in priority order, served from the query cache when
    /// possible.
    pub async fn list_active(&self) -> Result<Vec<Filter>> {
        if let Some(filters) = self.cache.get_active_filters() {
            return Ok(filters);
        }
        let generation = self.cache.active_generation();
        let filters = self.store.list_active().await?;
        self.cache.put_active_filters(&filters, generation);
        Ok(filters)
    }

    pub async fn list_all(&self) -> Result<Vec<Filter>> {
        self.store.list_all().await
    }

    pub async fn get_by_id(&self, filter_id: &str) -> Result<Option<Filter>> {
        if let Some(filter) = self.cache.get_record(filter_id) {
            return Ok(Some(filter));
        }
        let generation = self.cache.record_generation();
        let filter = self.store.get(filter_id).await?;
        if let Some(filter) = &filter {
            self.cache.put_record(filter, generation);
        }
        Ok(filter)
    }

    /// Match one email against every active filter and record usage for
    /// the matches with a single batched write.
    pub async fn apply_to_email(&self, email: &EmailRecord) -> Result<ApplyResult> {
        let started = Instant::now();
        let ctx = EmailContext::new(email);
        let filters = self.list_active().await?;

        let mut result = ApplyResult::default();
        let mut tracker = UsageTracker::new();

        for filter in &filters {
            match FilterMatcher::evaluate(filter, &ctx) {
                Ok(true) => {
                    log::debug!("Filter {} ({}) matched", filter.filter_id, filter.name);
                    tracker.record(&filter.filter_id);
                    result.filters_matched.push(MatchedFilter {
                        filter_id: filter.filter_id.clone(),
                        name: filter.name.clone(),
                        priority: filter.priority,
                    });
                    collect_actions(&filter.actions, &mut result);
                }
                Ok(false) => {}
                Err(e) => log::warn!("Skipping filter {}: {e}", filter.filter_id),
            }
        }

        tracker.flush(self.store.as_ref(), &self.cache, Utc::now()).await?;

        log::debug!(
            "Applied {} filters to email from {}: {} matched in {:?}",
            filters.len(),
            ctx.from_address,
            result.filters_matched.len(),
            started.elapsed()
        );
        Ok(result)
    }

    pub async fn add_custom_filter(
        &self,
        name: &str,
        description: &str,
        criteria: FilterCriteria,
        actions: FilterActions,
        priority: i64,
    ) -> Result<Filter> {
        let filter = Filter::new(name, description, criteria, actions, priority);
        filter.validate()?;
        let created = self.store.create(&filter).await?;
        self.cache.invalidate_active_filters();
        log::info!("Added custom filter {} ({})", created.name, created.filter_id);
        Ok(created)
    }

    /// Mine the samples and persist template and ad hoc filters.
    pub async fn create_intelligent_filters(&self, samples: &[EmailRecord]) -> SynthesisOutcome {
        let outcome = self.synthesizer.synthesize(self.store.as_ref(), samples).await;
        if !outcome.created.is_empty() {
            self.cache.invalidate_active_filters();
        }
        log::info!(
            "Created {} filters from {} samples",
            outcome.created.len(),
            samples.len()
        );
        outcome
    }

    pub async fn prune_ineffective_filters(&self) -> Result<PruneReport> {
        let result = self.pruner.prune_all(self.store.as_ref()).await;
        // Mutations may have landed before an error; drop cached state either way.
        match &result {
            Ok(report) => {
                let touched: Vec<String> = report
                    .pruned_ids
                    .iter()
                    .chain(&report.disabled_ids)
                    .cloned()
                    .collect();
                if !touched.is_empty() {
                    self.cache.invalidate_records(&touched);
                    self.cache.invalidate_active_filters();
                }
            }
            Err(_) => self.cache.clear(),
        }
        result
    }

    pub async fn update_filter(&self, filter_id: &str, patch: &FilterPatch) -> Result<bool> {
        let updated = self.store.update(filter_id, patch).await?;
        if updated {
            self.cache.invalidate_filter(filter_id);
        }
        Ok(updated)
    }

    pub async fn set_active(&self, filter_id: &str, is_active: bool) -> Result<bool> {
        let updated = self.update_filter(filter_id, &FilterPatch::active(is_active)).await?;
        if updated {
            log::info!(
                "Filter {filter_id} {}",
                if is_active { "enabled" } else { "disabled" }
            );
        }
        Ok(updated)
    }

    pub async fn delete_filter(&self, filter_id: &str) -> Result<bool> {
        let deleted = self.store.delete(filter_id).await?;
        if deleted {
            self.cache.invalidate_filter(filter_id);
            log::info!("Deleted filter {filter_id}");
        }
        Ok(deleted)
    }

    /// Store an evaluation result and fold it into the filter's analytics.
    pub async fn record_performance(&self, performance: &FilterPerformance) -> Result<bool> {
        self.store.record_performance(performance).await?;
        let patch = FilterPatch {
            effectiveness_score: Some(performance.f1_score.clamp(0.0, 1.0)),
            false_positive_rate: Some(performance.false_positive_rate()),
            performance_metrics: Some(performance_metrics(performance)),
            ..Default::default()
        };
        self.update_filter(&performance.filter_id, &patch).await
    }

    pub async fn performance_history(&self, filter_id: &str) -> Result<Vec<FilterPerformance>> {
        self.store.performance_for(filter_id).await
    }

    pub async fn statistics(&self) -> Result<FilterStatistics> {
        let filters = self.store.list_all().await?;
        let active = filters.iter().filter(|f| f.is_active).count();
        let average_effectiveness = if filters.is_empty() {
            0.0
        } else {
            filters.iter().map(|f| f.effectiveness_score).sum::<f64>() / filters.len() as f64
        };

        Ok(FilterStatistics {
            total_filters: filters.len(),
            active_filters: active,
            inactive_filters: filters.len() - active,
            total_usage: filters.iter().map(|f| f.usage_count).sum(),
            average_effectiveness,
            cache: self.cache.stats(),
        })
    }

    pub fn cache_stats(&self) -> ResultCacheStats {
        self.cache.stats()
    }
}

fn performance_metrics(performance: &FilterPerformance) -> Value {
    json!({
        "accuracy": performance.accuracy,
        "precision": performance.precision,
        "recall": performance.recall,
        "f1_score": performance.f1_score,
        "processing_time_ms": performance.processing_time_ms,
        "sample_count": performance.sample_count,
        "recorded_at": performance.recorded_at.to_rfc3339(),
    })
}

fn collect_actions(actions: &FilterActions, result: &mut ApplyResult) {
    for (name, param) in actions {
        let rendered = match param {
            Value::Bool(true) => Some(name.clone()),
            Value::Bool(false) | Value::Null => None,
            Value::String(s) => Some(format!("{name}: {s}")),
            other => Some(format!("{name}: {other}")),
        };
        if let Some(action) = rendered {
            result.actions_taken.push(action);
        }

        if name == "add_label" || name == "category" {
            if let Value::String(category) = param {
                if !result.categories.contains(category) {
                    result.categories.push(category.clone());
                }
            }
        }
    }
}
