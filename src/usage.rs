//! Write-back usage accounting for one `apply_to_email` call.
//!
//! Matches are collected in memory while filters are evaluated and written
//! in a single batched store update afterwards, followed by a single cache
//! invalidation of the touched hot records. The sorted active-filter list
//! is left alone: usage counters are not part of the rule set.

use crate::cache::ResultCache;
use crate::error::Result;
use crate::store::FilterStore;
use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct UsageTracker {
    matched: Vec<String>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, filter_id: &str) {
        if !self.matched.iter().any(|id| id == filter_id) {
            self.matched.push(filter_id.to_string());
        }
    }

    pub fn matched(&self) -> &[String] {
        &self.matched
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Persist all recorded matches. Issues nothing when no filter matched,
    /// otherwise exactly one store write and one cache invalidation.
    /// Returns the number of filters flushed.
    pub async fn flush(
        self,
        store: &dyn FilterStore,
        cache: &ResultCache,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if self.matched.is_empty() {
            return Ok(0);
        }

        store.batch_update_usage(&self.matched, now).await?;
        cache.invalidate_records(&self.matched);

        log::debug!("Flushed usage for {} matched filters", self.matched.len());
        Ok(self.matched.len())
    }
}
