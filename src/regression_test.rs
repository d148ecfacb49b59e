//! Cross-module regression tests for the engine: usage batching, cache
//! coherence after mutations, store failures and concurrent applies.

use crate::cache::ResultCache;
use crate::config::{EngineConfig, StoreConfig};
use crate::engine::FilterEngine;
use crate::error::{FilterError, Result};
use crate::models::{EmailRecord, Filter, FilterActions, FilterCriteria, FilterPatch, FilterPerformance};
use crate::store::{FilterStore, SqliteFilterStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Store failures to inject.
#[derive(Debug, Default)]
struct Faults {
    /// Fail every `create` after this many calls.
    creates_before_failure: Option<usize>,
    fail_updates: bool,
    fail_usage: bool,
}

fn injected_failure() -> FilterError {
    FilterError::StoreUnavailable {
        attempts: 3,
        message: "database is locked".to_string(),
    }
}

/// Store wrapper that counts calls, injects failures and can hold one
/// `get` between reading the row and returning it.
struct InstrumentedStore {
    inner: SqliteFilterStore,
    faults: Faults,
    usage_writes: AtomicUsize,
    create_calls: AtomicUsize,
    pause_get: AtomicBool,
    get_read: Notify,
    resume_get: Notify,
}

impl InstrumentedStore {
    fn new(faults: Faults) -> Self {
        Self {
            inner: SqliteFilterStore::in_memory(StoreConfig::default()).unwrap(),
            faults,
            usage_writes: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            pause_get: AtomicBool::new(false),
            get_read: Notify::new(),
            resume_get: Notify::new(),
        }
    }

    fn usage_writes(&self) -> usize {
        self.usage_writes.load(Ordering::SeqCst)
    }

    fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// The next `get` signals `get_read` once it has the row and waits for
    /// `resume_get` before returning it.
    fn pause_next_get(&self) {
        self.pause_get.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl FilterStore for InstrumentedStore {
    async fn create(&self, filter: &Filter) -> Result<Filter> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst);
        if matches!(self.faults.creates_before_failure, Some(limit) if call >= limit) {
            return Err(injected_failure());
        }
        self.inner.create(filter).await
    }

    async fn get(&self, filter_id: &str) -> Result<Option<Filter>> {
        let result = self.inner.get(filter_id).await;
        if self.pause_get.swap(false, Ordering::SeqCst) {
            self.get_read.notify_one();
            self.resume_get.notified().await;
        }
        result
    }

    async fn list_active(&self) -> Result<Vec<Filter>> {
        self.inner.list_active().await
    }

    async fn list_all(&self) -> Result<Vec<Filter>> {
        self.inner.list_all().await
    }

    async fn update(&self, filter_id: &str, patch: &FilterPatch) -> Result<bool> {
        if self.faults.fail_updates {
            return Err(injected_failure());
        }
        self.inner.update(filter_id, patch).await
    }

    async fn delete(&self, filter_id: &str) -> Result<bool> {
        self.inner.delete(filter_id).await
    }

    async fn batch_update_usage(
        &self,
        filter_ids: &[String],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.usage_writes.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_usage {
            return Err(injected_failure());
        }
        self.inner.batch_update_usage(filter_ids, timestamp).await
    }

    async fn record_performance(&self, performance: &FilterPerformance) -> Result<()> {
        self.inner.record_performance(performance).await
    }

    async fn performance_for(&self, filter_id: &str) -> Result<Vec<FilterPerformance>> {
        self.inner.performance_for(filter_id).await
    }
}

fn setup_with(faults: Faults) -> (Arc<InstrumentedStore>, Arc<ResultCache>, FilterEngine) {
    let config = EngineConfig::default();
    let store = Arc::new(InstrumentedStore::new(faults));
    let cache = Arc::new(ResultCache::new(&config.cache));
    let engine = FilterEngine::new(store.clone(), cache.clone(), &config);
    (store, cache, engine)
}

fn setup() -> (Arc<InstrumentedStore>, Arc<ResultCache>, FilterEngine) {
    setup_with(Faults::default())
}

fn bank_samples() -> Vec<EmailRecord> {
    (0..4)
        .map(|i| EmailRecord::new("alerts@bank.com", &format!("Statement {i}"), ""))
        .collect()
}

fn label(name: &str) -> FilterActions {
    let mut actions = FilterActions::new();
    actions.insert("add_label".to_string(), json!(name));
    actions
}

async fn add_domain_filter(engine: &FilterEngine, name: &str, domain: &str, priority: i64) -> Filter {
    engine
        .add_custom_filter(name, "", FilterCriteria::sender_domain(domain), label(name), priority)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_one_usage_write_per_apply() {
    for n in [0usize, 1, 5, 50, 600] {
        let (store, cache, engine) = setup();
        for i in 0..n {
            add_domain_filter(&engine, &format!("f{i}"), "bulk.com", i as i64).await;
        }
        // Non-matching filter to make sure only matches are counted.
        add_domain_filter(&engine, "other", "elsewhere.com", 0).await;

        let invalidations_before = cache.invalidation_count();
        let result = engine
            .apply_to_email(&EmailRecord::new("news@bulk.com", "hello", ""))
            .await
            .unwrap();

        assert_eq!(result.filters_matched.len(), n, "n = {n}");
        let expected = if n == 0 { 0 } else { 1 };
        assert_eq!(store.usage_writes(), expected, "usage writes for n = {n}");
        assert_eq!(
            cache.invalidation_count() - invalidations_before,
            expected as u64,
            "invalidations for n = {n}"
        );

        for filter in engine.list_all().await.unwrap() {
            let expected_usage = if filter.name == "other" { 0 } else { 1 };
            assert_eq!(filter.usage_count, expected_usage, "{}", filter.name);
        }
    }
}

#[tokio::test]
async fn test_apply_keeps_active_list_cached() {
    let (_store, cache, engine) = setup();
    add_domain_filter(&engine, "a", "a.com", 1).await;

    let email = EmailRecord::new("x@a.com", "", "");
    engine.apply_to_email(&email).await.unwrap();
    assert!(cache.get_active_filters().is_some());

    let misses_before = cache.stats().queries.misses;
    engine.apply_to_email(&email).await.unwrap();
    assert!(cache.get_active_filters().is_some());
    assert_eq!(cache.stats().queries.misses, misses_before);
}

#[tokio::test]
async fn test_create_is_visible_to_next_apply() {
    let (_store, _cache, engine) = setup();
    let email = EmailRecord::new("x@a.com", "", "");
    assert!(engine.apply_to_email(&email).await.unwrap().filters_matched.is_empty());

    add_domain_filter(&engine, "a", "a.com", 1).await;
    assert_eq!(engine.apply_to_email(&email).await.unwrap().filters_matched.len(), 1);
}

#[tokio::test]
async fn test_update_is_visible_to_next_apply() {
    let (_store, _cache, engine) = setup();
    let f = add_domain_filter(&engine, "a", "a.com", 1).await;
    let email = EmailRecord::new("x@a.com", "", "");
    assert_eq!(engine.apply_to_email(&email).await.unwrap().filters_matched.len(), 1);

    let patch = FilterPatch {
        criteria: Some(FilterCriteria::sender_domain("b.com")),
        ..Default::default()
    };
    assert!(engine.update_filter(&f.filter_id, &patch).await.unwrap());
    assert!(engine.apply_to_email(&email).await.unwrap().filters_matched.is_empty());

    let other = EmailRecord::new("x@b.com", "", "");
    assert_eq!(engine.apply_to_email(&other).await.unwrap().filters_matched.len(), 1);
}

#[tokio::test]
async fn test_priority_change_reorders_matches() {
    let (_store, _cache, engine) = setup();
    let low = add_domain_filter(&engine, "low", "a.com", 1).await;
    add_domain_filter(&engine, "high", "a.com", 5).await;
    let email = EmailRecord::new("x@a.com", "", "");

    let first = engine.apply_to_email(&email).await.unwrap();
    assert_eq!(first.filters_matched[0].name, "high");

    let patch = FilterPatch {
        priority: Some(10),
        ..Default::default()
    };
    engine.update_filter(&low.filter_id, &patch).await.unwrap();
    let second = engine.apply_to_email(&email).await.unwrap();
    assert_eq!(second.filters_matched[0].name, "low");
}

#[tokio::test]
async fn test_delete_is_visible_to_next_apply() {
    let (_store, cache, engine) = setup();
    let f = add_domain_filter(&engine, "a", "a.com", 1).await;
    let email = EmailRecord::new("x@a.com", "", "");
    engine.apply_to_email(&email).await.unwrap();
    engine.get_by_id(&f.filter_id).await.unwrap();

    assert!(engine.delete_filter(&f.filter_id).await.unwrap());
    assert!(cache.get_record(&f.filter_id).is_none());
    assert!(engine.apply_to_email(&email).await.unwrap().filters_matched.is_empty());
    assert!(engine.get_by_id(&f.filter_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_by_id_reflects_usage() {
    let (_store, _cache, engine) = setup();
    let f = add_domain_filter(&engine, "a", "a.com", 1).await;

    assert_eq!(engine.get_by_id(&f.filter_id).await.unwrap().unwrap().usage_count, 0);
    engine
        .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
        .await
        .unwrap();
    assert_eq!(engine.get_by_id(&f.filter_id).await.unwrap().unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_synthesis_is_visible_to_next_apply() {
    let (_store, _cache, engine) = setup();
    let email = EmailRecord::new("alerts@bank.com", "Monthly statement", "");
    assert!(engine.apply_to_email(&email).await.unwrap().filters_matched.is_empty());

    let outcome = engine.create_intelligent_filters(&bank_samples()).await;
    assert!(outcome.is_complete());
    assert!(!outcome.created.is_empty());

    let result = engine.apply_to_email(&email).await.unwrap();
    assert!(result
        .filters_matched
        .iter()
        .any(|m| m.name == "Emails from bank.com"));
}

#[tokio::test]
async fn test_prune_is_visible_to_next_apply() {
    let (_store, _cache, engine) = setup();
    let f = add_domain_filter(&engine, "weak", "a.com", 1).await;
    let email = EmailRecord::new("x@a.com", "", "");
    assert_eq!(engine.apply_to_email(&email).await.unwrap().filters_matched.len(), 1);

    // New filters start with zero effectiveness and are disabled on prune.
    let report = engine.prune_ineffective_filters().await.unwrap();
    assert_eq!(report.disabled_ids, vec![f.filter_id.clone()]);
    assert!(engine.apply_to_email(&email).await.unwrap().filters_matched.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_count_every_match() {
    let (store, _cache, engine) = setup();
    let f = add_domain_filter(&engine, "shared", "a.com", 1).await;
    let engine = Arc::new(engine);

    let applies = 32;
    let mut handles = Vec::new();
    for i in 0..applies {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let email = EmailRecord::new("x@a.com", &format!("message {i}"), "");
            engine.apply_to_email(&email).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.filters_matched.len(), 1);
    }

    let stored = engine.get_by_id(&f.filter_id).await.unwrap().unwrap();
    assert_eq!(stored.usage_count, applies);
    assert_eq!(store.usage_writes(), applies as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutation_never_leaves_stale_list() {
    let (_store, cache, engine) = setup();
    let engine = Arc::new(engine);
    add_domain_filter(&engine, "seed", "a.com", 1).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                add_domain_filter(&engine, &format!("added{i}"), "a.com", i).await;
            } else {
                engine
                    .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let result = engine
        .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
        .await
        .unwrap();
    assert_eq!(result.filters_matched.len(), 5);
    assert!(cache.get_active_filters().is_some());
}

#[tokio::test]
async fn test_record_read_before_update_is_not_cached() {
    let (store, _cache, engine) = setup();
    let engine = Arc::new(engine);
    let f = add_domain_filter(&engine, "before", "a.com", 1).await;

    store.pause_next_get();
    let reader = {
        let engine = engine.clone();
        let filter_id = f.filter_id.clone();
        tokio::spawn(async move { engine.get_by_id(&filter_id).await })
    };
    store.get_read.notified().await;

    let patch = FilterPatch {
        name: Some("after".to_string()),
        ..Default::default()
    };
    assert!(engine.update_filter(&f.filter_id, &patch).await.unwrap());
    store.resume_get.notify_one();

    let in_flight = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(in_flight.name, "before");
    let current = engine.get_by_id(&f.filter_id).await.unwrap().unwrap();
    assert_eq!(current.name, "after");
}

#[tokio::test]
async fn test_record_read_before_usage_flush_is_not_cached() {
    let (store, _cache, engine) = setup();
    let engine = Arc::new(engine);
    let f = add_domain_filter(&engine, "counted", "a.com", 1).await;

    store.pause_next_get();
    let reader = {
        let engine = engine.clone();
        let filter_id = f.filter_id.clone();
        tokio::spawn(async move { engine.get_by_id(&filter_id).await })
    };
    store.get_read.notified().await;

    engine
        .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
        .await
        .unwrap();
    store.resume_get.notify_one();

    assert_eq!(reader.await.unwrap().unwrap().unwrap().usage_count, 0);
    assert_eq!(engine.get_by_id(&f.filter_id).await.unwrap().unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_synthesis_keeps_filters_created_before_a_failure() {
    let (store, _cache, engine) = setup_with(Faults {
        creates_before_failure: Some(2),
        ..Default::default()
    });

    // Planned in order: the finance template, the bank.com domain filter,
    // then the "statement" keyword filter, which hits the failure.
    let outcome = engine.create_intelligent_filters(&bank_samples()).await;

    let created: Vec<&str> = outcome.created.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(created, vec!["Financial Documents", "Emails from bank.com"]);
    assert!(matches!(outcome.error, Some(FilterError::StoreUnavailable { .. })));
    assert_eq!(store.create_calls(), 3);

    let mut stored: Vec<String> = engine.list_all().await.unwrap().into_iter().map(|f| f.name).collect();
    stored.sort();
    assert_eq!(stored, vec!["Emails from bank.com", "Financial Documents"]);

    // Filters created before the failure are live immediately.
    let result = engine
        .apply_to_email(&EmailRecord::new("alerts@bank.com", "Your statement", ""))
        .await
        .unwrap();
    assert_eq!(result.filters_matched.len(), 2);
    assert!(outcome.into_result().is_err());
}

#[tokio::test]
async fn test_failed_synthesis_with_nothing_created() {
    let (store, _cache, engine) = setup_with(Faults {
        creates_before_failure: Some(0),
        ..Default::default()
    });

    let outcome = engine.create_intelligent_filters(&bank_samples()).await;
    assert!(outcome.created.is_empty());
    assert!(!outcome.is_complete());
    assert_eq!(store.create_calls(), 1);
    assert!(engine.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_prune_drops_cached_state() {
    let (_store, cache, engine) = setup_with(Faults {
        fail_updates: true,
        ..Default::default()
    });
    // Unscored filters are disabled on prune, which needs an update.
    let f = add_domain_filter(&engine, "unscored", "a.com", 1).await;
    engine
        .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
        .await
        .unwrap();
    engine.get_by_id(&f.filter_id).await.unwrap();
    assert!(cache.get_active_filters().is_some());
    assert!(cache.get_record(&f.filter_id).is_some());

    let result = engine.prune_ineffective_filters().await;
    assert!(matches!(result, Err(FilterError::StoreUnavailable { .. })));
    assert!(cache.get_active_filters().is_none());
    assert!(cache.get_record(&f.filter_id).is_none());
}

#[tokio::test]
async fn test_usage_flush_failure_is_returned() {
    let (store, _cache, engine) = setup_with(Faults {
        fail_usage: true,
        ..Default::default()
    });
    add_domain_filter(&engine, "a", "a.com", 1).await;

    let result = engine
        .apply_to_email(&EmailRecord::new("x@a.com", "", ""))
        .await;
    assert!(matches!(result, Err(FilterError::StoreUnavailable { .. })));
    assert_eq!(store.usage_writes(), 1);

    // Nothing matched, nothing to flush, so the failure cannot surface.
    let miss = engine
        .apply_to_email(&EmailRecord::new("x@b.com", "", ""))
        .await
        .unwrap();
    assert!(miss.filters_matched.is_empty());
    assert_eq!(store.usage_writes(), 1);
}
