//! Rule synthesis from historical email samples.
//!
//! Samples are mined into frequency tables; filters are then derived from
//! built-in (or configured) templates and from the most frequent sender
//! domains and subject keywords.

use crate::error::FilterError;
use crate::matcher::extract_domain;
use crate::models::{EmailRecord, Filter, FilterActions, FilterCriteria};
use crate::store::FilterStore;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"\b\w+\b").unwrap();
}

const MAX_DOMAIN_FILTERS: usize = 3;
const MIN_DOMAIN_FREQUENCY: usize = 3;
const MAX_KEYWORD_FILTERS: usize = 5;
const MIN_KEYWORD_FREQUENCY: usize = 2;
const MIN_KEYWORD_LENGTH: usize = 4;

/// Alphabetic, lower-cased words of at least four characters.
pub fn extract_keywords(text: &str) -> Vec<String> {
    WORD.find_iter(text)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LENGTH && w.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSummary {
    pub sample_count: usize,
    pub sender_domains: HashMap<String, usize>,
    pub subject_keywords: HashMap<String, usize>,
    pub content_keywords: HashMap<String, usize>,
}

impl PatternSummary {
    pub fn top_domains(&self, limit: usize, min_frequency: usize) -> Vec<(String, usize)> {
        top_entries(&self.sender_domains, limit, min_frequency)
    }

    pub fn top_subject_keywords(&self, limit: usize, min_frequency: usize) -> Vec<(String, usize)> {
        top_entries(&self.subject_keywords, limit, min_frequency)
    }
}

// Highest count first, ties alphabetical so results are deterministic.
fn top_entries(
    counts: &HashMap<String, usize>,
    limit: usize,
    min_frequency: usize,
) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts
        .iter()
        .filter(|(_, count)| **count >= min_frequency)
        .map(|(key, count)| (key.clone(), *count))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The template applies when any of these appear among mined subject keywords.
    pub keywords: Vec<String>,
    pub criteria: FilterCriteria,
    pub actions: FilterActions,
    #[serde(default)]
    pub priority: i64,
}

impl FilterTemplate {
    fn new(name: &str, description: &str, keywords: &[&str], actions: FilterActions, priority: i64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            criteria: FilterCriteria::subject_keywords(keywords),
            actions,
            priority,
        }
    }

    pub fn applies_to(&self, summary: &PatternSummary) -> bool {
        self.keywords
            .iter()
            .any(|k| summary.subject_keywords.contains_key(&k.to_lowercase()))
    }
}

fn actions(pairs: &[(&str, serde_json::Value)]) -> FilterActions {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn builtin_templates() -> Vec<FilterTemplate> {
    vec![
        FilterTemplate::new(
            "High Priority Work",
            "Urgent work requests and deadlines",
            &["urgent", "important", "asap", "priority", "deadline"],
            actions(&[("add_label", json!("High Priority")), ("mark_important", json!(true))]),
            9,
        ),
        FilterTemplate::new(
            "Financial Documents",
            "Invoices, receipts, statements and payments",
            &["invoice", "receipt", "payment", "statement", "billing", "bank"],
            actions(&[("add_label", json!("Finance")), ("move_to_folder", json!("Finance"))]),
            7,
        ),
        FilterTemplate::new(
            "Meeting Invitations",
            "Calendar invitations and scheduling",
            &["meeting", "invitation", "calendar", "schedule", "appointment"],
            actions(&[("add_label", json!("Meetings"))]),
            6,
        ),
        FilterTemplate::new(
            "Newsletters",
            "Digests and subscription mail",
            &["newsletter", "digest", "weekly", "unsubscribe", "subscription"],
            actions(&[("add_label", json!("Newsletters")), ("category", json!("updates"))]),
            2,
        ),
    ]
}

/// Filters persisted by a synthesis run, plus the store error that stopped
/// it early, if any.
#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    pub created: Vec<Filter>,
    pub error: Option<FilterError>,
}

impl SynthesisOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<Filter>, FilterError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.created),
        }
    }
}

pub struct FilterSynthesizer {
    templates: Vec<FilterTemplate>,
}

impl Default for FilterSynthesizer {
    fn default() -> Self {
        Self::new(builtin_templates())
    }
}

impl FilterSynthesizer {
    pub fn new(templates: Vec<FilterTemplate>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &[FilterTemplate] {
        &self.templates
    }

    pub fn mine(samples: &[EmailRecord]) -> PatternSummary {
        let mut summary = PatternSummary {
            sample_count: samples.len(),
            ..Default::default()
        };

        for email in samples {
            let address = if email.sender_email.trim().is_empty() {
                &email.sender
            } else {
                &email.sender_email
            };
            let domain = extract_domain(address);
            if !domain.is_empty() {
                *summary.sender_domains.entry(domain).or_insert(0) += 1;
            }

            for keyword in extract_keywords(&email.subject) {
                *summary.subject_keywords.entry(keyword).or_insert(0) += 1;
            }
            if let Some(content) = &email.content {
                for keyword in extract_keywords(content) {
                    *summary.content_keywords.entry(keyword).or_insert(0) += 1;
                }
            }
        }

        log::debug!(
            "Mined {} samples: {} domains, {} subject keywords, {} content keywords",
            summary.sample_count,
            summary.sender_domains.len(),
            summary.subject_keywords.len(),
            summary.content_keywords.len()
        );
        summary
    }

    /// One filter per template whose keywords show up in the samples.
    pub fn plan_from_templates(summary: &PatternSummary, templates: &[FilterTemplate]) -> Vec<Filter> {
        templates
            .iter()
            .filter(|t| t.applies_to(summary))
            .map(|t| {
                Filter::new(
                    &t.name,
                    &t.description,
                    t.criteria.clone(),
                    t.actions.clone(),
                    t.priority,
                )
            })
            .collect()
    }

    /// Domain filters for frequent senders, keyword filters for frequent
    /// subject words.
    pub fn plan_custom(summary: &PatternSummary) -> Vec<Filter> {
        let mut filters = Vec::new();

        for (domain, count) in summary.top_domains(MAX_DOMAIN_FILTERS, MIN_DOMAIN_FREQUENCY) {
            filters.push(Filter::new(
                &format!("Emails from {domain}"),
                &format!("Generated from {count} sample emails sent by {domain}"),
                FilterCriteria::sender_domain(&domain),
                actions(&[("add_label", json!(domain))]),
                5,
            ));
        }

        for (keyword, count) in
            summary.top_subject_keywords(MAX_KEYWORD_FILTERS, MIN_KEYWORD_FREQUENCY)
        {
            filters.push(Filter::new(
                &format!("Subject: {keyword}"),
                &format!("Generated from {count} sample subjects containing \"{keyword}\""),
                FilterCriteria::subject_keywords(&[keyword.as_str()]),
                actions(&[("add_label", json!(capitalize(&keyword)))]),
                3,
            ));
        }

        filters
    }

    /// Persist filters in order, stopping at the first store error.
    pub async fn persist(store: &dyn FilterStore, filters: Vec<Filter>, outcome: &mut SynthesisOutcome) {
        for filter in filters {
            if outcome.error.is_some() {
                return;
            }
            match store.create(&filter).await {
                Ok(created) => {
                    log::info!("Synthesized filter {} ({})", created.name, created.filter_id);
                    outcome.created.push(created);
                }
                Err(e) => {
                    log::error!("Failed to persist synthesized filter {}: {e}", filter.name);
                    outcome.error = Some(e);
                }
            }
        }
    }

    pub async fn synthesize_from_templates(
        &self,
        store: &dyn FilterStore,
        summary: &PatternSummary,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();
        let planned = Self::plan_from_templates(summary, &self.templates);
        Self::persist(store, planned, &mut outcome).await;
        outcome
    }

    pub async fn synthesize_custom(
        &self,
        store: &dyn FilterStore,
        summary: &PatternSummary,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();
        Self::persist(store, Self::plan_custom(summary), &mut outcome).await;
        outcome
    }

    /// Mine the samples and run both synthesis paths, templates first.
    pub async fn synthesize(&self, store: &dyn FilterStore, samples: &[EmailRecord]) -> SynthesisOutcome {
        let summary = Self::mine(samples);
        let mut outcome = self.synthesize_from_templates(store, &summary).await;
        if outcome.is_complete() {
            Self::persist(store, Self::plan_custom(&summary), &mut outcome).await;
        }
        outcome
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
