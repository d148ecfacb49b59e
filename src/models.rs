use crate::error::{FilterError, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type FilterActions = BTreeMap<String, Value>;

/// Named predicates of a filter. Every present predicate must pass.
///
/// Keys other than the four recognized ones are kept in `extra` so they
/// survive a store round trip, but matching ignores them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_patterns: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FilterCriteria {
    /// Parse criteria from a JSON object, rejecting wrongly shaped values.
    pub fn from_json(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(FilterError::Validation(
                "criteria must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| FilterError::Validation(format!("malformed criteria: {e}")))
    }

    pub fn sender_domain(domain: &str) -> Self {
        Self {
            sender_domain: Some(domain.to_string()),
            ..Default::default()
        }
    }

    pub fn subject_keywords<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            subject_keywords: Some(keywords.iter().map(|k| k.as_ref().to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn content_keywords<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            content_keywords: Some(keywords.iter().map(|k| k.as_ref().to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            from_patterns: Some(patterns.iter().map(|p| p.as_ref().to_string()).collect()),
            ..Default::default()
        }
    }

    /// Reject criteria that could never match or carry broken patterns.
    pub fn validate(&self) -> Result<()> {
        let compiled = CompiledCriteria::build(self);
        if let Some(pattern) = compiled.invalid_patterns.first() {
            return Err(FilterError::Validation(format!(
                "invalid from pattern: {pattern}"
            )));
        }
        if !compiled.is_usable() {
            return Err(FilterError::Validation(
                "criteria must contain at least one usable predicate".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lower-cased and compiled form of `FilterCriteria`, derived in one place.
#[derive(Debug, Clone, Default)]
pub struct CompiledCriteria {
    pub(crate) sender_domain: Option<String>,
    pub(crate) subject_keywords: Vec<String>,
    pub(crate) content_keywords: Vec<String>,
    pub(crate) from_patterns: Vec<Regex>,
    pub(crate) invalid_patterns: Vec<String>,
}

impl CompiledCriteria {
    pub fn build(criteria: &FilterCriteria) -> Self {
        let sender_domain = criteria
            .sender_domain
            .as_deref()
            .map(|d| d.trim().trim_start_matches('@').to_lowercase())
            .filter(|d| !d.is_empty());

        let mut from_patterns = Vec::new();
        let mut invalid_patterns = Vec::new();
        for pattern in criteria.from_patterns.iter().flatten() {
            if pattern.is_empty() {
                continue;
            }
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => from_patterns.push(regex),
                Err(e) => {
                    log::debug!("Pattern {pattern:?} failed to compile: {e}");
                    invalid_patterns.push(pattern.clone());
                }
            }
        }

        for key in criteria.extra.keys() {
            log::debug!("Ignoring unrecognized criterion: {key}");
        }

        Self {
            sender_domain,
            subject_keywords: normalize_keywords(criteria.subject_keywords.as_deref()),
            content_keywords: normalize_keywords(criteria.content_keywords.as_deref()),
            from_patterns,
            invalid_patterns,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.sender_domain.is_some()
            || !self.subject_keywords.is_empty()
            || !self.content_keywords.is_empty()
            || !self.from_patterns.is_empty()
    }
}

fn normalize_keywords(keywords: Option<&[String]>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for keyword in keywords.unwrap_or_default() {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !normalized.contains(&keyword) {
            normalized.push(keyword);
        }
    }
    normalized
}

#[derive(Debug, Clone, Serialize)]
pub struct Filter {
    pub filter_id: String,
    pub name: String,
    pub description: String,
    criteria: FilterCriteria,
    pub actions: FilterActions,
    pub priority: i64,
    pub effectiveness_score: f64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub false_positive_rate: f64,
    pub performance_metrics: Value,
    pub is_active: bool,
    #[serde(skip)]
    compiled: CompiledCriteria,
}

impl Filter {
    /// A fresh, active filter with a new id and default analytics.
    pub fn new(
        name: &str,
        description: &str,
        criteria: FilterCriteria,
        actions: FilterActions,
        priority: i64,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            name,
            description,
            criteria,
            actions,
            priority,
            Utc::now(),
        )
    }

    /// A filter with a known id and creation time, e.g. one read back from
    /// storage. Analytics fields start at their defaults.
    pub fn with_id(
        filter_id: String,
        name: &str,
        description: &str,
        criteria: FilterCriteria,
        actions: FilterActions,
        priority: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let compiled = CompiledCriteria::build(&criteria);
        Self {
            filter_id,
            name: name.to_string(),
            description: description.to_string(),
            criteria,
            actions,
            priority,
            effectiveness_score: 0.0,
            created_at,
            last_used: created_at,
            usage_count: 0,
            false_positive_rate: 0.0,
            performance_metrics: Value::Object(Default::default()),
            is_active: true,
            compiled,
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn compiled(&self) -> &CompiledCriteria {
        &self.compiled
    }

    /// Replace the criteria and rebuild every derived matching field.
    pub fn set_criteria(&mut self, criteria: FilterCriteria) {
        self.compiled = CompiledCriteria::build(&criteria);
        self.criteria = criteria;
    }

    /// Checks applied before a filter is first persisted.
    pub fn validate(&self) -> Result<()> {
        if self.filter_id.trim().is_empty() {
            return Err(FilterError::Validation("filter id is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(FilterError::Validation("filter name is empty".to_string()));
        }
        self.criteria.validate()?;
        validate_actions(&self.actions)?;
        validate_score("effectiveness_score", self.effectiveness_score)
    }
}

// Derived fields follow from `criteria`, so equality covers persisted fields only.
impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.filter_id == other.filter_id
            && self.name == other.name
            && self.description == other.description
            && self.criteria == other.criteria
            && self.actions == other.actions
            && self.priority == other.priority
            && self.effectiveness_score == other.effectiveness_score
            && self.created_at == other.created_at
            && self.last_used == other.last_used
            && self.usage_count == other.usage_count
            && self.false_positive_rate == other.false_positive_rate
            && self.performance_metrics == other.performance_metrics
            && self.is_active == other.is_active
    }
}

pub fn validate_actions(actions: &FilterActions) -> Result<()> {
    if actions.is_empty() {
        return Err(FilterError::Validation(
            "filter must define at least one action".to_string(),
        ));
    }
    if actions.keys().any(|k| k.trim().is_empty()) {
        return Err(FilterError::Validation("action name is empty".to_string()));
    }
    Ok(())
}

fn validate_score(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(FilterError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Partial update of a filter. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub criteria: Option<FilterCriteria>,
    pub actions: Option<FilterActions>,
    pub priority: Option<i64>,
    pub effectiveness_score: Option<f64>,
    pub false_positive_rate: Option<f64>,
    pub performance_metrics: Option<Value>,
    pub is_active: Option<bool>,
}

impl FilterPatch {
    pub fn active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.criteria.is_none()
            && self.actions.is_none()
            && self.priority.is_none()
            && self.effectiveness_score.is_none()
            && self.false_positive_rate.is_none()
            && self.performance_metrics.is_none()
            && self.is_active.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(FilterError::Validation("patch has no fields".to_string()));
        }
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(FilterError::Validation("filter name is empty".to_string()));
        }
        if let Some(criteria) = &self.criteria {
            criteria.validate()?;
        }
        if let Some(actions) = &self.actions {
            validate_actions(actions)?;
        }
        if let Some(score) = self.effectiveness_score {
            validate_score("effectiveness_score", score)?;
        }
        if let Some(rate) = self.false_positive_rate {
            validate_score("false_positive_rate", rate)?;
        }
        Ok(())
    }
}

/// Outcome of one evaluation pass of a filter against labelled samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPerformance {
    pub filter_id: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub processing_time_ms: f64,
    pub sample_count: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl FilterPerformance {
    /// FP / (TP + FP), zero when nothing was flagged.
    pub fn false_positive_rate(&self) -> f64 {
        let flagged = self.true_positives + self.false_positives;
        if flagged == 0 {
            0.0
        } else {
            self.false_positives as f64 / flagged as f64
        }
    }
}

/// Minimal email fields needed for matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailRecord {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "body")]
    pub content: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl EmailRecord {
    pub fn new(sender_email: &str, subject: &str, content: &str) -> Self {
        Self {
            sender: sender_email.to_string(),
            sender_email: sender_email.to_string(),
            subject: subject.to_string(),
            content: Some(content.to_string()),
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedFilter {
    pub filter_id: String,
    pub name: String,
    pub priority: i64,
}

/// Per-email summary returned by `FilterEngine::apply_to_email`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub filters_matched: Vec<MatchedFilter>,
    pub actions_taken: Vec<String>,
    pub categories: Vec<String>,
}
