//! Rule evaluation against a precomputed email context.
//!
//! An email is normalized once into an [`EmailContext`]; every filter is then
//! checked against that context using only the filter's compiled fields.

use crate::error::{FilterError, Result};
use crate::models::{EmailRecord, Filter};

/// Lower-cased view of an email, built once per `apply_to_email` call.
#[derive(Debug, Clone, Default)]
pub struct EmailContext {
    pub sender: String,
    pub sender_email: String,
    /// Address `from_patterns` are searched in.
    pub from_address: String,
    pub subject: String,
    pub content: String,
    /// Text after the last `@`, empty when the address has none.
    pub domain: String,
    pub labels: Vec<String>,
}

impl EmailContext {
    pub fn new(email: &EmailRecord) -> Self {
        let sender = email.sender.trim().to_lowercase();
        let sender_email = email.sender_email.trim().to_lowercase();
        let from_address = if sender_email.is_empty() {
            sender.clone()
        } else {
            sender_email.clone()
        };
        let domain = extract_domain(&from_address);

        Self {
            sender,
            sender_email,
            domain,
            from_address,
            subject: email.subject.to_lowercase(),
            content: email.content.as_deref().unwrap_or_default().to_lowercase(),
            labels: email.labels.clone(),
        }
    }
}

impl From<&EmailRecord> for EmailContext {
    fn from(email: &EmailRecord) -> Self {
        Self::new(email)
    }
}

/// Domain part of an address such as `Jane <jane@Example.com>`.
pub fn extract_domain(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((_, domain)) => domain
            .trim()
            .trim_end_matches('>')
            .trim()
            .to_lowercase(),
        None => String::new(),
    }
}

pub struct FilterMatcher;

impl FilterMatcher {
    /// Evaluate one filter. Errors only when the filter carries a pattern
    /// that failed to compile when it was loaded.
    pub fn evaluate(filter: &Filter, ctx: &EmailContext) -> Result<bool> {
        let compiled = filter.compiled();

        if let Some(pattern) = compiled.invalid_patterns.first() {
            return Err(FilterError::InvalidPattern {
                filter_id: filter.filter_id.clone(),
                pattern: pattern.clone(),
            });
        }

        // Fail closed: a filter without usable criteria would catch everything.
        if !compiled.is_usable() {
            log::debug!("Filter {} has no usable criteria", filter.filter_id);
            return Ok(false);
        }

        if let Some(domain) = &compiled.sender_domain {
            if ctx.domain.is_empty() || ctx.domain != *domain {
                return Ok(false);
            }
        }

        if !compiled.subject_keywords.is_empty()
            && !compiled
                .subject_keywords
                .iter()
                .any(|k| ctx.subject.contains(k.as_str()))
        {
            return Ok(false);
        }

        if !compiled.content_keywords.is_empty()
            && !compiled
                .content_keywords
                .iter()
                .any(|k| ctx.content.contains(k.as_str()))
        {
            return Ok(false);
        }

        if !compiled.from_patterns.is_empty()
            && !compiled
                .from_patterns
                .iter()
                .any(|p| p.is_match(&ctx.from_address))
        {
            return Ok(false);
        }

        Ok(true)
    }

    /// Like [`FilterMatcher::evaluate`], treating errors as a non-match.
    pub fn matches(filter: &Filter, ctx: &EmailContext) -> bool {
        match Self::evaluate(filter, ctx) {
            Ok(matched) => matched,
            Err(e) => {
                log::warn!("Skipping filter {}: {e}", filter.filter_id);
                false
            }
        }
    }
}
