//! Filter evaluation: declarative filters to Gmail search queries
//!
//! A [`FilterSpec`] is compiled into a [`GmailQuery`] before any remote call
//! is made, so a bad filter never costs a listing request. Present fields are
//! ANDed; absent fields place no constraint.
//!
//! Examples of compiled output:
//! - `from:news@example.com` - bare token, only address characters
//! - `from:"ACME Deals" subject:"50% off"` - anything else is double-quoted
//! - `after:2024/01/01 before:2024/07/01 -has:attachment`
//!
//! Both dates are inclusive. Gmail's `before:` excludes its own day, so the
//! compiled term is the day after `before`; `after == before` selects one day.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{GmailError, Result};

/// Categories Gmail exposes through the `category:` operator
pub const CATEGORIES: &[&str] = &["primary", "social", "promotions", "updates", "forums"];

static OLDER_THAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+d$").expect("valid regex"));
static LARGER_THAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[KMGkmg]$").expect("valid regex"));

/// Immutable set of message constraints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSpec {
    #[serde(alias = "from", deserialize_with = "empty_as_none")]
    pub sender: Option<String>,
    #[serde(deserialize_with = "empty_as_none")]
    pub subject: Option<String>,
    #[serde(deserialize_with = "date_or_empty")]
    pub after: Option<NaiveDate>,
    #[serde(deserialize_with = "date_or_empty")]
    pub before: Option<NaiveDate>,
    /// Minimum size in bytes
    #[serde(alias = "min_size")]
    pub min_size: Option<u64>,
    #[serde(alias = "has_attachment")]
    pub has_attachment: Option<bool>,
    /// Relative age such as `30d`
    #[serde(alias = "older_than", deserialize_with = "empty_as_none")]
    pub older_than: Option<String>,
    /// Size with unit suffix such as `5M`
    #[serde(alias = "larger_than", deserialize_with = "empty_as_none")]
    pub larger_than: Option<String>,
    #[serde(deserialize_with = "empty_as_none")]
    pub category: Option<String>,
}

impl FilterSpec {
    /// A spec with only a sender constraint
    pub fn from_sender(sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..Default::default()
        }
    }

    /// Same constraints with the sender replaced
    pub fn with_sender(&self, sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..self.clone()
        }
    }

    /// True when no field constrains anything
    pub fn is_empty(&self) -> bool {
        *self == FilterSpec::default()
    }

    /// Compile into a Gmail search query
    ///
    /// # Errors
    /// `InvalidFilter` when the date range is inverted, a relative field is
    /// malformed, the category is unknown, or a text field sanitises to
    /// nothing.
    pub fn compile(&self) -> Result<GmailQuery> {
        compile(self)
    }
}

/// Compile a filter spec into a Gmail search query. Pure.
pub fn compile(spec: &FilterSpec) -> Result<GmailQuery> {
    let mut query = GmailQuery::default();

    if let Some(sender) = &spec.sender {
        let token = sanitize(sender)
            .ok_or_else(|| GmailError::InvalidFilter("sender is empty".to_string()))?;
        query = query.and(format!("from:{}", quote_if_needed(&token)));
    }

    if let Some(subject) = &spec.subject {
        let text = sanitize(subject)
            .ok_or_else(|| GmailError::InvalidFilter("subject is empty".to_string()))?;
        query = query.and(format!("subject:\"{}\"", text));
    }

    if let (Some(after), Some(before)) = (spec.after, spec.before) {
        if after > before {
            return Err(GmailError::InvalidFilter(format!(
                "after ({}) is later than before ({})",
                after, before
            )));
        }
    }
    if let Some(after) = spec.after {
        query = query.and(format!("after:{}", after.format("%Y/%m/%d")));
    }
    if let Some(before) = spec.before {
        let exclusive = before.succ_opt().unwrap_or(before);
        query = query.and(format!("before:{}", exclusive.format("%Y/%m/%d")));
    }

    if let Some(older_than) = &spec.older_than {
        let older_than = older_than.trim();
        if !OLDER_THAN.is_match(older_than) {
            return Err(GmailError::InvalidFilter(format!(
                "older_than must look like '30d', got {:?}",
                older_than
            )));
        }
        query = query.and(format!("older_than:{}", older_than));
    }

    if let Some(min_size) = spec.min_size {
        query = query.and(format!("larger:{}", min_size));
    }

    if let Some(larger_than) = &spec.larger_than {
        let larger_than = larger_than.trim();
        if !LARGER_THAN.is_match(larger_than) {
            return Err(GmailError::InvalidFilter(format!(
                "larger_than must look like '5M', got {:?}",
                larger_than
            )));
        }
        query = query.and(format!("larger:{}", larger_than.to_ascii_uppercase()));
    }

    match spec.has_attachment {
        Some(true) => query = query.and("has:attachment"),
        Some(false) => query = query.and("-has:attachment"),
        None => {}
    }

    if let Some(category) = &spec.category {
        let normalized = category.trim().to_lowercase();
        if !CATEGORIES.contains(&normalized.as_str()) {
            return Err(GmailError::InvalidFilter(format!(
                "unknown category {:?}; expected one of {}",
                category,
                CATEGORIES.join(", ")
            )));
        }
        query = query.and(format!("category:{}", normalized));
    }

    Ok(query)
}

/// Strip quotes and control characters; `None` if nothing is left
fn sanitize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '+' | '-' | '*')
}

fn quote_if_needed(token: &str) -> String {
    if token.chars().all(is_address_char) {
        token.to_string()
    } else {
        format!("\"{}\"", token)
    }
}

/// A compiled Gmail search expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GmailQuery(String);

impl GmailQuery {
    /// AND another term onto the query
    pub fn and(mut self, term: impl AsRef<str>) -> Self {
        let term = term.as_ref().trim();
        if term.is_empty() {
            return self;
        }
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        self.0.push_str(term);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GmailQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.filter(|s| !s.trim().is_empty()))
}

fn date_or_empty<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    match empty_as_none(deserializer)? {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%Y/%m/%d"))
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
