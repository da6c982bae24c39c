use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of background job the engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Scan,
    DeleteScan,
    Unsubscribe,
    Delete,
    MarkRead,
    Download,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Scan => "scan",
            JobKind::DeleteScan => "delete-scan",
            JobKind::Unsubscribe => "unsubscribe",
            JobKind::Delete => "delete",
            JobKind::MarkRead => "mark-read",
            JobKind::Download => "download",
        };
        f.write_str(name)
    }
}

/// A mutating action applied to messages in bulk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkAction {
    /// Move to trash
    Delete,
    /// Remove the UNREAD label
    MarkRead,
}

impl BulkAction {
    pub fn past_tense(&self) -> &'static str {
        match self {
            BulkAction::Delete => "deleted",
            BulkAction::MarkRead => "marked as read",
        }
    }
}

/// A message eligible for a job's action, as returned by listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    pub id: String,
    pub thread_id: Option<String>,
    /// Known when the listing query was by sender
    pub sender: Option<String>,
    pub size: Option<u64>,
}

impl CandidateMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
            sender: None,
            size: None,
        }
    }
}

/// One page of a message listing
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<CandidateMessage>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u64>,
}

/// Header-level view of a message used by the scan flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub thread_id: String,
    pub sender_email: String,
    pub sender_name: String,
    pub subject: String,
    pub size_estimate: u64,
    pub date_received: Option<DateTime<Utc>>,
    pub snippet: String,
    pub list_unsubscribe: Option<String>,
    pub list_unsubscribe_post: Option<String>,
}

impl MessageMetadata {
    pub fn sender_domain(&self) -> &str {
        self.sender_email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("")
    }
}

/// Where an unsubscribe link was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkSource {
    Header,
    Body,
}

/// An actionable unsubscribe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeLink {
    pub url: String,
    /// Sender advertised RFC 8058 one-click unsubscribe
    pub one_click: bool,
    pub source: LinkSource,
}

impl UnsubscribeLink {
    pub fn is_mailto(&self) -> bool {
        self.url.to_ascii_lowercase().starts_with("mailto:")
    }
}

/// Ways a single message advertises unsubscribing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAffordances {
    pub link: Option<String>,
    /// Raw `List-Unsubscribe` header value
    pub header: Option<String>,
    pub one_click: bool,
}

/// Aggregated statistics for one sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    pub sender: String,
    pub name: String,
    pub domain: String,
    pub count: u64,
    pub total_size: u64,
    pub sample_message_id: String,
    pub unsubscribe: Option<UnsubscribeLink>,
}

/// A single id that could not be mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of one batch call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_index: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchResult {
    pub fn all_succeeded(ids: &[String]) -> Self {
        Self {
            batch_index: 0,
            attempted: ids.len(),
            succeeded: ids.len(),
            failures: Vec::new(),
        }
    }

    pub fn all_failed(ids: &[String], reason: &str) -> Self {
        Self {
            batch_index: 0,
            attempted: ids.len(),
            succeeded: 0,
            failures: ids
                .iter()
                .map(|id| ItemFailure {
                    id: id.clone(),
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Requested number of messages: a number or `"all"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CountRepr", into = "CountRepr")]
pub enum CountLimit {
    Count(u64),
    All,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CountRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<CountRepr> for CountLimit {
    type Error = String;

    fn try_from(repr: CountRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            CountRepr::Number(n) => Ok(CountLimit::Count(n)),
            CountRepr::Text(s) if s.eq_ignore_ascii_case("all") => Ok(CountLimit::All),
            CountRepr::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(CountLimit::Count)
                .map_err(|_| format!("count must be a positive integer or \"all\", got {:?}", s)),
        }
    }
}

impl From<CountLimit> for CountRepr {
    fn from(limit: CountLimit) -> Self {
        match limit {
            CountLimit::Count(n) => CountRepr::Number(n),
            CountLimit::All => CountRepr::Text("all".to_string()),
        }
    }
}

impl std::str::FromStr for CountLimit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CountLimit::try_from(CountRepr::Text(s.to_string()))
    }
}

/// One sender to unsubscribe from
///
/// Both fields default to empty; a target without a link is reported as
/// such rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsubscribeTarget {
    pub domain: String,
    pub link: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_limit_accepts_number_and_all() {
        let n: CountLimit = serde_json::from_str("250").unwrap();
        assert_eq!(n, CountLimit::Count(250));

        let all: CountLimit = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, CountLimit::All);

        let upper: CountLimit = serde_json::from_str("\"ALL\"").unwrap();
        assert_eq!(upper, CountLimit::All);

        assert!(serde_json::from_str::<CountLimit>("\"lots\"").is_err());
        assert!(serde_json::from_str::<CountLimit>("-3").is_err());
    }

    #[test]
    fn test_count_limit_from_str() {
        assert_eq!("all".parse::<CountLimit>().unwrap(), CountLimit::All);
        assert_eq!("42".parse::<CountLimit>().unwrap(), CountLimit::Count(42));
        assert!("x".parse::<CountLimit>().is_err());
    }

    #[test]
    fn test_job_kind_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&JobKind::DeleteScan).unwrap(),
            "\"deleteScan\""
        );
        assert_eq!(JobKind::MarkRead.to_string(), "mark-read");
    }

    #[test]
    fn test_batch_result_helpers() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let ok = BatchResult::all_succeeded(&ids);
        assert_eq!(ok.succeeded, 2);
        assert_eq!(ok.failed(), 0);

        let bad = BatchResult::all_failed(&ids, "boom");
        assert_eq!(bad.attempted, 2);
        assert_eq!(bad.succeeded, 0);
        assert_eq!(bad.failures[1].id, "b");
        assert_eq!(bad.failures[1].reason, "boom");
    }

    #[test]
    fn test_sender_domain() {
        let meta = MessageMetadata {
            id: "1".to_string(),
            thread_id: "t".to_string(),
            sender_email: "news@shop.example.com".to_string(),
            sender_name: "Shop".to_string(),
            subject: String::new(),
            size_estimate: 0,
            date_received: None,
            snippet: String::new(),
            list_unsubscribe: None,
            list_unsubscribe_post: None,
        };
        assert_eq!(meta.sender_domain(), "shop.example.com");
    }
}
