//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use gmail_bulk::client::GmailClient;
use gmail_bulk::config::Config;
use gmail_bulk::engine::JobEngine;
use gmail_bulk::error::{GmailError, Result};
use gmail_bulk::filters::GmailQuery;
use gmail_bulk::models::{
    BatchResult, BulkAction, CandidateMessage, ItemFailure, MessageMetadata, MessagePage,
    UnsubscribeAffordances, UnsubscribeLink,
};
use gmail_bulk::poller::{self, PollSettings};
use gmail_bulk::progress::{JobStatus, ProgressStore};
use gmail_bulk::unsubscribe::{UnsubscribeOutcome, Unsubscriber};
use mockall::mock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Create a test message with default values
pub fn create_test_message(id: &str, sender: &str, size: u64) -> MessageMetadata {
    MessageMetadata {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        sender_email: sender.to_string(),
        sender_name: String::new(),
        subject: "Weekly Newsletter".to_string(),
        size_estimate: size,
        date_received: None,
        snippet: String::new(),
        list_unsubscribe: None,
        list_unsubscribe_post: None,
    }
}

/// A newsletter carrying a one-click List-Unsubscribe header
pub fn create_newsletter_message(id: &str, sender: &str, link: &str) -> MessageMetadata {
    let mut message = create_test_message(id, sender, 1000);
    message.list_unsubscribe = Some(format!("<{}>", link));
    message.list_unsubscribe_post = Some("List-Unsubscribe=One-Click".to_string());
    message
}

/// Sequential ids `{prefix}000`, `{prefix}001`, ...
pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{:03}", prefix, i)).collect()
}

/// Config tuned for tests: tiny retry delays
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.jobs.retry_base_delay_ms = 1;
    config.jobs.retry_max_delay_ms = 2;
    config
}

pub fn engine_with(client: Arc<dyn GmailClient>, unsubscriber: Arc<dyn Unsubscriber>) -> JobEngine {
    JobEngine::new(client, unsubscriber, ProgressStore::new(), &test_config())
}

/// Poll the engine until its job ends, recording every snapshot
pub async fn wait_for_job(engine: &JobEngine) -> (JobStatus, Vec<JobStatus>) {
    let mut seen = Vec::new();
    let settings = PollSettings {
        interval: Duration::from_millis(1),
        ..Default::default()
    };

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        poller::poll_until_done(
            settings,
            || {
                let status = engine.status();
                async move { Ok(status) }
            },
            |s| seen.push(s.clone()),
        ),
    )
    .await
    .expect("job did not finish in time")
    .expect("polling failed");

    (status, seen)
}

#[derive(Default)]
struct FakeState {
    listings: HashMap<String, Vec<String>>,
    metadata: HashMap<String, MessageMetadata>,
    affordances: HashMap<String, UnsubscribeAffordances>,
    item_failures: HashSet<String>,
    transient_batch_failures: u32,
    unread: u64,
    total: u64,
    list_queries: Vec<String>,
    batches: Vec<(Vec<String>, BulkAction)>,
    batch_calls: usize,
    affordance_lookups: Vec<String>,
}

/// In-memory provider with scripted failures
///
/// Listings are keyed by the exact compiled query string and paged by
/// offset tokens.
pub struct FakeGmailClient {
    state: Mutex<FakeState>,
    gate: Option<Arc<Notify>>,
    panic_on_list: bool,
}

impl FakeGmailClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                total: 1_000_000,
                ..Default::default()
            }),
            gate: None,
            panic_on_list: false,
        }
    }

    pub fn with_listing(self, query: &str, ids: Vec<String>) -> Self {
        self.state.lock().unwrap().listings.insert(query.to_string(), ids);
        self
    }

    /// Register messages under `query` and make their metadata fetchable
    pub fn with_messages(self, query: &str, messages: Vec<MessageMetadata>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ids = messages.iter().map(|m| m.id.clone()).collect();
            state.listings.insert(query.to_string(), ids);
            for message in messages {
                state.metadata.insert(message.id.clone(), message);
            }
        }
        self
    }

    pub fn with_affordances(self, id: &str, affordances: UnsubscribeAffordances) -> Self {
        self.state
            .lock()
            .unwrap()
            .affordances
            .insert(id.to_string(), affordances);
        self
    }

    /// Ids the provider reports as failed inside otherwise successful batches
    pub fn with_item_failures(self, ids: &[String]) -> Self {
        self.state
            .lock()
            .unwrap()
            .item_failures
            .extend(ids.iter().cloned());
        self
    }

    /// The next `n` batch calls fail with a 503
    pub fn with_transient_batch_failures(self, n: u32) -> Self {
        self.state.lock().unwrap().transient_batch_failures = n;
        self
    }

    pub fn with_counts(self, unread: u64, total: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.unread = unread;
            state.total = total;
        }
        self
    }

    /// Hold every listing call until the gate is notified
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn panicking_on_list(mut self) -> Self {
        self.panic_on_list = true;
        self
    }

    pub fn list_queries(&self) -> Vec<String> {
        self.state.lock().unwrap().list_queries.clone()
    }

    /// Successful batch calls, in order
    pub fn batches(&self) -> Vec<(Vec<String>, BulkAction)> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Every batch call, including failed attempts
    pub fn batch_calls(&self) -> usize {
        self.state.lock().unwrap().batch_calls
    }

    pub fn affordance_lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().affordance_lookups.clone()
    }
}

impl Default for FakeGmailClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GmailClient for FakeGmailClient {
    async fn list_messages(
        &self,
        query: &GmailQuery,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<MessagePage> {
        if self.panic_on_list {
            panic!("listing exploded");
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        state.list_queries.push(query.as_str().to_string());

        let all = state.listings.get(query.as_str()).cloned().unwrap_or_default();
        let offset: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (offset + page_size as usize).min(all.len());
        let messages = all[offset.min(end)..end]
            .iter()
            .map(|id| CandidateMessage::new(id.clone()))
            .collect();

        Ok(MessagePage {
            messages,
            next_page_token: (end < all.len()).then(|| end.to_string()),
            result_size_estimate: Some(all.len() as u64),
        })
    }

    async fn batch_mutate(&self, ids: &[String], action: BulkAction) -> Result<BatchResult> {
        let mut state = self.state.lock().unwrap();
        state.batch_calls += 1;

        if state.transient_batch_failures > 0 {
            state.transient_batch_failures -= 1;
            return Err(GmailError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }

        state.batches.push((ids.to_vec(), action));
        let failures: Vec<ItemFailure> = ids
            .iter()
            .filter(|id| state.item_failures.contains(*id))
            .map(|id| ItemFailure {
                id: id.clone(),
                reason: "Message not found".to_string(),
            })
            .collect();

        Ok(BatchResult {
            batch_index: 0,
            attempted: ids.len(),
            succeeded: ids.len() - failures.len(),
            failures,
        })
    }

    async fn get_unread_count(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().unread)
    }

    async fn get_total_count(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().total)
    }

    async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .get(id)
            .cloned()
            .ok_or_else(|| GmailError::MessageNotFound(id.to_string()))
    }

    async fn fetch_unsubscribe_affordances(&self, id: &str) -> Result<UnsubscribeAffordances> {
        let mut state = self.state.lock().unwrap();
        state.affordance_lookups.push(id.to_string());
        Ok(state.affordances.get(id).cloned().unwrap_or_default())
    }

    async fn get_profile_email(&self) -> Result<String> {
        Ok("me@example.com".to_string())
    }
}

/// Unsubscriber that records links instead of making requests
///
/// mailto links need manual action; links containing "broken" fail.
#[derive(Default)]
pub struct RecordingUnsubscriber {
    calls: Mutex<Vec<UnsubscribeLink>>,
}

impl RecordingUnsubscriber {
    pub fn calls(&self) -> Vec<UnsubscribeLink> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Unsubscriber for RecordingUnsubscriber {
    async fn unsubscribe(&self, link: &UnsubscribeLink) -> Result<UnsubscribeOutcome> {
        self.calls.lock().unwrap().push(link.clone());
        if link.is_mailto() {
            return Ok(UnsubscribeOutcome::ManualRequired {
                url: link.url.clone(),
            });
        }
        if link.url.contains("broken") {
            return Err(GmailError::Unsubscribe(format!("{} returned HTTP 404", link.url)));
        }
        Ok(UnsubscribeOutcome::Unsubscribed {
            status: 200,
            one_click: link.one_click,
        })
    }
}

mock! {
    pub Provider {}

    #[async_trait]
    impl GmailClient for Provider {
        async fn list_messages(
            &self,
            query: &GmailQuery,
            page_token: Option<String>,
            page_size: u32,
        ) -> Result<MessagePage>;
        async fn batch_mutate(&self, ids: &[String], action: BulkAction) -> Result<BatchResult>;
        async fn get_unread_count(&self) -> Result<u64>;
        async fn get_total_count(&self) -> Result<u64>;
        async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata>;
        async fn fetch_unsubscribe_affordances(&self, id: &str) -> Result<UnsubscribeAffordances>;
        async fn get_profile_email(&self) -> Result<String>;
    }
}
