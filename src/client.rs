//! Gmail API client with rate limiting and retry logic

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{BatchModifyMessagesRequest, Message, MessagePart, ModifyMessageRequest};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{GmailError, Result};
use crate::filters::GmailQuery;
use crate::models::{
    BatchResult, BulkAction, CandidateMessage, ItemFailure, MessageMetadata, MessagePage,
    UnsubscribeAffordances,
};
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};
use crate::unsubscribe;

const SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const READ_RETRIES: u32 = 3;

/// Narrow view of the mail provider used by the job engine
#[async_trait]
pub trait GmailClient: Send + Sync {
    /// One page of ids matching `query`
    async fn list_messages(
        &self,
        query: &GmailQuery,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<MessagePage>;

    /// Apply `action` to every id in one aggregated call.
    ///
    /// `Err` means the whole batch failed; per-item failures are reported
    /// inside the `BatchResult`.
    async fn batch_mutate(&self, ids: &[String], action: BulkAction) -> Result<BatchResult>;

    async fn get_unread_count(&self) -> Result<u64>;

    async fn get_total_count(&self) -> Result<u64>;

    async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata>;

    /// Header and body unsubscribe affordances of one message
    async fn fetch_unsubscribe_affordances(&self, id: &str) -> Result<UnsubscribeAffordances>;

    async fn get_profile_email(&self) -> Result<String>;
}

/// Production Gmail API client
///
/// Every call waits on the shared quota bucket and is bounded by a timeout.
/// Read calls retry transient errors; mutations leave retrying to the batch
/// executor.
pub struct ProductionGmailClient {
    hub: GmailHub,
    limiter: QuotaRateLimiter,
}

impl ProductionGmailClient {
    pub fn new(hub: GmailHub, limiter: QuotaRateLimiter) -> Self {
        Self { hub, limiter }
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempts <= max_retries => {
                    let wait = e
                        .retry_after()
                        .map(Duration::from_secs)
                        .map_or(delay, |hint| hint.max(delay));
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bound a provider call so a stalled connection cannot hang a job
    async fn timed<T, Fut>(operation_name: &str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        match tokio::time::timeout(CALL_TIMEOUT, call).await {
            Ok(result) => result.map_err(GmailError::from),
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", operation_name, CALL_TIMEOUT);
                Err(GmailError::NetworkError(format!(
                    "{} timed out after {:?}",
                    operation_name, CALL_TIMEOUT
                )))
            }
        }
    }

    async fn modify_batch(&self, ids: &[String], action: BulkAction) -> Result<()> {
        let (add, remove) = label_change(action);
        let request = BatchModifyMessagesRequest {
            ids: Some(ids.to_vec()),
            add_label_ids: add,
            remove_label_ids: remove,
        };

        self.limiter.acquire(QuotaCost::BatchModify).await;
        Self::timed(
            "batch_modify",
            self.hub
                .users()
                .messages_batch_modify(request, "me")
                .add_scope(SCOPE)
                .doit(),
        )
        .await?;
        Ok(())
    }

    async fn modify_one(&self, id: &str, action: BulkAction) -> Result<()> {
        let (add, remove) = label_change(action);
        let request = ModifyMessageRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        };

        self.limiter.acquire(QuotaCost::Get).await;
        Self::timed(
            "modify",
            self.hub
                .users()
                .messages_modify(request, "me", id)
                .add_scope(SCOPE)
                .doit(),
        )
        .await?;
        Ok(())
    }

    /// Retry a rejected batch id by id so one bad id does not fail the rest
    async fn isolate_failures(&self, ids: &[String], action: BulkAction) -> Result<BatchResult> {
        let mut result = BatchResult {
            attempted: ids.len(),
            ..Default::default()
        };

        for id in ids {
            match self.modify_one(id, action).await {
                Ok(()) => result.succeeded += 1,
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    debug!("Message {} could not be {}: {}", id, action.past_tense(), e);
                    result.failures.push(ItemFailure {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }

    async fn get_message(&self, id: &str, format: &str, headers: &[&str]) -> Result<Message> {
        Self::with_retry("messages_get", READ_RETRIES, || async {
            self.limiter.acquire(QuotaCost::Get).await;
            let mut call = self.hub.users().messages_get("me", id).format(format);
            for header in headers {
                call = call.add_metadata_headers(header);
            }
            let (_, message) = Self::timed("messages_get", call.add_scope(SCOPE).doit()).await?;
            Ok(message)
        })
        .await
    }
}

/// Labels added and removed for an action
///
/// Delete moves to trash; mark-read drops UNREAD.
fn label_change(action: BulkAction) -> (Option<Vec<String>>, Option<Vec<String>>) {
    match action {
        BulkAction::Delete => (Some(vec!["TRASH".to_string()]), None),
        BulkAction::MarkRead => (None, Some(vec!["UNREAD".to_string()])),
    }
}

fn header_value<'a>(part: Option<&'a MessagePart>, name: &str) -> Option<&'a str> {
    part?
        .headers
        .as_ref()?
        .iter()
        .find(|h| {
            h.name
                .as_deref()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
        .and_then(|h| h.value.as_deref())
}

/// Parse "Name <email@example.com>" into (name, lowercased email)
pub fn parse_from_header(value: &str) -> (String, String) {
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            let name = value[..start].trim().trim_matches('"').to_string();
            let email = value[start + 1..end].trim().to_lowercase();
            return (name, email);
        }
    }
    (String::new(), value.trim().to_lowercase())
}

/// Parse an RFC 2822 date, falling back to RFC 3339
fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .or_else(|_| DateTime::parse_from_rfc3339(date_str))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

pub(crate) fn parse_message_metadata(msg: Message) -> Result<MessageMetadata> {
    let id = msg
        .id
        .clone()
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing message ID".to_string()))?;
    let thread_id = msg.thread_id.clone().unwrap_or_default();
    let payload = msg.payload.as_ref();

    let (sender_name, sender_email) = header_value(payload, "From")
        .map(parse_from_header)
        .unwrap_or_default();

    let date_received = header_value(payload, "Date").and_then(parse_date).or_else(|| {
        msg.internal_date
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    });

    Ok(MessageMetadata {
        id,
        thread_id,
        sender_email,
        sender_name,
        subject: header_value(payload, "Subject").unwrap_or_default().to_string(),
        size_estimate: msg.size_estimate.unwrap_or(0).max(0) as u64,
        date_received,
        snippet: msg.snippet.clone().unwrap_or_default(),
        list_unsubscribe: header_value(payload, "List-Unsubscribe").map(str::to_string),
        list_unsubscribe_post: header_value(payload, "List-Unsubscribe-Post").map(str::to_string),
    })
}

/// Decoded text/html and text/plain parts, html first
fn body_texts(part: &MessagePart, out: &mut Vec<(bool, String)>) {
    let mime = part.mime_type.as_deref().unwrap_or("").to_ascii_lowercase();
    if mime == "text/html" || mime == "text/plain" {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
            out.push((mime == "text/html", String::from_utf8_lossy(data).into_owned()));
        }
    }
    for child in part.parts.iter().flatten() {
        body_texts(child, out);
    }
}

#[async_trait]
impl GmailClient for ProductionGmailClient {
    async fn list_messages(
        &self,
        query: &GmailQuery,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<MessagePage> {
        Self::with_retry("messages_list", READ_RETRIES, || async {
            self.limiter.acquire(QuotaCost::List).await;

            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .max_results(page_size)
                .include_spam_trash(false);
            if !query.is_empty() {
                call = call.q(query.as_str());
            }
            if let Some(token) = page_token.as_deref() {
                call = call.page_token(token);
            }

            let (_, response) = Self::timed("messages_list", call.add_scope(SCOPE).doit()).await?;

            let messages = response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| {
                    m.id.map(|id| CandidateMessage {
                        id,
                        thread_id: m.thread_id,
                        sender: None,
                        size: m.size_estimate.map(|s| s.max(0) as u64),
                    })
                })
                .collect();

            Ok(MessagePage {
                messages,
                next_page_token: response.next_page_token,
                result_size_estimate: response.result_size_estimate.map(u64::from),
            })
        })
        .await
    }

    async fn batch_mutate(&self, ids: &[String], action: BulkAction) -> Result<BatchResult> {
        if ids.is_empty() {
            return Ok(BatchResult::default());
        }

        match self.modify_batch(ids, action).await {
            Ok(()) => Ok(BatchResult::all_succeeded(ids)),
            Err(e @ (GmailError::BadRequest(_) | GmailError::MessageNotFound(_))) => {
                warn!(
                    "Batch of {} rejected ({}), retrying ids individually",
                    ids.len(),
                    e
                );
                self.isolate_failures(ids, action).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_unread_count(&self) -> Result<u64> {
        Self::with_retry("labels_get", READ_RETRIES, || async {
            self.limiter.acquire(QuotaCost::Get).await;
            let (_, label) = Self::timed(
                "labels_get",
                self.hub.users().labels_get("me", "UNREAD").add_scope(SCOPE).doit(),
            )
            .await?;
            Ok(label.messages_total.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn get_total_count(&self) -> Result<u64> {
        Self::with_retry("get_profile", READ_RETRIES, || async {
            self.limiter.acquire(QuotaCost::Profile).await;
            let (_, profile) = Self::timed(
                "get_profile",
                self.hub.users().get_profile("me").add_scope(SCOPE).doit(),
            )
            .await?;
            Ok(profile.messages_total.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata> {
        let message = self
            .get_message(
                id,
                "metadata",
                &["From", "Subject", "Date", "List-Unsubscribe", "List-Unsubscribe-Post"],
            )
            .await?;
        parse_message_metadata(message)
    }

    async fn fetch_unsubscribe_affordances(&self, id: &str) -> Result<UnsubscribeAffordances> {
        let message = self.get_message(id, "full", &[]).await?;
        let payload = message.payload.as_ref();

        let from_headers = unsubscribe::affordances_from_headers(
            header_value(payload, "List-Unsubscribe"),
            header_value(payload, "List-Unsubscribe-Post"),
        );
        if from_headers.link.is_some() {
            return Ok(from_headers);
        }

        let mut bodies = Vec::new();
        if let Some(part) = payload {
            body_texts(part, &mut bodies);
        }
        // html parts first, they carry the anchors
        bodies.sort_by_key(|(is_html, _)| !*is_html);

        let link = bodies
            .iter()
            .find_map(|(_, text)| unsubscribe::find_body_link(text))
            .or_else(|| message.snippet.as_deref().and_then(unsubscribe::find_body_link));

        Ok(UnsubscribeAffordances {
            link,
            header: from_headers.header,
            one_click: false,
        })
    }

    async fn get_profile_email(&self) -> Result<String> {
        Self::with_retry("get_profile", READ_RETRIES, || async {
            self.limiter.acquire(QuotaCost::Profile).await;
            let (_, profile) = Self::timed(
                "get_profile",
                self.hub.users().get_profile("me").add_scope(SCOPE).doit(),
            )
            .await?;
            profile
                .email_address
                .ok_or_else(|| GmailError::ApiError("Profile has no email address".to_string()))
        })
        .await
    }
}
