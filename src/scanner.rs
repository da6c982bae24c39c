//! Paged message listing and concurrent metadata fetching

use async_stream::stream;
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::GmailClient;
use crate::error::Result;
use crate::filters::GmailQuery;
use crate::models::{CandidateMessage, MessageMetadata, MessagePage};

/// Walks listing pages and fetches message headers
#[derive(Clone)]
pub struct MessageScanner {
    client: Arc<dyn GmailClient>,
    page_size: u32,
    concurrency: usize,
}

impl MessageScanner {
    pub fn new(client: Arc<dyn GmailClient>, page_size: u32, concurrency: usize) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Stream listing pages until `limit` ids were yielded or pages run out
    ///
    /// The last page is truncated to the limit. A listing error is yielded
    /// once and ends the stream.
    pub fn pages(
        &self,
        query: GmailQuery,
        limit: u64,
    ) -> Pin<Box<dyn Stream<Item = Result<MessagePage>> + Send + '_>> {
        Box::pin(stream! {
            let mut page_token: Option<String> = None;
            let mut remaining = limit;

            while remaining > 0 {
                let page_size = self.page_size.min(remaining.min(u32::MAX as u64) as u32);
                debug!("Listing up to {} messages for {:?}", page_size, query.as_str());

                match self.client.list_messages(&query, page_token.take(), page_size).await {
                    Ok(mut page) => {
                        if page.messages.len() as u64 > remaining {
                            page.messages.truncate(remaining as usize);
                        }
                        remaining -= page.messages.len() as u64;

                        let next = page.next_page_token.clone();
                        let empty = page.messages.is_empty();
                        yield Ok(page);

                        match next {
                            Some(token) if !empty => page_token = Some(token),
                            _ => break,
                        }
                    }
                    Err(e) => {
                        warn!("Error listing messages: {}", e);
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Collect up to `limit` distinct candidates matching `query`
    ///
    /// `on_page` receives the running total after each page.
    pub async fn collect_candidates<F>(
        &self,
        query: &GmailQuery,
        limit: u64,
        mut on_page: F,
    ) -> Result<Vec<CandidateMessage>>
    where
        F: FnMut(usize),
    {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut pages = self.pages(query.clone(), limit);

        while let Some(page) = pages.next().await {
            for message in page?.messages {
                if seen.insert(message.id.clone()) {
                    candidates.push(message);
                }
            }
            on_page(candidates.len());
        }

        info!("Found {} candidate messages for {:?}", candidates.len(), query.as_str());
        Ok(candidates)
    }

    /// Fetch header metadata for `ids`, preserving their order
    ///
    /// At most `concurrency` requests are in flight. A message that cannot
    /// be fetched is skipped; a systemic error aborts.
    pub async fn fetch_metadata<F>(&self, ids: Vec<String>, mut on_fetched: F) -> Result<Vec<MessageMetadata>>
    where
        F: FnMut(usize),
    {
        let total = ids.len();
        let client = &self.client;

        let mut results = stream::iter(ids)
            .map(|id| async move {
                let result = client.get_message_metadata(&id).await;
                (id, result)
            })
            .buffered(self.concurrency);

        let mut messages = Vec::with_capacity(total);
        let mut done = 0;
        let mut skipped = 0;

        while let Some((id, result)) = results.next().await {
            done += 1;
            match result {
                Ok(message) => messages.push(message),
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    skipped += 1;
                    warn!("Failed to fetch message {}: {}", id, e);
                }
            }
            on_fetched(done);
        }

        if skipped > 0 {
            warn!("Skipped {} of {} messages that could not be fetched", skipped, total);
        }
        Ok(messages)
    }
}
