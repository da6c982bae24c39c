//! Groups scanned messages by sender and ranks bulk senders

use std::collections::HashMap;

use crate::models::{LinkSource, MessageMetadata, SenderSummary, UnsubscribeLink};
use crate::unsubscribe;

/// Accumulates per-sender statistics during a scan
#[derive(Debug, Default)]
pub struct SenderAggregator {
    senders: HashMap<String, SenderSummary>,
}

impl SenderAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message into its sender's summary
    ///
    /// Messages without a sender address are ignored. The first message seen
    /// for a sender becomes its sample; a header link from any later message
    /// fills in a missing one.
    pub fn add(&mut self, message: &MessageMetadata) {
        let key = message.sender_email.trim().to_lowercase();
        if key.is_empty() {
            return;
        }

        let header_link = unsubscribe::link_from_affordances(
            &unsubscribe::affordances_from_headers(
                message.list_unsubscribe.as_deref(),
                message.list_unsubscribe_post.as_deref(),
            ),
            LinkSource::Header,
        );

        let summary = self.senders.entry(key.clone()).or_insert_with(|| SenderSummary {
            domain: key
                .rsplit_once('@')
                .map(|(_, d)| d.to_string())
                .unwrap_or_default(),
            sender: key,
            name: message.sender_name.clone(),
            count: 0,
            total_size: 0,
            sample_message_id: message.id.clone(),
            unsubscribe: None,
        });

        summary.count += 1;
        summary.total_size += message.size_estimate;
        if summary.name.is_empty() && !message.sender_name.is_empty() {
            summary.name = message.sender_name.clone();
        }
        if summary.unsubscribe.is_none() {
            summary.unsubscribe = header_link;
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Ranked summaries: count desc, then total size desc, then address asc
    pub fn finish(self) -> Vec<SenderSummary> {
        let mut ranked: Vec<SenderSummary> = self.senders.into_values().collect();
        rank(&mut ranked);
        ranked
    }
}

/// Sort summaries into ranking order
pub fn rank(summaries: &mut [SenderSummary]) {
    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| b.total_size.cmp(&a.total_size))
            .then_with(|| a.sender.cmp(&b.sender))
    });
}

/// Attach a link found in a message body to a summary lacking one
pub fn attach_body_link(summary: &mut SenderSummary, url: String) {
    if summary.unsubscribe.is_none() {
        summary.unsubscribe = Some(UnsubscribeLink {
            url,
            one_click: false,
            source: LinkSource::Body,
        });
    }
}
