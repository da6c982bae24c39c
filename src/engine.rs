//! Job engine: one long-running bulk operation at a time
//!
//! Each `start_*` call claims the progress slot, validates what it can
//! synchronously, then spawns the job on the tokio runtime and returns the
//! job id. The job reports through its [`ProgressWriter`] and always ends in
//! Done or Failed, including when the task panics.

use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{self, SenderAggregator};
use crate::batch::{BatchExecutor, RetryPolicy};
use crate::client::GmailClient;
use crate::config::{Config, JobsConfig};
use crate::error::{GmailError, Result};
use crate::export::CsvExport;
use crate::filters::{FilterSpec, GmailQuery};
use crate::models::{
    BulkAction, CountLimit, JobKind, LinkSource, MessageMetadata, SenderSummary, UnsubscribeLink,
    UnsubscribeTarget,
};
use crate::progress::{JobStatus, ProgressStore, ProgressWriter};
use crate::scanner::MessageScanner;
use crate::unsubscribe::{UnsubscribeOutcome, Unsubscriber};

/// Search term that narrows a scan to mail carrying unsubscribe text
const UNSUBSCRIBE_TERM: &str = "unsubscribe";

/// Mark up to `count` unread messages matching `filters` as read
#[derive(Debug, Clone)]
pub struct MarkReadRequest {
    pub count: CountLimit,
    pub filters: FilterSpec,
}

/// Delete everything from `senders`, each ANDed with `filters`
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub senders: Vec<String>,
    pub filters: FilterSpec,
}

/// Back up metadata of mail from `senders` (each ANDed with `filters`) as CSV
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub senders: Vec<String>,
    pub filters: FilterSpec,
    /// At most this many messages
    pub limit: u64,
}

/// What a scan's results are meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPurpose {
    /// Only mail mentioning unsubscribe; links are looked up
    Unsubscribe,
    /// All matching mail
    Delete,
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub limit: u64,
    pub filters: FilterSpec,
    pub purpose: ScanPurpose,
}

/// Orchestrates bulk jobs against the provider
#[derive(Clone)]
pub struct JobEngine {
    client: Arc<dyn GmailClient>,
    unsubscriber: Arc<dyn Unsubscriber>,
    store: ProgressStore,
    jobs: JobsConfig,
    scan_concurrency: usize,
}

impl JobEngine {
    pub fn new(
        client: Arc<dyn GmailClient>,
        unsubscriber: Arc<dyn Unsubscriber>,
        store: ProgressStore,
        config: &Config,
    ) -> Self {
        Self {
            client,
            unsubscriber,
            store,
            jobs: config.jobs.clone(),
            scan_concurrency: config.scan.concurrency,
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn client(&self) -> &Arc<dyn GmailClient> {
        &self.client
    }

    pub fn status(&self) -> JobStatus {
        self.store.status()
    }

    /// Ranked senders from the last unsubscribe scan
    pub fn results(&self) -> Arc<Vec<SenderSummary>> {
        self.store.results()
    }

    /// Ranked senders from the last delete scan
    pub fn delete_scan_results(&self) -> Arc<Vec<SenderSummary>> {
        self.store.delete_scan_results()
    }

    /// CSV from the last finished download
    pub fn export(&self) -> Option<Arc<CsvExport>> {
        self.store.export()
    }

    pub async fn unread_count(&self) -> Result<u64> {
        self.client.get_unread_count().await
    }

    fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(
            Arc::clone(&self.client),
            self.jobs.batch_size,
            RetryPolicy::from_config(&self.jobs),
        )
    }

    fn scanner(&self) -> MessageScanner {
        MessageScanner::new(Arc::clone(&self.client), self.jobs.page_size, self.scan_concurrency)
    }

    fn validate_count(&self, count: CountLimit) -> Result<()> {
        match count {
            CountLimit::Count(0) => Err(GmailError::InvalidRequest(
                "count must be at least 1".to_string(),
            )),
            CountLimit::Count(n) if n > self.jobs.max_count => Err(GmailError::InvalidRequest(
                format!("count must be at most {}", self.jobs.max_count),
            )),
            _ => Ok(()),
        }
    }

    /// Compile `spec`; on failure the claimed slot goes straight to Failed
    fn compile_or_fail(writer: &ProgressWriter, spec: &FilterSpec) -> Result<GmailQuery> {
        spec.compile().map_err(|e| {
            writer.fail(e.to_string());
            e
        })
    }

    /// Run `job` in the background and record how it ended
    fn spawn<F, Fut>(&self, writer: ProgressWriter, job: F) -> Uuid
    where
        F: FnOnce(JobEngine, Arc<ProgressWriter>) -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let job_id = writer.job_id();
        let span = info_span!("job", id = %job_id, kind = %writer.kind());
        let writer = Arc::new(writer);
        let task = job(self.clone(), Arc::clone(&writer));

        tokio::spawn(
            async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(summary)) => writer.complete(summary),
                    Ok(Err(e)) => writer.fail(e.to_string()),
                    Err(panic) => writer.fail(format!("internal error: {}", panic_message(&*panic))),
                }
            }
            .instrument(span),
        );

        job_id
    }

    /// Start a mark-read job
    pub fn start_mark_read(&self, request: MarkReadRequest) -> Result<Uuid> {
        self.validate_count(request.count)?;
        let writer = self
            .store
            .try_begin(JobKind::MarkRead, "Looking for unread messages")?;
        let query = Self::compile_or_fail(&writer, &request.filters)?.and("is:unread");

        Ok(self.spawn(writer, move |engine, writer| async move {
            engine
                .run_bulk(&writer, vec![query], BulkAction::MarkRead, request.count)
                .await
        }))
    }

    /// One query per distinct sender, or the filters alone without senders
    ///
    /// Senders are trimmed and deduplicated case-insensitively. `None` means
    /// neither senders nor filters were given.
    fn sender_queries(
        writer: &ProgressWriter,
        senders: &[String],
        filters: &FilterSpec,
    ) -> Result<Option<Vec<GmailQuery>>> {
        let mut seen = HashSet::new();
        let senders: Vec<&str> = senders
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
            .collect();

        if senders.is_empty() {
            if filters.is_empty() {
                return Ok(None);
            }
            return Ok(Some(vec![Self::compile_or_fail(writer, filters)?]));
        }

        senders
            .iter()
            .map(|sender| Self::compile_or_fail(writer, &filters.with_sender(*sender)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Start a delete job for one or more senders
    ///
    /// With no senders the shared filters alone select the mail; with
    /// neither the job finishes at once without touching anything.
    pub fn start_delete(&self, request: DeleteRequest) -> Result<Uuid> {
        let writer = self.store.try_begin(JobKind::Delete, "Looking for messages")?;

        let Some(queries) = Self::sender_queries(&writer, &request.senders, &request.filters)?
        else {
            writer.complete("Nothing to delete: no senders or filters given");
            return Ok(writer.job_id());
        };

        Ok(self.spawn(writer, move |engine, writer| async move {
            engine
                .run_bulk(&writer, queries, BulkAction::Delete, CountLimit::All)
                .await
        }))
    }

    /// Start a CSV backup of mail from one or more senders
    pub fn start_download(&self, request: DownloadRequest) -> Result<Uuid> {
        if request.limit == 0 || request.limit > self.jobs.max_count {
            return Err(GmailError::InvalidRequest(format!(
                "limit must be between 1 and {}",
                self.jobs.max_count
            )));
        }

        let writer = self
            .store
            .try_begin(JobKind::Download, "Looking for messages")?;

        let Some(queries) = Self::sender_queries(&writer, &request.senders, &request.filters)?
        else {
            writer.complete("Nothing to download: no senders or filters given");
            return Ok(writer.job_id());
        };

        Ok(self.spawn(writer, move |engine, writer| async move {
            engine.run_download(&writer, queries, request.limit).await
        }))
    }

    /// Start a sender scan
    pub fn start_scan(&self, request: ScanRequest) -> Result<Uuid> {
        if request.limit == 0 || request.limit > self.jobs.max_scan_limit {
            return Err(GmailError::InvalidRequest(format!(
                "limit must be between 1 and {}",
                self.jobs.max_scan_limit
            )));
        }

        let kind = match request.purpose {
            ScanPurpose::Unsubscribe => JobKind::Scan,
            ScanPurpose::Delete => JobKind::DeleteScan,
        };
        let writer = self.store.try_begin(kind, "Listing messages")?;
        let mut query = Self::compile_or_fail(&writer, &request.filters)?;
        if request.purpose == ScanPurpose::Unsubscribe {
            query = query.and(UNSUBSCRIBE_TERM);
        }

        Ok(self.spawn(writer, move |engine, writer| async move {
            engine
                .run_scan(&writer, query, request.limit, request.purpose)
                .await
        }))
    }

    /// Start unsubscribing from several senders
    pub fn start_unsubscribe_bulk(&self, targets: Vec<UnsubscribeTarget>) -> Result<Uuid> {
        let writer = self
            .store
            .try_begin(JobKind::Unsubscribe, "Preparing to unsubscribe")?;

        if targets.is_empty() {
            writer.complete("Nothing to unsubscribe from");
            return Ok(writer.job_id());
        }

        Ok(self.spawn(writer, move |engine, writer| async move {
            engine.run_unsubscribe_bulk(&writer, targets).await
        }))
    }

    /// Unsubscribe from one sender right away, outside the job slot
    pub async fn unsubscribe_single(&self, target: &UnsubscribeTarget) -> Result<UnsubscribeOutcome> {
        let link = self.resolve_link(target)?;
        info!("Unsubscribing from {} via {}", target.domain, link.url);
        self.unsubscriber.unsubscribe(&link).await
    }

    /// Build the link for a target, reusing what the last scan learned about it
    fn resolve_link(&self, target: &UnsubscribeTarget) -> Result<UnsubscribeLink> {
        let url = target.link.trim();
        if url.is_empty() {
            return Err(GmailError::InvalidRequest(format!(
                "no unsubscribe link for {}",
                target.domain
            )));
        }

        let known = self
            .store
            .results()
            .iter()
            .filter_map(|s| s.unsubscribe.clone())
            .find(|l| l.url == url);

        Ok(known.unwrap_or_else(|| UnsubscribeLink {
            url: url.to_string(),
            one_click: false,
            source: LinkSource::Header,
        }))
    }

    /// How many messages "all" means for `action`, capped
    async fn resolve_target(&self, action: BulkAction, count: CountLimit) -> Result<u64> {
        let target = match count {
            CountLimit::Count(n) => n,
            CountLimit::All => match action {
                BulkAction::MarkRead => self.client.get_unread_count().await?,
                BulkAction::Delete => self.client.get_total_count().await?,
            },
        };
        Ok(target.min(self.jobs.max_count))
    }

    async fn run_bulk(
        &self,
        writer: &ProgressWriter,
        queries: Vec<GmailQuery>,
        action: BulkAction,
        count: CountLimit,
    ) -> Result<String> {
        let target = self.resolve_target(action, count).await?;
        debug!("Target is {} messages over {} queries", target, queries.len());

        let ids = self.collect_ids(writer, &queries, target).await?;
        if ids.is_empty() {
            return Ok("No matching messages found".to_string());
        }

        let total = ids.len() as u64;
        info!("{} {} messages", total, action.past_tense());
        writer.set_message(format!("Processing {} messages", total));

        let (mut processed, mut succeeded, mut failed) = (0u64, 0u64, 0u64);
        let totals = self
            .executor()
            .run(&ids, action, |result| {
                processed += result.attempted as u64;
                succeeded += result.succeeded as u64;
                failed += result.failed() as u64;
                writer.set_counts(processed, succeeded, failed);
                writer.set_progress(
                    percent(processed, total),
                    format!("Processed {} of {} messages", processed, total),
                );
            })
            .await?;

        for failure in totals.failures.iter().take(5) {
            warn!("Message {} failed: {}", failure.id, failure.reason);
        }

        let mut summary = format!("{} messages {}", totals.succeeded, action.past_tense());
        if totals.failed > 0 {
            summary.push_str(&format!(", {} failed", totals.failed));
        }
        Ok(summary)
    }

    /// Distinct ids over `queries`, in listing order, at most `target`
    async fn collect_ids(
        &self,
        writer: &ProgressWriter,
        queries: &[GmailQuery],
        target: u64,
    ) -> Result<Vec<String>> {
        let scanner = self.scanner();
        let mut seen = HashSet::new();
        let mut ids: Vec<String> = Vec::new();

        for query in queries {
            let remaining = target.saturating_sub(ids.len() as u64);
            if remaining == 0 {
                break;
            }
            let before = ids.len();
            let candidates = scanner
                .collect_candidates(query, remaining, |found| {
                    writer.set_message(format!("Found {} messages", before + found));
                })
                .await?;
            ids.extend(
                candidates
                    .into_iter()
                    .map(|c| c.id)
                    .filter(|id| seen.insert(id.clone())),
            );
        }
        Ok(ids)
    }

    /// Read metadata for `ids` while moving progress from 10 to 90
    async fn read_metadata(
        &self,
        writer: &ProgressWriter,
        ids: Vec<String>,
    ) -> Result<Vec<MessageMetadata>> {
        let total = ids.len() as u64;
        writer.set_progress(10, format!("Reading {} messages", total));

        self.scanner()
            .fetch_metadata(ids, |fetched| {
                let fetched = fetched as u64;
                writer.set_counts(fetched, 0, 0);
                writer.set_progress(
                    10 + (percent(fetched, total) as u64 * 80 / 100) as u8,
                    format!("Read {} of {} messages", fetched, total),
                );
            })
            .await
    }

    async fn run_download(
        &self,
        writer: &ProgressWriter,
        queries: Vec<GmailQuery>,
        limit: u64,
    ) -> Result<String> {
        let ids = self.collect_ids(writer, &queries, limit).await?;
        if ids.is_empty() {
            return Ok("No matching messages found".to_string());
        }

        let total = ids.len() as u64;
        let messages = self.read_metadata(writer, ids).await?;
        let read = messages.len() as u64;
        writer.set_counts(total, read, total - read);

        writer.set_progress(90, "Writing CSV");
        let export = CsvExport::build(&messages, chrono::Local::now())?;
        let summary = format!("Exported {} messages to {}", export.rows, export.filename);
        writer.set_export(export);
        Ok(summary)
    }

    async fn run_scan(
        &self,
        writer: &ProgressWriter,
        query: GmailQuery,
        limit: u64,
        purpose: ScanPurpose,
    ) -> Result<String> {
        let candidates = self
            .scanner()
            .collect_candidates(&query, limit, |found| {
                writer.set_message(format!("Found {} messages", found));
            })
            .await?;
        if candidates.is_empty() {
            return Ok("No matching messages found".to_string());
        }

        let total = candidates.len() as u64;
        let ids = candidates.into_iter().map(|c| c.id).collect();
        let messages = self.read_metadata(writer, ids).await?;

        let mut aggregator = SenderAggregator::new();
        for message in &messages {
            aggregator.add(message);
        }
        let mut senders = aggregator.finish();
        writer.set_counts(total, messages.len() as u64, total - messages.len() as u64);

        if purpose == ScanPurpose::Unsubscribe {
            writer.set_progress(90, "Looking for unsubscribe links");
            self.lookup_body_links(&mut senders).await?;
        }

        let summary = format!(
            "Found {} senders in {} messages",
            senders.len(),
            messages.len()
        );
        writer.set_results(senders);
        Ok(summary)
    }

    /// Fill in links for top senders whose headers had none
    async fn lookup_body_links(&self, senders: &mut [SenderSummary]) -> Result<()> {
        let lookups = senders
            .iter_mut()
            .filter(|s| s.unsubscribe.is_none())
            .take(self.jobs.body_lookup_limit);

        for summary in lookups {
            match self
                .client
                .fetch_unsubscribe_affordances(&summary.sample_message_id)
                .await
            {
                Ok(affordances) => {
                    let Some(link) = affordances.link else {
                        continue;
                    };
                    let from_header = affordances
                        .header
                        .as_deref()
                        .map(|h| h.contains(link.as_str()))
                        .unwrap_or(false);
                    if from_header {
                        summary.unsubscribe = Some(UnsubscribeLink {
                            url: link,
                            one_click: affordances.one_click,
                            source: LinkSource::Header,
                        });
                    } else {
                        aggregator::attach_body_link(summary, link);
                    }
                }
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => warn!(
                    "Could not read message {} from {}: {}",
                    summary.sample_message_id, summary.sender, e
                ),
            }
        }
        Ok(())
    }

    async fn run_unsubscribe_bulk(
        &self,
        writer: &ProgressWriter,
        targets: Vec<UnsubscribeTarget>,
    ) -> Result<String> {
        let total = targets.len() as u64;
        let (mut succeeded, mut failed) = (0u64, 0u64);

        for (index, target) in targets.iter().enumerate() {
            let outcome = match self.resolve_link(target) {
                Ok(link) => self.unsubscriber.unsubscribe(&link).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(outcome) if outcome.is_success() => succeeded += 1,
                Ok(_) => {
                    failed += 1;
                    info!("{} needs a manual unsubscribe", target.domain);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Unsubscribe from {} failed: {}", target.domain, e);
                }
            }

            let processed = index as u64 + 1;
            writer.set_counts(processed, succeeded, failed);
            writer.set_progress(
                percent(processed, total),
                format!("Unsubscribed from {} of {} senders", succeeded, total),
            );
        }

        let mut summary = format!("Unsubscribed from {} senders", succeeded);
        if failed > 0 {
            summary.push_str(&format!(", {} failed or need manual action", failed));
        }
        Ok(summary)
    }
}

/// `done * 100 / total`, capped at 99 while work remains
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (done.saturating_mul(100) / total).min(99) as u8
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
