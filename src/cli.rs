//! Command-line interface
//!
//! Job commands run the [`JobEngine`] in-process and follow it through the
//! same status snapshots the web UI polls, rendered as an indicatif bar.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth;
use crate::client::ProductionGmailClient;
use crate::config::Config;
use crate::engine::JobEngine;
use crate::error::{GmailError, Result};
use crate::filters::FilterSpec;
use crate::models::{CountLimit, SenderSummary, UnsubscribeTarget};
use crate::poller::{self, PollSettings};
use crate::progress::{JobState, JobStatus, ProgressStore};
use crate::rate_limiter::QuotaRateLimiter;
use crate::unsubscribe::{HttpUnsubscriber, UnsubscribeOutcome};

#[derive(Parser, Debug)]
#[command(name = "gmail-bulk")]
#[command(version)]
#[command(about = "Find bulk senders, unsubscribe, delete and mark Gmail messages as read", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file (overrides the config)
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Path to token cache file (overrides the config)
    #[arg(long)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Apply path overrides from the command line
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(path) = &self.credentials {
            config.auth.credentials_path = path.clone();
        }
        if let Some(path) = &self.token_cache {
            config.auth.token_cache_path = path.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Serve the web UI and JSON API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Rank senders of mail that mentions unsubscribing
    Scan {
        /// Number of messages to scan
        #[arg(short, long)]
        limit: Option<u64>,

        /// Senders to print
        #[arg(long, default_value_t = 20)]
        top: usize,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Rank senders of all matching mail
    DeleteScan {
        #[arg(short, long)]
        limit: Option<u64>,

        #[arg(long, default_value_t = 20)]
        top: usize,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Mark unread messages as read
    MarkRead {
        /// A number or "all"
        #[arg(short = 'n', long)]
        count: Option<CountLimit>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Move all mail from the given senders to trash
    Delete {
        /// Sender addresses; when omitted the filters alone select mail
        senders: Vec<String>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Back up matching message metadata to a CSV file
    Download {
        /// Sender addresses; when omitted the filters alone select mail
        senders: Vec<String>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Most messages to export
        #[arg(short, long)]
        limit: Option<u64>,

        /// Output directory for the backup file
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Follow unsubscribe links
    Unsubscribe {
        /// Links from a scan (https or mailto)
        #[arg(required = true)]
        links: Vec<String>,
    },

    /// Follow the job of a running server
    Watch {
        #[arg(long, default_value = "http://127.0.0.1:8766")]
        url: String,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Filter flags shared by the job commands
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Sender address or name
    #[arg(long = "from")]
    pub sender: Option<String>,

    #[arg(long)]
    pub subject: Option<String>,

    /// Only mail received on or after this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub after: Option<NaiveDate>,

    /// Only mail received on or before this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub before: Option<NaiveDate>,

    /// Relative age such as 30d
    #[arg(long)]
    pub older_than: Option<String>,

    /// Size with unit such as 5M
    #[arg(long)]
    pub larger_than: Option<String>,

    /// Minimum size in bytes
    #[arg(long)]
    pub min_size: Option<u64>,

    #[arg(long, conflicts_with = "no_attachment")]
    pub has_attachment: bool,

    #[arg(long)]
    pub no_attachment: bool,

    /// primary, social, promotions, updates or forums
    #[arg(long)]
    pub category: Option<String>,
}

impl FilterArgs {
    pub fn to_spec(&self) -> FilterSpec {
        let has_attachment = match (self.has_attachment, self.no_attachment) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };

        FilterSpec {
            sender: self.sender.clone(),
            subject: self.subject.clone(),
            after: self.after,
            before: self.before,
            min_size: self.min_size,
            has_attachment,
            older_than: self.older_than.clone(),
            larger_than: self.larger_than.clone(),
            category: self.category.clone(),
        }
    }
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y/%m/%d"))
        .map_err(|_| format!("expected YYYY-MM-DD, got {:?}", value))
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above the bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// A 0-100 bar driven by job status snapshots
    pub fn add_job_bar(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(100));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        println!("  ✓ {}", msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Authenticate and wire up the engine for in-process jobs
pub async fn connect(config: &Config, reporter: &ProgressReporter) -> Result<JobEngine> {
    let spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::initialize_gmail_hub(
        &config.auth.credentials_path,
        &config.auth.token_cache_path,
    )
    .await?;
    reporter.finish_spinner(&spinner, "Gmail API authenticated successfully");

    let client = ProductionGmailClient::new(hub, QuotaRateLimiter::from_config(&config.rate_limit));
    let unsubscriber = HttpUnsubscriber::new()?;

    Ok(JobEngine::new(
        Arc::new(client),
        Arc::new(unsubscriber),
        ProgressStore::new(),
        config,
    ))
}

/// Follow the engine's current job until it ends
pub async fn follow_job(
    engine: &JobEngine,
    reporter: &ProgressReporter,
    interval: Duration,
) -> Result<JobStatus> {
    let bar = reporter.add_job_bar("Starting...");
    let status = poller::poll_until_done(
        PollSettings::with_interval(interval),
        || {
            let status = engine.status();
            async move { Ok(status) }
        },
        |status| render_status(&bar, status),
    )
    .await?;
    bar.finish_and_clear();
    finish(status)
}

/// Follow the job of a server started with `serve`
pub async fn follow_remote(base_url: &str, reporter: &ProgressReporter, interval: Duration) -> Result<JobStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| GmailError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

    let bar = reporter.add_job_bar("Connecting...");
    let status = poller::poll_until_done(
        PollSettings::with_interval(interval),
        || poller::fetch_remote_status(&client, base_url),
        |status| render_status(&bar, status),
    )
    .await?;
    bar.finish_and_clear();

    if status.state == JobState::Idle {
        println!("No job has run on {} yet", base_url);
        return Ok(status);
    }
    finish(status)
}

fn render_status(bar: &ProgressBar, status: &JobStatus) {
    bar.set_position(status.progress as u64);
    bar.set_message(status.message.clone());
}

fn finish(status: JobStatus) -> Result<JobStatus> {
    match status.state {
        JobState::Failed => Err(GmailError::Unknown(
            status
                .error
                .clone()
                .unwrap_or_else(|| status.message.clone()),
        )),
        _ => {
            println!("  ✓ {}", status.message);
            if status.processed_count > 0 {
                println!(
                    "    processed {}, succeeded {}, failed {}",
                    status.processed_count, status.success_count, status.failure_count
                );
            }
            Ok(status)
        }
    }
}

/// Print the top `top` senders of a scan as a table
pub fn print_senders(senders: &[SenderSummary], top: usize) {
    if senders.is_empty() {
        println!("No senders found.");
        return;
    }

    println!(
        "\n{:<4} {:<44} {:>8} {:>10}  {}",
        "#", "Sender", "Messages", "Size (KB)", "Unsubscribe"
    );
    println!("{}", "-".repeat(90));
    for (rank, summary) in senders.iter().take(top).enumerate() {
        let link = match &summary.unsubscribe {
            Some(link) if link.one_click => format!("{} (one-click)", truncate_string(&link.url, 40)),
            Some(link) => truncate_string(&link.url, 52),
            None => "-".to_string(),
        };
        println!(
            "{:<4} {:<44} {:>8} {:>10}  {}",
            rank + 1,
            truncate_string(&summary.sender, 44),
            summary.count,
            summary.total_size / 1024,
            link
        );
    }
    if senders.len() > top {
        println!("... and {} more", senders.len() - top);
    }
}

/// Turn a bare link into a target named after its host
pub fn target_for_link(link: &str) -> UnsubscribeTarget {
    let link = link.trim();
    let domain = match link.strip_prefix("mailto:") {
        Some(address) => address
            .split('?')
            .next()
            .and_then(|a| a.rsplit_once('@'))
            .map(|(_, d)| d.to_string()),
        None => reqwest::Url::parse(link)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string())),
    };

    UnsubscribeTarget {
        domain: domain.unwrap_or_else(|| link.to_string()),
        link: link.to_string(),
    }
}

pub fn print_outcome(target: &UnsubscribeTarget, outcome: &UnsubscribeOutcome) {
    match outcome {
        UnsubscribeOutcome::Unsubscribed { status, one_click } => {
            let how = if *one_click { "one-click POST" } else { "link" };
            println!("  ✓ Unsubscribed from {} via {} (HTTP {})", target.domain, how, status);
        }
        UnsubscribeOutcome::ManualRequired { url } => {
            println!("  ! {} needs a manual unsubscribe: {}", target.domain, url);
        }
    }
}

/// Prompt user for confirmation
pub fn confirm_action(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().to_lowercase() == "y")
}

/// Remove a cached token before a forced re-authentication
pub async fn clear_token(token_cache_path: &Path) -> Result<()> {
    if auth::sign_out(token_cache_path).await? {
        info!("Removed existing token cache");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_mark_read_all_with_filters() {
        let cli = Cli::try_parse_from([
            "gmail-bulk",
            "mark-read",
            "--count",
            "all",
            "--category",
            "promotions",
            "--older-than",
            "30d",
        ])
        .unwrap();

        match cli.command {
            Commands::MarkRead { count, filters } => {
                assert_eq!(count, Some(CountLimit::All));
                let spec = filters.to_spec();
                assert_eq!(spec.category.as_deref(), Some("promotions"));
                assert_eq!(spec.older_than.as_deref(), Some("30d"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_delete_senders() {
        let cli = Cli::try_parse_from([
            "gmail-bulk",
            "delete",
            "a@x.com",
            "b@y.com",
            "--after",
            "2024-01-01",
            "--no-attachment",
            "-y",
        ])
        .unwrap();

        match cli.command {
            Commands::Delete { senders, filters, yes } => {
                assert_eq!(senders, vec!["a@x.com", "b@y.com"]);
                assert!(yes);
                let spec = filters.to_spec();
                assert_eq!(spec.after, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(spec.has_attachment, Some(false));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_download() {
        let cli = Cli::try_parse_from([
            "gmail-bulk",
            "download",
            "a@x.com",
            "--before",
            "2024-06-30",
            "-l",
            "500",
            "-o",
            "/tmp/backups",
        ])
        .unwrap();

        match cli.command {
            Commands::Download {
                senders,
                filters,
                limit,
                output,
            } => {
                assert_eq!(senders, vec!["a@x.com"]);
                assert_eq!(filters.to_spec().before, NaiveDate::from_ymd_opt(2024, 6, 30));
                assert_eq!(limit, Some(500));
                assert_eq!(output, PathBuf::from("/tmp/backups"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_attachment_flags_conflict() {
        let result = Cli::try_parse_from([
            "gmail-bulk",
            "scan",
            "--has-attachment",
            "--no-attachment",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_date_is_rejected() {
        assert!(parse_date("2024-13-01").is_err());
        assert_eq!(parse_date("2024/02/29"), Ok(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
    }

    #[test]
    fn test_overrides_replace_config_paths() {
        let cli = Cli::try_parse_from([
            "gmail-bulk",
            "--token-cache",
            "/tmp/t.json",
            "serve",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.auth.token_cache_path, PathBuf::from("/tmp/t.json"));
        assert_eq!(config.auth.credentials_path, PathBuf::from("credentials.json"));
    }

    #[test]
    fn test_target_for_link() {
        let t = target_for_link("https://www.news.example.com/u?id=1");
        assert_eq!(t.domain, "news.example.com");

        let t = target_for_link("mailto:leave@lists.example.org?subject=unsubscribe");
        assert_eq!(t.domain, "lists.example.org");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a-very-long-address@example.com", 10), "a-very-...");
    }
}
