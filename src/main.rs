use anyhow::Result;
use clap::Parser;
use gmail_bulk::cli::{self, Cli, Commands, FilterArgs, ProgressReporter};
use gmail_bulk::config::Config;
use gmail_bulk::engine::{
    DeleteRequest, DownloadRequest, JobEngine, MarkReadRequest, ScanPurpose, ScanRequest,
};
use gmail_bulk::error::GmailError;
use gmail_bulk::models::CountLimit;
use gmail_bulk::server::{self, AppState};
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: gmail-bulk --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_bulk=debug,tower_http=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_bulk=info,warn"))
    };
    let make_writer = MultiProgressMakeWriter {
        multi: Arc::clone(multi),
    };

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

async fn run() -> Result<()> {
    // Several dependencies link rustls; pick one provider process-wide
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi_progress);
    let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

    let mut config = Config::load(&cli.config).await?;
    cli.apply_overrides(&mut config);
    let poll_interval = Duration::from_millis(config.server.poll_interval_ms);

    match &cli.command {
        Commands::Auth { force } => {
            tracing::info!("Authenticating with Gmail API...");

            if *force {
                cli::clear_token(&config.auth.token_cache_path).await?;
            }

            let engine = cli::connect(&config, &reporter).await?;
            let email = engine.client().get_profile_email().await?;

            println!("Token cached at: {:?}", config.auth.token_cache_path);
            println!("Connected to account: {}", email);
            Ok(())
        }

        Commands::Serve { host, port } => {
            let host = host.clone().unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let engine = cli::connect(&config, &reporter).await?;
            let state = AppState::new(
                engine,
                config.jobs.clone(),
                config.auth.token_cache_path.clone(),
            );

            println!("Open http://{}:{}/ in your browser", host, port);
            server::serve(state, &format!("{}:{}", host, port)).await?;
            Ok(())
        }

        Commands::Scan { limit, top, filters } => {
            run_scan(&config, &reporter, *limit, *top, filters, ScanPurpose::Unsubscribe, poll_interval).await
        }

        Commands::DeleteScan { limit, top, filters } => {
            run_scan(&config, &reporter, *limit, *top, filters, ScanPurpose::Delete, poll_interval).await
        }

        Commands::MarkRead { count, filters } => {
            let engine = cli::connect(&config, &reporter).await?;
            engine.start_mark_read(MarkReadRequest {
                count: count.unwrap_or(CountLimit::Count(config.jobs.default_mark_read_count)),
                filters: filters.to_spec(),
            })?;
            cli::follow_job(&engine, &reporter, poll_interval).await?;
            Ok(())
        }

        Commands::Delete { senders, filters, yes } => {
            let spec = filters.to_spec();
            // Compile up front so a bad filter fails before any prompt
            spec.compile()?;

            let what = if senders.is_empty() {
                "all mail matching the filters".to_string()
            } else {
                format!("all mail from {} sender(s)", senders.len())
            };
            if !yes && !cli::confirm_action(&format!("Move {} to trash?", what))? {
                println!("Cancelled.");
                return Ok(());
            }

            let engine = cli::connect(&config, &reporter).await?;
            engine.start_delete(DeleteRequest {
                senders: senders.clone(),
                filters: spec,
            })?;
            cli::follow_job(&engine, &reporter, poll_interval).await?;
            Ok(())
        }

        Commands::Download {
            senders,
            filters,
            limit,
            output,
        } => {
            let engine = cli::connect(&config, &reporter).await?;
            engine.start_download(DownloadRequest {
                senders: senders.clone(),
                filters: filters.to_spec(),
                limit: limit.unwrap_or(config.jobs.max_count),
            })?;
            cli::follow_job(&engine, &reporter, poll_interval).await?;

            if let Some(export) = engine.export() {
                let path = output.join(&export.filename);
                tokio::fs::write(&path, &export.data).await?;
                println!("Wrote {} messages to {}", export.rows, path.display());
            }
            Ok(())
        }

        Commands::Unsubscribe { links } => {
            let targets: Vec<_> = links.iter().map(|l| cli::target_for_link(l)).collect();
            let engine = cli::connect(&config, &reporter).await?;

            if let [target] = targets.as_slice() {
                let outcome = engine.unsubscribe_single(target).await?;
                cli::print_outcome(target, &outcome);
            } else {
                engine.start_unsubscribe_bulk(targets)?;
                cli::follow_job(&engine, &reporter, poll_interval).await?;
            }
            Ok(())
        }

        Commands::Watch { url } => {
            cli::follow_remote(url, &reporter, poll_interval).await?;
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");

            if output.exists() && !force {
                return Err(GmailError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - server.port: where the web UI listens");
            println!("  - jobs.batch_size: messages per batch request");
            println!("  - jobs.max_count: upper bound for a single job");
            println!("  - rate_limit.units_per_second: Gmail quota budget");
            Ok(())
        }
    }
}

async fn run_scan(
    config: &Config,
    reporter: &ProgressReporter,
    limit: Option<u64>,
    top: usize,
    filters: &FilterArgs,
    purpose: ScanPurpose,
    poll_interval: Duration,
) -> Result<()> {
    let engine: JobEngine = cli::connect(config, reporter).await?;
    engine.start_scan(ScanRequest {
        limit: limit.unwrap_or(config.jobs.default_scan_limit),
        filters: filters.to_spec(),
        purpose,
    })?;
    cli::follow_job(&engine, reporter, poll_interval).await?;
    let senders = match purpose {
        ScanPurpose::Unsubscribe => engine.results(),
        ScanPurpose::Delete => engine.delete_scan_results(),
    };
    cli::print_senders(&senders, top);
    Ok(())
}
