//! CLI entry point for the webmirror tool.

use std::io::{self, IsTerminal, Read};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use webmirror_core::{CrawlConfig, CrawlSummary, Crawler};

mod app_config;
mod cli;
mod progress;

use cli::Args;
use progress::Spinner;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args)?;
    config.validate().context("Invalid crawl configuration")?;
    let seeds = read_seeds(&args)?;
    if seeds.is_empty() && !config.resume {
        info!("No seeds given; only pages already in the store will be localised");
    }

    let crawler = Crawler::open(config)
        .await
        .context("Failed to open the page store")?;

    let spinner = Spinner::start(!args.json && !args.quiet && io::stderr().is_terminal());
    let crawler = match &spinner {
        Some(spinner) => crawler.with_progress(spinner.progress_fn()),
        None => crawler,
    };

    let result = crawler.run(&seeds).await;
    if let Some(spinner) = spinner {
        spinner.finish();
    }
    let summary = result.context("Crawl failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        report(&summary);
    }
    Ok(())
}

/// Defaults, then the config file, then command-line flags.
fn build_config(args: &Args) -> Result<CrawlConfig> {
    let mut config = CrawlConfig::default();
    if let Some((path, file_config)) = app_config::load_config(args.config.as_deref())? {
        debug!(path = %path.display(), "Loaded config file");
        file_config.apply(&mut config);
    }

    if let Some(db) = &args.db {
        config.database.clone_from(db);
    }
    if let Some(dir) = &args.html_dir {
        config.html_dir.clone_from(dir);
    }
    if let Some(dir) = &args.other_dir {
        config.other_dir.clone_from(dir);
    }
    if let Some(dir) = &args.backup_dir {
        config.backup_dir.clone_from(dir);
    }
    if let Some(depth) = args.depth {
        config.max_depth = depth;
    }
    if let Some(size) = args.max_file_size {
        config.max_file_size = size;
    }
    if let Some(workers) = args.host_workers {
        config.max_host_workers = usize::from(workers);
    }
    if let Some(per_host) = args.per_host {
        config.per_host_concurrency = usize::from(per_host);
    }
    if let Some(secs) = args.timeout {
        config.http_timeout = Duration::from_secs(secs);
    }
    if let Some(batch) = args.batch_size {
        config.batch_size = usize::try_from(batch).context("Batch size out of range")?;
    }
    if args.resume {
        config.resume = true;
    }
    if args.no_localise {
        config.localise = false;
    }
    Ok(config)
}

/// Seeds from positional args, or one per line from piped stdin.
fn read_seeds(args: &Args) -> Result<Vec<String>> {
    if !args.seeds.is_empty() {
        return Ok(args.seeds.clone());
    }
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn report(summary: &CrawlSummary) {
    if summary.rejected_seeds > 0 {
        warn!(rejected = summary.rejected_seeds, "Some seeds were not valid URLs");
    }
    if summary.escalated {
        warn!("Crawl stopped early after repeated worker faults");
    }
    info!(
        submitted = summary.submitted,
        fetched = summary.fetched,
        skipped = summary.skipped,
        failed = summary.failed,
        redirected = summary.redirected,
        deduplicated = summary.deduplicated,
        "Fetch phase complete"
    );
    info!(
        localised = summary.localised,
        unchanged = summary.localise_unchanged,
        failed = summary.localise_failed,
        "Localise phase complete"
    );
}
