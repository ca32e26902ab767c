//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Mirror web pages for offline browsing.
///
/// Fetches the seed URLs, follows their links to the configured depth, and
/// rewrites the downloaded HTML so links point at the local copies.
#[derive(Parser, Debug)]
#[command(name = "webmirror")]
#[command(author, version, about)]
pub struct Args {
    /// Seed URLs to start crawling from
    pub seeds: Vec<String>,

    /// Config file (key = value lines)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// SQLite database holding the page graph
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Directory for HTML pages
    #[arg(long, value_name = "DIR")]
    pub html_dir: Option<PathBuf>,

    /// Directory for non-HTML files
    #[arg(long, value_name = "DIR")]
    pub other_dir: Option<PathBuf>,

    /// Directory replaced files are moved to
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Link depth to follow below the seeds (0-32)
    #[arg(short = 'd', long, value_parser = clap::value_parser!(u32).range(0..=32))]
    pub depth: Option<u32>,

    /// Largest file to download, in bytes
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_file_size: Option<u64>,

    /// Hosts crawled at the same time (1-64)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub host_workers: Option<u8>,

    /// Concurrent fetches per host (1-16)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub per_host: Option<u8>,

    /// HTTP timeout in seconds (1-120)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=120))]
    pub timeout: Option<u64>,

    /// Pages taken from the store per cycle (1-10000)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    pub batch_size: Option<u32>,

    /// Also fetch pages left undownloaded by earlier runs
    #[arg(long)]
    pub resume: bool,

    /// Skip rewriting links after the crawl
    #[arg(long)]
    pub no_localise: bool,

    /// Print the crawl summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["webmirror"]).unwrap();
        assert!(args.seeds.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.resume);
        assert!(!args.no_localise);
        assert!(args.depth.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn test_cli_seeds_are_positional() {
        let args =
            Args::try_parse_from(["webmirror", "https://a.test/", "https://b.test/x"]).unwrap();
        assert_eq!(args.seeds, vec!["https://a.test/", "https://b.test/x"]);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["webmirror", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["webmirror", "--verbose"]).unwrap();
        assert_eq!(args.verbose, 1);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["webmirror", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["webmirror", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["webmirror", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_cli_paths_and_limits() {
        let args = Args::try_parse_from([
            "webmirror",
            "--db",
            "/tmp/m.db",
            "--html-dir",
            "/tmp/h",
            "--other-dir",
            "/tmp/o",
            "--backup-dir",
            "/tmp/b",
            "-d",
            "3",
            "--max-file-size",
            "5000",
            "--host-workers",
            "8",
            "--per-host",
            "1",
            "-t",
            "20",
            "--batch-size",
            "10",
        ])
        .unwrap();
        assert_eq!(args.db, Some(PathBuf::from("/tmp/m.db")));
        assert_eq!(args.html_dir, Some(PathBuf::from("/tmp/h")));
        assert_eq!(args.other_dir, Some(PathBuf::from("/tmp/o")));
        assert_eq!(args.backup_dir, Some(PathBuf::from("/tmp/b")));
        assert_eq!(args.depth, Some(3));
        assert_eq!(args.max_file_size, Some(5000));
        assert_eq!(args.host_workers, Some(8));
        assert_eq!(args.per_host, Some(1));
        assert_eq!(args.timeout, Some(20));
        assert_eq!(args.batch_size, Some(10));
    }

    #[test]
    fn test_cli_timeout_out_of_range_rejected() {
        for value in ["0", "121"] {
            let err = Args::try_parse_from(["webmirror", "--timeout", value]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_zero_workers_rejected() {
        let err = Args::try_parse_from(["webmirror", "--host-workers", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["webmirror", "--per-host", "17"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_run_flags() {
        let args =
            Args::try_parse_from(["webmirror", "--resume", "--no-localise", "--json", "-q"])
                .unwrap();
        assert!(args.resume);
        assert!(args.no_localise);
        assert!(args.json);
        assert!(args.quiet);
    }
}
