use clap::{Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Offline application cache updater",
    long_about = "Downloads the resources listed by a cache manifest into a versioned\n\
                  application cache, and answers how URLs would be served from it\n\
                  while offline."
)]
pub struct CliArgs {
    /// Directory where caches are stored
    #[arg(
        short,
        long,
        global = true,
        help = "Directory where caches are stored (kept in memory when omitted)"
    )]
    pub storage_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to a file
    #[arg(long, global = true, help = "Copy log output to this file")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one update of a manifest's cache
    Update {
        /// Manifest URL
        manifest_url: Url,

        /// Document that references the manifest
        #[arg(
            short,
            long,
            help = "Document added to the cache as a master entry (default: the manifest itself)"
        )]
        document: Option<Url>,

        /// Concurrent resource downloads
        #[arg(short, long, default_value_t = 3, help = "Maximum concurrent resource downloads")]
        concurrency: usize,

        /// Request timeout in seconds
        #[arg(
            short,
            long,
            default_value_t = 30,
            help = "Overall timeout for each HTTP request in seconds (0 to disable)"
        )]
        timeout: u64,

        /// Accept manifests served with any content type
        #[arg(long, help = "Do not require the text/cache-manifest content type")]
        no_mime_check: bool,

        /// Group quota in bytes
        #[arg(long, help = "Reject caches larger than this many bytes")]
        quota: Option<u64>,
    },

    /// Show how a URL is served from a stored cache
    Lookup {
        /// Manifest URL of the cache
        manifest_url: Url,

        /// URL to look up
        url: Url,
    },
}
