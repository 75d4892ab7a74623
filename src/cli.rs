use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Recover visited pages from the browser cache as Markdown")]
pub struct CliOptions {
    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of recent history records to convert
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Directory for the Markdown files
    #[arg(short, long)]
    pub save_dir: Option<PathBuf>,

    /// Keep running and convert newly visited pages as they appear
    #[arg(long)]
    pub monitor: bool,

    /// History poll interval in seconds (with --monitor)
    #[arg(long)]
    pub interval: Option<u64>,

    /// How long each batch waits for cache or fetch results, in milliseconds
    #[arg(long)]
    pub batch_wait_ms: Option<u64>,

    /// Never re-fetch pages that are not in the cache
    #[arg(long)]
    pub no_fetch: bool,

    /// Upload converted files to the document index
    #[arg(long)]
    pub upload: bool,

    /// Only check that the browser history can be read, then exit
    #[arg(long)]
    pub check: bool,
}

impl CliOptions {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(limit) = self.limit {
            cfg.record_limit = limit;
        }
        if let Some(dir) = &self.save_dir {
            cfg.save_dir = dir.clone();
            cfg.index.state_path = cfg.state_dir().join("index_state.json");
        }
        if self.monitor {
            cfg.monitor_enabled = true;
        }
        if let Some(secs) = self.interval {
            cfg.poll_interval_secs = secs;
        }
        if let Some(ms) = self.batch_wait_ms {
            cfg.batch_wait_ms = ms;
        }
        if self.no_fetch {
            cfg.fetch_fallback = false;
        }
        if self.upload {
            cfg.index.enabled = true;
        }
    }
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
