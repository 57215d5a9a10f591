use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::config::Provider;
use super::constants::{ENV_CONFIG_FILE, ENV_IMAP_USER};

fn parse_provider(s: &str) -> Result<Provider, String> {
    s.parse()
}

/// CLI surface for `mailbridge-producer`.
#[derive(Debug, Parser)]
#[command(name = "mailbridge-producer", about = "Tail an IMAP mailbox into a stream")]
pub struct ProducerCli {
    #[arg(long, env = ENV_IMAP_USER)]
    pub username: Option<String>,

    #[arg(long, value_parser = parse_provider, default_value = "gmail")]
    pub provider: Provider,

    #[arg(long, default_value = "INBOX")]
    pub mailbox: String,

    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,

    #[arg(long)]
    pub poll_interval: Option<u64>,

    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub auth_setup: bool,

    #[arg(long, env = ENV_CONFIG_FILE)]
    pub config_file: Option<PathBuf>,
}

impl ProducerCli {
    pub fn parse_args() -> Self {
        dotenvy::dotenv().ok();
        ProducerCli::parse()
    }
}

/// CLI surface for `mailbridge-worker`.
#[derive(Debug, Parser)]
#[command(name = "mailbridge-worker", about = "Consume an email ingestion stream")]
pub struct WorkerCli {
    #[arg(long)]
    pub stream: Option<String>,

    #[arg(long)]
    pub group: Option<String>,

    #[arg(long)]
    pub consumer: Option<String>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub block_timeout: Option<u64>,

    #[arg(long, env = ENV_CONFIG_FILE)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<WorkerCommand>,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Inspect and manage the dead-letter stream.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum DlqAction {
    /// Non-destructively list the oldest entries in the DLQ.
    Peek {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Delete a single DLQ entry by id.
    Remove { entry_id: String },
    /// Re-append a DLQ entry's original payload to a target stream and remove it.
    Reprocess {
        entry_id: String,
        #[arg(long)]
        target_stream: Option<String>,
    },
    /// Print the current DLQ length.
    Len,
}

impl WorkerCli {
    pub fn parse_args() -> Self {
        dotenvy::dotenv().ok();
        WorkerCli::parse()
    }
}
