use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::embedding::primary::{DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL};

#[derive(Parser, Debug)]
#[command(
    name = "flavor-sync",
    version,
    about = "Keeps coffee flavor embeddings in sync with their flavor tags"
)]
pub struct Cli {
    /// Also append log lines (without colors) to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Regenerate embeddings for records that changed or never had one
    Sync(SyncArgs),
    /// Report catalog embedding coverage without writing anything
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Supabase API key
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,

    /// Use a local SQLite catalog instead of Supabase
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Timeout applied to every gateway HTTP request, in seconds
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    pub gateway_timeout: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub gateway: GatewayArgs,

    /// OpenAI API key; without it the deterministic fallback is used
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    #[arg(long, default_value = DEFAULT_OPENAI_MODEL)]
    pub openai_model: String,

    /// Retries for throttled or unreachable embedding requests
    #[arg(long, default_value_t = 2)]
    pub openai_max_retries: usize,

    /// Update every record even if it has not changed
    #[arg(long, default_value_t = false)]
    pub force_all: bool,

    /// Use the fallback generator when no OpenAI key is configured
    #[arg(long, default_value_t = false)]
    pub allow_fallback: bool,

    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,

    /// Delay between records within a batch, in seconds
    #[arg(long, default_value = "1.0", value_parser = parse_seconds)]
    pub delay: Duration,

    /// Delay between batches, in seconds
    #[arg(long, default_value = "3.0", value_parser = parse_seconds)]
    pub batch_delay: Duration,

    /// Upper bound for a single embedding or update call, in seconds
    #[arg(long, value_parser = parse_seconds)]
    pub call_timeout: Option<Duration>,

    /// Generate embeddings but skip every write
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Directory for per-run JSON manifests
    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub gateway: GatewayArgs,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

impl Commands {
    pub fn verbose(&self) -> bool {
        match self {
            Self::Sync(args) => args.verbose,
            Self::Status(args) => args.verbose,
        }
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("'{raw}' must be a finite, non-negative number of seconds"))
}
