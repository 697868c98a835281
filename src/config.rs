use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use secrecy::SecretString;

use crate::cli::{GatewayArgs, SyncArgs};

/// Everything the runner needs, resolved once before a run starts.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub force_all: bool,
    pub batch_size: usize,
    pub inter_record_delay: Duration,
    pub inter_batch_delay: Duration,
    pub dry_run: bool,
    pub allow_fallback: bool,
    pub call_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            force_all: false,
            batch_size: 5,
            inter_record_delay: Duration::from_secs(1),
            inter_batch_delay: Duration::from_secs(3),
            dry_run: false,
            allow_fallback: false,
            call_timeout: None,
        }
    }
}

impl SyncConfig {
    pub fn from_args(args: &SyncArgs) -> Result<Self> {
        let batch_size = usize::try_from(args.batch_size)?;
        if batch_size == 0 {
            bail!("batch size must be greater than zero");
        }

        Ok(Self {
            force_all: args.force_all,
            batch_size,
            inter_record_delay: args.delay,
            inter_batch_delay: args.batch_delay,
            dry_run: args.dry_run,
            allow_fallback: args.allow_fallback,
            call_timeout: args.call_timeout,
        })
    }
}

pub enum GatewayTarget {
    Postgrest {
        base_url: String,
        api_key: SecretString,
        timeout: Duration,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl GatewayTarget {
    pub fn from_args(args: &GatewayArgs) -> Result<Self> {
        if let Some(path) = &args.db_path {
            return Ok(Self::Sqlite { path: path.clone() });
        }

        let url = non_blank(args.supabase_url.as_deref());
        let key = non_blank(args.supabase_key.as_deref());
        match (url, key) {
            (Some(base_url), Some(api_key)) => Ok(Self::Postgrest {
                base_url: base_url.to_string(),
                api_key: SecretString::from(api_key.to_string()),
                timeout: args.gateway_timeout,
            }),
            _ => bail!(
                "Supabase URL and key are required (--supabase-url/--supabase-key or SUPABASE_URL/SUPABASE_KEY), or pass --db-path"
            ),
        }
    }
}

pub struct PrimaryConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub max_retries: usize,
}

impl PrimaryConfig {
    pub fn from_args(args: &SyncArgs) -> Option<Self> {
        non_blank(args.openai_key.as_deref()).map(|key| Self {
            api_key: SecretString::from(key.to_string()),
            base_url: args.openai_base_url.clone(),
            model: args.openai_model.clone(),
            max_retries: args.openai_max_retries,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
