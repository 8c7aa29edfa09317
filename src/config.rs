use crate::storage::chunks::DEFAULT_SESSION_TTL;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub database_url: String,
    pub cleanup_interval: Duration,
    pub chunk_ttl: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket-based file hosting service")]
pub struct Args {
    /// Host to bind to (overrides FILE_HOST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_HOST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for files, versions and chunk temp space (overrides FILE_HOST_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Database URL (overrides FILE_HOST_DATABASE_URL; defaults to `<data_dir>/files.db`)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds between expiry/cleanup passes (overrides FILE_HOST_CLEANUP_INTERVAL_SECS)
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    /// Idle seconds before an unfinished chunked upload is discarded (overrides FILE_HOST_CHUNK_TTL_SECS)
    #[arg(long)]
    pub chunk_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI values over environment values over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_host = lookup("FILE_HOST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env(&lookup, "FILE_HOST_PORT", 5109u16)?;
        let env_data_dir = lookup("FILE_HOST_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let env_db = lookup("FILE_HOST_DATABASE_URL").ok();
        let env_cleanup = parse_env(&lookup, "FILE_HOST_CLEANUP_INTERVAL_SECS", 3600u64)?;
        let env_chunk_ttl = parse_env(&lookup, "FILE_HOST_CHUNK_TTL_SECS", DEFAULT_SESSION_TTL.as_secs())?;

        let data_dir = args.data_dir.unwrap_or(env_data_dir);
        let database_url = args
            .database_url
            .or(env_db)
            .unwrap_or_else(|| format!("sqlite://{}/files.db", data_dir.trim_end_matches('/')));

        let cleanup_secs = args.cleanup_interval_secs.unwrap_or(env_cleanup);
        if cleanup_secs == 0 {
            anyhow::bail!("cleanup interval must be at least one second");
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            data_dir,
            database_url,
            cleanup_interval: Duration::from_secs(cleanup_secs),
            chunk_ttl: Duration::from_secs(args.chunk_ttl_secs.unwrap_or(env_chunk_ttl)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
