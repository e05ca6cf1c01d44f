use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::dashboard::DEFAULT_STATUS_INTERVAL;
use crate::listener::DEFAULT_HEADER_TIMEOUT;
use crate::proxy::DEFAULT_UPSTREAM_TIMEOUT;
use crate::security::AdmissionFilter;

/// Command line of the relay.
#[derive(Debug, Parser)]
#[command(name = "proxy-relay", version, about = "PROXY protocol aware TCP relay")]
pub struct Args {
    /// Local address to listen on, e.g. 0.0.0.0:8080
    pub local_addr: String,

    /// Upstream address to relay to, e.g. 10.0.0.5:80
    pub upstream_addr: String,

    /// Do not relay clients inside this network (CIDR)
    #[arg(long, value_name = "CIDR")]
    pub ignore: Option<String>,

    /// Optional TOML file with tuning values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Upstream dial timeout in seconds [default: 30]
    #[arg(long, value_name = "SECS")]
    pub upstream_timeout: Option<u64>,

    /// Seconds between status reports [default: 60]
    #[arg(long, value_name = "SECS")]
    pub status_interval: Option<u64>,

    /// Seconds to wait for a PROXY header [default: 10]
    #[arg(long, value_name = "SECS")]
    pub header_timeout: Option<u64>,
}

/// Values read from the `--config` file. Command line flags take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub ignore: Option<String>,
    pub upstream_timeout_secs: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub header_timeout_secs: Option<u64>,
}

pub fn load_config(path: &std::path::Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub local_addr: String,
    pub upstream_addr: String,
    pub filter: AdmissionFilter,
    pub upstream_timeout: Duration,
    pub status_interval: Duration,
    pub header_timeout: Duration,
}

fn seconds(name: &str, value: Option<u64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => bail!("{name} must be greater than zero"),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => load_config(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let ignore = args.ignore.or(file.ignore);
        let filter = AdmissionFilter::new(ignore.as_deref())?;

        Ok(Self {
            local_addr: args.local_addr,
            upstream_addr: args.upstream_addr,
            filter,
            upstream_timeout: seconds(
                "upstream timeout",
                args.upstream_timeout.or(file.upstream_timeout_secs),
                DEFAULT_UPSTREAM_TIMEOUT,
            )?,
            status_interval: seconds(
                "status interval",
                args.status_interval.or(file.status_interval_secs),
                DEFAULT_STATUS_INTERVAL,
            )?,
            header_timeout: seconds(
                "header timeout",
                args.header_timeout.or(file.header_timeout_secs),
                DEFAULT_HEADER_TIMEOUT,
            )?,
        })
    }
}
