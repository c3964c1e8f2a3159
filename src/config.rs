//! Configuration management for the pool node coordinator
//!
//! Supports configuration via command line arguments, environment variables
//! (named after the pool server's deployment variables) and configuration
//! files (YAML/JSON), with validation and defaults.

use crate::client::RpcEndpoint;
use crate::coordinator::CoordinatorConfig;
use crate::notifier::NotifierMode;
use crate::state::RefreshPolicy;
use crate::{Error, ProcessIdentity, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{}", level)
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Plain,
    /// One JSON object per event
    Json,
}

/// Complete configuration for the coordinator
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "pool-node-coordinator",
    version = env!("CARGO_PKG_VERSION"),
    about = "Chain-change detection and shared block template fetching for pool servers"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(default, skip_serializing)]
    pub print_config: bool,

    /// Submit this hex-serialized block to the node and exit
    #[arg(long, value_name = "HEX")]
    #[serde(default, skip_serializing)]
    pub submit_block: Option<String>,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(default, skip_serializing)]
    pub config_file: Option<PathBuf>,

    /// Node RPC URL (scheme and host)
    #[arg(long, env = "BITCOIN_RPC_URL", default_value = "http://127.0.0.1")]
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Node RPC port
    #[arg(long, env = "BITCOIN_RPC_PORT", default_value = "8332")]
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Node RPC user
    #[arg(long, env = "BITCOIN_RPC_USER")]
    pub rpc_user: Option<String>,

    /// Node RPC password
    #[arg(long, env = "BITCOIN_RPC_PASSWORD", hide_env_values = true)]
    #[serde(default, skip_serializing)]
    pub rpc_password: Option<String>,

    /// Node RPC timeout in milliseconds
    #[arg(long, env = "BITCOIN_RPC_TIMEOUT", default_value = "10000")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: u64,

    /// Node ZMQ publisher for block announcements; enables push mode
    #[arg(long, env = "BITCOIN_ZMQ_HOST")]
    pub zmq_host: Option<String>,

    /// Mining state poll interval in milliseconds (poll mode only)
    #[arg(long, env = "BITCOIN_POLL_MINING_INFO_TIMEOUT", default_value = "500")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Identity of this process among cooperating pool servers
    #[arg(long, env = "NODE_APP_INSTANCE")]
    pub instance_id: Option<String>,

    /// Shared SQLite template store; in-memory when unset
    #[arg(long, env = "TEMPLATE_STORE_PATH", value_name = "FILE")]
    pub store_path: Option<PathBuf>,

    /// Age after which an unrenewed template lease may be taken over ("0s" disables)
    #[arg(long, env = "TEMPLATE_LEASE_TTL", default_value = "30s")]
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// How long a lease holder keeps retrying the template fetch
    #[arg(long, env = "TEMPLATE_FETCH_GIVE_UP", default_value = "10m")]
    #[serde(default = "default_give_up")]
    pub fetch_give_up_after: String,

    /// How long a process waits for another process's template
    #[arg(long, env = "TEMPLATE_WAIT_GIVE_UP", default_value = "10m")]
    #[serde(default = "default_give_up")]
    pub wait_give_up_after: String,

    /// Heights of templates kept in the store behind the chain tip (0 keeps all)
    #[arg(long, env = "TEMPLATE_RETENTION", default_value = "10")]
    #[serde(default = "default_template_retention")]
    pub template_retention: u64,

    /// Mining state queries per refresh
    #[arg(long, default_value = "5")]
    #[serde(default = "default_refresh_attempts")]
    pub refresh_attempts: usize,

    /// Spacing between mining state queries in milliseconds
    #[arg(long, default_value = "100")]
    #[serde(default = "default_refresh_spacing")]
    pub refresh_spacing: u64,

    /// Failed refreshes before the mining state is reported stale
    #[arg(long, default_value = "3")]
    #[serde(default = "default_stale_after")]
    pub stale_after: u32,

    /// Log level
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, env = "LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Parse CLI/env and merge the config file if one is given
    pub async fn load() -> Result<Self> {
        Self::load_from_matches(&Self::command().get_matches()).await
    }

    async fn load_from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::from_arg_matches(matches)
            .map_err(|e| Error::config(format!("Invalid arguments: {}", e)))?;

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config, matches);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Take file settings wherever neither the command line nor the
    /// environment provided a value
    fn merge_with_file(mut self, file_config: Self, matches: &ArgMatches) -> Self {
        let defaulted = |id: &str| matches.value_source(id) == Some(ValueSource::DefaultValue);

        if defaulted("rpc_url") {
            self.rpc_url = file_config.rpc_url;
        }
        if defaulted("rpc_port") {
            self.rpc_port = file_config.rpc_port;
        }
        if defaulted("rpc_timeout") {
            self.rpc_timeout = file_config.rpc_timeout;
        }
        if defaulted("poll_interval") {
            self.poll_interval = file_config.poll_interval;
        }
        if defaulted("lease_ttl") {
            self.lease_ttl = file_config.lease_ttl;
        }
        if defaulted("fetch_give_up_after") {
            self.fetch_give_up_after = file_config.fetch_give_up_after;
        }
        if defaulted("wait_give_up_after") {
            self.wait_give_up_after = file_config.wait_give_up_after;
        }
        if defaulted("template_retention") {
            self.template_retention = file_config.template_retention;
        }
        if defaulted("refresh_attempts") {
            self.refresh_attempts = file_config.refresh_attempts;
        }
        if defaulted("refresh_spacing") {
            self.refresh_spacing = file_config.refresh_spacing;
        }
        if defaulted("stale_after") {
            self.stale_after = file_config.stale_after;
        }
        if defaulted("log_level") {
            self.log_level = file_config.log_level;
        }
        if defaulted("log_format") {
            self.log_format = file_config.log_format;
        }

        if self.rpc_user.is_none() {
            self.rpc_user = file_config.rpc_user;
        }
        if self.rpc_password.is_none() {
            self.rpc_password = file_config.rpc_password;
        }
        if self.zmq_host.is_none() {
            self.zmq_host = file_config.zmq_host;
        }
        if self.instance_id.is_none() {
            self.instance_id = file_config.instance_id;
        }
        if self.store_path.is_none() {
            self.store_path = file_config.store_path;
        }
        if self.log_file.is_none() {
            self.log_file = file_config.log_file;
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.rpc_endpoint()?;

        if self.poll_interval == 0 {
            return Err(Error::config("Poll interval must be greater than 0"));
        }
        if self.refresh_attempts == 0 {
            return Err(Error::config("Refresh attempts must be greater than 0"));
        }
        if self.stale_after == 0 {
            return Err(Error::config("Stale threshold must be greater than 0"));
        }

        if let Some(zmq_host) = &self.zmq_host {
            if !zmq_host.contains("://") {
                return Err(Error::config(format!(
                    "Invalid ZMQ endpoint {:?}: expected e.g. tcp://127.0.0.1:28332",
                    zmq_host
                )));
            }
        }

        self.identity()?;
        if self.instance_id.is_some() && self.store_path.is_none() {
            return Err(Error::config(
                "An instance id requires a shared template store (--store-path)",
            ));
        }

        self.coordinator_config()?;
        Ok(())
    }

    /// Node RPC endpoint
    pub fn rpc_endpoint(&self) -> Result<RpcEndpoint> {
        let mut url = Url::parse(&self.rpc_url)
            .map_err(|e| Error::config(format!("Invalid RPC URL: {}", e)))?;
        url.set_port(Some(self.rpc_port))
            .map_err(|_| Error::config(format!("RPC URL {} cannot carry a port", self.rpc_url)))?;

        Ok(RpcEndpoint {
            url,
            user: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            timeout: self.rpc_timeout_duration(),
        })
    }

    /// Change detection mode
    pub fn notifier_mode(&self) -> NotifierMode {
        match &self.zmq_host {
            Some(endpoint) => NotifierMode::Push {
                endpoint: endpoint.clone(),
            },
            None => NotifierMode::Poll {
                interval: self.poll_interval_duration(),
            },
        }
    }

    /// Process identity, if this is one of several cooperating processes
    pub fn identity(&self) -> Result<Option<ProcessIdentity>> {
        self.instance_id
            .as_ref()
            .map(|id| ProcessIdentity::new(id.clone()))
            .transpose()
    }

    /// Mining state refresh bounds
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            attempts: self.refresh_attempts,
            spacing: Duration::from_millis(self.refresh_spacing),
            stale_after: self.stale_after,
        }
    }

    /// Template coordinator tuning
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let defaults = CoordinatorConfig::default();
        let lease_ttl = parse_duration("lease_ttl", &self.lease_ttl)?;
        let fetch_give_up = parse_duration("fetch_give_up_after", &self.fetch_give_up_after)?;
        let wait_give_up = parse_duration("wait_give_up_after", &self.wait_give_up_after)?;

        Ok(CoordinatorConfig {
            fetch_backoff: defaults
                .fetch_backoff
                .with_give_up_after(Some(fetch_give_up)),
            wait_backoff: defaults.wait_backoff.with_give_up_after(Some(wait_give_up)),
            lease_ttl: (!lease_ttl.is_zero()).then_some(lease_ttl),
            retain_heights: self.template_retention,
            ..defaults
        })
    }

    /// Get RPC timeout duration
    pub fn rpc_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    /// Get poll interval duration
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("Invalid {} {:?}: {}", name, value, e)))
}

// Default value functions for serde
fn default_rpc_url() -> String { "http://127.0.0.1".to_string() }
fn default_rpc_port() -> u16 { 8332 }
fn default_rpc_timeout() -> u64 { 10000 }
fn default_poll_interval() -> u64 { 500 }
fn default_lease_ttl() -> String { "30s".to_string() }
fn default_give_up() -> String { "10m".to_string() }
fn default_template_retention() -> u64 { 10 }
fn default_refresh_attempts() -> usize { 5 }
fn default_refresh_spacing() -> u64 { 100 }
fn default_stale_after() -> u32 { 3 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Config {
        Config::from_arg_matches(&matches(args)).unwrap()
    }

    fn matches(args: &[&str]) -> ArgMatches {
        let mut argv = vec!["pool-node-coordinator"];
        argv.extend_from_slice(args);
        Config::command().try_get_matches_from(argv).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(&["--rpc-url", "http://node.local"]);

        assert_eq!(config.rpc_port, 8332);
        assert_eq!(config.refresh_attempts, 5);
        assert_eq!(config.refresh_spacing, 100);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.rpc_endpoint().unwrap().url.as_str(), "http://node.local:8332/");
    }

    #[test]
    fn test_poll_mode_without_zmq() {
        let config = parse(&["--poll-interval", "250"]);
        assert_eq!(
            config.notifier_mode(),
            NotifierMode::Poll {
                interval: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_push_mode_with_zmq() {
        let config = parse(&["--zmq-host", "tcp://127.0.0.1:28332"]);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.notifier_mode(),
            NotifierMode::Push {
                endpoint: "tcp://127.0.0.1:28332".to_string()
            }
        );
    }

    #[test]
    fn test_instance_requires_store() {
        let config = parse(&["--instance-id", "1"]);
        assert!(config.validate().is_err());

        let config = parse(&["--instance-id", "1", "--store-path", "/tmp/t.sqlite"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.identity().unwrap().unwrap().as_str(), "1");
    }

    #[test]
    fn test_lease_ttl_zero_disables_expiry() {
        let config = parse(&["--lease-ttl", "0s"]);
        assert_eq!(config.coordinator_config().unwrap().lease_ttl, None);

        let config = parse(&["--lease-ttl", "45s"]);
        assert_eq!(
            config.coordinator_config().unwrap().lease_ttl,
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["--poll-interval", "0"]).validate().is_err());
        assert!(parse(&["--lease-ttl", "soon"]).validate().is_err());
        assert!(parse(&["--zmq-host", "127.0.0.1:28332"]).validate().is_err());
        assert!(parse(&["--rpc-url", "not a url"]).validate().is_err());
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
rpc_url: "http://10.0.0.5"
rpc_port: 18443
rpc_user: "pool"
rpc_password: "hunter2"
zmq_host: "tcp://10.0.0.5:28332"
instance_id: "2"
store_path: "/var/lib/pool/templates.sqlite"
lease_ttl: "1m"
poll_interval: 2000
template_retention: 25
log_format: json
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = Config::load_from_file(&temp_file.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(config.rpc_port, 18443);
        assert_eq!(config.rpc_password.as_deref(), Some("hunter2"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.refresh_attempts, 5);
        assert!(config.validate().is_ok());

        let cli = matches(&["--rpc-user", "cli-user", "--poll-interval", "750"]);
        let merged = Config::from_arg_matches(&cli)
            .unwrap()
            .merge_with_file(config, &cli);

        // explicit arguments win over the file
        assert_eq!(merged.rpc_user.as_deref(), Some("cli-user"));
        assert_eq!(merged.poll_interval, 750);

        // the file wins over built-in defaults
        assert_eq!(merged.instance_id.as_deref(), Some("2"));
        assert_eq!(merged.zmq_host.as_deref(), Some("tcp://10.0.0.5:28332"));
        assert_eq!(merged.rpc_url, "http://10.0.0.5");
        assert_eq!(merged.rpc_port, 18443);
        assert_eq!(merged.lease_ttl, "1m");
        assert_eq!(merged.template_retention, 25);
        assert_eq!(merged.log_format, LogFormat::Json);
        assert_eq!(merged.refresh_attempts, 5);
        assert_eq!(
            merged.coordinator_config().unwrap().lease_ttl,
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_load_with_config_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            temp_file,
            r#"{{"rpc_port": 18332, "poll_interval": 2000, "log_level": "debug"}}"#
        )
        .unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let config = Config::load_from_matches(&matches(&["--config-file", &path, "-l", "warn"]))
            .await
            .unwrap();

        assert_eq!(config.rpc_port, 18332);
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(2000));
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.rpc_endpoint().unwrap().url.port(), Some(18332));
    }

    #[test]
    fn test_template_retention() {
        assert_eq!(parse(&[]).coordinator_config().unwrap().retain_heights, 10);
        assert_eq!(
            parse(&["--template-retention", "0"])
                .coordinator_config()
                .unwrap()
                .retain_heights,
            0
        );
    }

    #[test]
    fn test_password_not_serialized() {
        let config = parse(&["--rpc-password", "hunter2"]);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
    }
}
