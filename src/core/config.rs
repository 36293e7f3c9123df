//! Application configuration management
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables (including a `.env` file), then CLI flags
//! (applied in `main`). All values are validated at startup so the server
//! fails fast if misconfigured.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default SSE port
const DEFAULT_PORT: u16 = 8888;

/// Default subprocess timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default cap on the text returned by a single tool call
const DEFAULT_MAX_RESPONSE_SIZE: usize = 100_000;

/// Default CloudFormation schema refresh interval
const DEFAULT_SCHEMA_REFRESH_DAYS: u64 = 7;
const MAX_SCHEMA_REFRESH_DAYS: u64 = 3650;

/// Default Neptune HTTPS port
const DEFAULT_NEPTUNE_PORT: u16 = 8182;

/// Default connection pool bound
const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default idle time before a pooled connection is closed
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    /// Path or name of the AWS CLI binary
    pub cli_path: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            cli_path: "aws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_secs: u64,
    pub max_response_size: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CfnConfig {
    pub readonly: bool,
    /// Defaults to `~/.cache/aws-mcp-servers/schemas`
    pub schema_cache_dir: Option<PathBuf>,
    pub schema_refresh_days: u64,
}

impl Default for CfnConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            schema_cache_dir: None,
            schema_refresh_days: DEFAULT_SCHEMA_REFRESH_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnsSqsConfig {
    pub allow_resource_creation: bool,
}

impl Default for SnsSqsConfig {
    fn default() -> Self {
        Self {
            allow_resource_creation: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KendraConfig {
    pub default_index_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NeptuneConfig {
    /// Host name or full URL of the cluster endpoint
    pub endpoint: Option<String>,
    pub port: u16,
}

impl Default for NeptuneConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            port: DEFAULT_NEPTUNE_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamConfig {
    pub binary: String,
    pub allow_write: bool,
    pub allow_sensitive_data_access: bool,
}

impl Default for SamConfig {
    fn default() -> Self {
        Self {
            binary: "sam".to_string(),
            allow_write: false,
            allow_sensitive_data_access: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerraformConfig {
    pub binary: String,
    pub registry_url: String,
    pub provider_docs_url: String,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            registry_url: "https://registry.terraform.io".to_string(),
            provider_docs_url:
                "https://raw.githubusercontent.com/hashicorp/terraform-provider-aws/main/website/docs"
                    .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FinchConfig {
    pub binary: String,
}

impl Default for FinchConfig {
    fn default() -> Self {
        Self {
            binary: "finch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentDbConfig {
    pub readonly: bool,
    pub connection_string: Option<String>,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
}

impl Default for DocumentDbConfig {
    fn default() -> Self {
        Self {
            readonly: true,
            connection_string: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Shared settings for the Valkey and Memcached servers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    /// Falls back to the protocol's well-known port when unset
    pub port: Option<u16>,
    pub readonly: bool,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            readonly: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub aws: AwsConfig,
    pub request: RequestConfig,
    pub cfn: CfnConfig,
    pub sns_sqs: SnsSqsConfig,
    pub kendra: KendraConfig,
    pub neptune: NeptuneConfig,
    pub sam: SamConfig,
    pub terraform: TerraformConfig,
    pub finch: FinchConfig,
    pub documentdb: DocumentDbConfig,
    pub valkey: CacheConfig,
    pub memcached: CacheConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read configuration file")?;
        toml::from_str(&content).context("Failed to parse TOML configuration")
    }

    /// Load configuration from the environment and an optional config file
    ///
    /// The file is taken from `explicit_path`, then `CONFIG_PATH`, then
    /// `config.toml` in the current directory. A missing default file is
    /// not an error; a missing explicit file is.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)
                .with_context(|| format!("Could not load {}", path.display()))?,
            None => {
                let path =
                    std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
                if Path::new(&path).exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override values from environment variables
    ///
    /// Takes a lookup function so tests do not have to mutate the process
    /// environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(region) = non_empty("AWS_REGION").or_else(|| non_empty("AWS_DEFAULT_REGION"))
        {
            self.aws.region = Some(region);
        }
        if let Some(profile) = non_empty("AWS_PROFILE") {
            self.aws.profile = Some(profile);
        }
        if let Some(level) = non_empty("FASTMCP_LOG_LEVEL").or_else(|| non_empty("LOG_LEVEL")) {
            self.server.log_level = level;
        }
        if let Some(index) = non_empty("KENDRA_INDEX_ID") {
            self.kendra.default_index_id = Some(index);
        }
        if let Some(endpoint) = non_empty("NEPTUNE_ENDPOINT") {
            self.neptune.endpoint = Some(endpoint);
        }
        if let Some(conn) = non_empty("DOCUMENTDB_CONNECTION_STRING") {
            self.documentdb.connection_string = Some(conn);
        }
        if let Some(host) = non_empty("VALKEY_HOST") {
            self.valkey.host = host;
        }
        if let Some(port) = non_empty("VALKEY_PORT").and_then(|p| p.parse().ok()) {
            self.valkey.port = Some(port);
        }
        if let Some(host) = non_empty("MEMCACHED_HOST") {
            self.memcached.host = host;
        }
        if let Some(port) = non_empty("MEMCACHED_PORT").and_then(|p| p.parse().ok()) {
            self.memcached.port = Some(port);
        }
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.request.timeout_secs == 0 {
            bail!("request.timeout_secs must be at least 1");
        }
        if self.request.max_response_size < 1024 {
            bail!("request.max_response_size must be at least 1024 bytes");
        }
        if !(1..=MAX_SCHEMA_REFRESH_DAYS).contains(&self.cfn.schema_refresh_days) {
            bail!(
                "cfn.schema_refresh_days must be between 1 and {}",
                MAX_SCHEMA_REFRESH_DAYS
            );
        }
        for (name, cache) in [("valkey", &self.valkey), ("memcached", &self.memcached)] {
            if cache.max_connections == 0 {
                bail!("{}.max_connections must be at least 1", name);
            }
        }
        if self.documentdb.max_connections == 0 {
            bail!("documentdb.max_connections must be at least 1");
        }
        Ok(())
    }

    /// Directory holding cached CloudFormation schemas
    pub fn schema_cache_dir(&self) -> PathBuf {
        self.cfn.schema_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("aws-mcp-servers")
                .join("schemas")
        })
    }
}
