//! Server configuration.
//!
//! The configuration is not a file of its own: it is the `(config,)` record
//! in the object store, editable over the admin API like any other object.
//! Every consumer parses the whole tree and validates it before acting on
//! it; a tree that fails validation is never swapped in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use neurite_db::{Db, DbRef};
use neurite_http::{ListenerConfig, TlsConfig};

/// 1 MiB of parsed-object cache unless the admin says otherwise.
const DEFAULT_MAX_CACHE: u64 = 1024 * 1024;

fn default_listen() -> Vec<ListenEntry> {
    vec![ListenEntry::default()]
}

fn default_max_cache() -> u64 {
    DEFAULT_MAX_CACHE
}

fn default_threads() -> u32 {
    4
}

fn default_max_connections() -> u32 {
    32
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_level() -> String {
    "message".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAs {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsEntry {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenEntry {
    pub port: u16,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEntry>,
}

impl Default for ListenEntry {
    fn default() -> Self {
        Self {
            port: 8008,
            threads: default_threads(),
            max_connections: default_max_connections(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSection {
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,
    #[serde(default)]
    pub color: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            level: default_log_level(),
            timestamp_format: None,
            color: false,
        }
    }
}

/// The whole server configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<RunAs>,
    #[serde(default = "default_listen")]
    pub listen: Vec<ListenEntry>,
    #[serde(default = "default_max_cache")]
    pub max_cache: u64,
    pub federation: bool,
    pub registration: bool,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

/// Why a configuration could not be used.
#[derive(Debug)]
pub enum ConfigError {
    /// No `(config,)` record exists.
    Missing,

    /// The record exists but does not describe a runnable server.
    Invalid(String),

    /// The store failed underneath us.
    Db(neurite_db::DbError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing => write!(f, "no configuration record exists"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
            ConfigError::Db(e) => write!(f, "configuration store error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<neurite_db::DbError> for ConfigError {
    fn from(e: neurite_db::DbError) -> Self {
        ConfigError::Db(e)
    }
}

impl Config {
    /// Parse and validate a configuration tree.
    pub fn parse(tree: &Map<String, Value>) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_value(Value::Object(tree.clone()))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() || self.server_name.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "serverName must be a non-empty hostname".into(),
            ));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one listener must be configured".into(),
            ));
        }
        for entry in &self.listen {
            if entry.port == 0 {
                return Err(ConfigError::Invalid("listen.port must be non-zero".into()));
            }
            if entry.threads == 0 || entry.max_connections == 0 {
                return Err(ConfigError::Invalid(
                    "listen.threads and listen.maxConnections must be positive".into(),
                ));
            }
            if let Some(tls) = &entry.tls {
                if tls.cert.is_empty() || tls.key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "listen.tls requires both cert and key".into(),
                    ));
                }
            }
        }
        match self.log.output.as_str() {
            "stdout" | "file" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported log.output: '{other}'"
                )))
            }
        }
        match self.log.level.as_str() {
            "message" | "notice" | "debug" | "warning" | "error" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "invalid log.level: '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// The advertised base URL, defaulting to `https://{serverName}`.
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => format!("https://{}", self.server_name),
        }
    }

    /// Listener records in the form the HTTP stack consumes.
    pub fn listener_configs(&self) -> Vec<ListenerConfig> {
        self.listen
            .iter()
            .map(|entry| ListenerConfig {
                port: entry.port,
                threads: entry.threads as usize,
                max_connections: entry.max_connections as usize,
                tls: entry.tls.as_ref().map(|tls| TlsConfig {
                    cert: tls.cert.clone().into(),
                    key: tls.key.clone().into(),
                }),
            })
            .collect()
    }

    /// Whether a configuration record exists at all.
    pub fn exists(db: &Db) -> bool {
        db.exists(&["config"])
    }

    /// Write the default configuration record. Called once against an empty
    /// data directory.
    pub async fn create_default(db: &Db) -> Result<(), ConfigError> {
        let config = Config {
            server_name: "localhost".to_string(),
            base_url: None,
            identity_server: None,
            run_as: None,
            listen: default_listen(),
            max_cache: DEFAULT_MAX_CACHE,
            federation: true,
            registration: false,
            log: LogSection::default(),
            pid: None,
        };

        let tree = match serde_json::to_value(&config) {
            Ok(Value::Object(map)) => map,
            _ => return Err(ConfigError::Invalid("default config did not serialize".into())),
        };

        let mut r = db.create(&["config"]).await?;
        r.set_json(tree);
        db.unlock(r).await?;
        Ok(())
    }

    /// Read, parse, and release the configuration record.
    pub async fn load(db: &Db) -> Result<Config, ConfigError> {
        let (r, config) = Config::lock(db).await?;
        db.unlock(r).await?;
        Ok(config)
    }

    /// Lock the configuration record, returning both the raw reference (for
    /// endpoints that rewrite it) and the parsed view.
    pub async fn lock(db: &Db) -> Result<(DbRef, Config), ConfigError> {
        let r = db.lock(&["config"]).await?.ok_or(ConfigError::Missing)?;
        match Config::parse(r.json()) {
            Ok(config) => Ok((r, config)),
            Err(e) => {
                db.unlock(r).await?;
                Err(e)
            }
        }
    }
}

/// Recursively merge `patch` over `base`: object values merge key-by-key,
/// anything else replaces.
pub fn merge(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, patch_value) in patch {
        match (base.get_mut(key), patch_value) {
            (Some(Value::Object(base_obj)), Value::Object(patch_obj)) => {
                merge(base_obj, patch_obj);
            }
            _ => {
                base.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Install the global tracing subscriber from the log section. `verbose`
/// forces debug regardless of the configured level.
pub fn init_logging(log: &LogSection, verbose: bool) -> Result<(), String> {
    use tracing_subscriber::EnvFilter;

    let level = if verbose {
        "debug"
    } else {
        match log.level.as_str() {
            "debug" => "debug",
            "warning" => "warn",
            "error" => "error",
            // "message" and "notice" are both informational.
            _ => "info",
        }
    };
    let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
    let without_time = log.timestamp_format.as_deref() == Some("none");

    let result = match (log.output.as_str(), without_time) {
        ("file", false) => {
            let file = open_log_file()?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .try_init()
        }
        ("file", true) => {
            let file = open_log_file()?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .without_time()
                .try_init()
        }
        (_, false) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(log.color)
            .try_init(),
        (_, true) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(log.color)
            .without_time()
            .try_init(),
    };

    result.map_err(|e| e.to_string())
}

fn open_log_file() -> Result<std::sync::Arc<std::fs::File>, String> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("neurite.log")
        .map(std::sync::Arc::new)
        .map_err(|e| format!("unable to open log file: {e}"))
}
