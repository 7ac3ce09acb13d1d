use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Default number of connections created eagerly on the first update
pub const DEFAULT_MIN_SIZE: u32 = 1;

/// Default upper bound on pooled connections
pub const DEFAULT_MAX_SIZE: u32 = 10;

/// Default per-connection in-flight call count above which the pool may grow
pub const DEFAULT_MAX_STREAMS: u32 = 100;

/// Errors produced while decoding a configuration document
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed config: {0}")]
    Malformed(String),
}

/// Affinity command attached to a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffinityCommand {
    /// No sticky routing
    #[default]
    None,
    /// Record `key -> connection` once the call completes
    Bind,
    /// Route using an existing binding
    Bound,
    /// Route using an existing binding, then remove it
    Unbind,
}

/// Affinity settings for a group of methods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityConfig {
    /// Affinity command
    #[serde(default)]
    pub command: AffinityCommand,

    /// Dotted path of the key field inside the payload (e.g. "session.name")
    #[serde(default)]
    pub affinity_key: String,
}

/// Binds a set of fully-qualified method names to an affinity rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    /// Exact call names this entry applies to
    #[serde(default)]
    pub name: Vec<String>,

    /// Affinity rule, absent means no sticky routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<AffinityConfig>,
}

/// Channel pool sizing and unresponsive-connection detection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPoolConfig {
    /// Connections created eagerly (0 = default)
    #[serde(default)]
    pub min_size: u32,

    /// Upper bound on pooled connections (0 = default)
    #[serde(default)]
    pub max_size: u32,

    /// Average in-flight calls per READY connection above which the pool grows (0 = default)
    #[serde(default)]
    pub max_concurrent_streams_low_watermark: u32,

    /// Let a call whose bound connection is not READY use any READY connection
    #[serde(default)]
    pub fallback_to_ready: bool,

    /// Time since the last response before a connection may be replaced (0 = disabled)
    #[serde(default)]
    pub unresponsive_detection_ms: u32,

    /// Consecutive deadline-exceeded calls required before replacement
    #[serde(default)]
    pub unresponsive_calls: u32,
}

/// Root configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Pool settings
    #[serde(default)]
    pub channel_pool: ChannelPoolConfig,

    /// Per-method affinity rules
    #[serde(default)]
    pub method: Vec<MethodConfig>,
}

impl ApiConfig {
    /// Configuration with every field at its documented default and no method bindings
    pub fn defaults() -> Self {
        apply_defaults(Self::default())
    }

    /// Look up the affinity rule for an exact call name.
    ///
    /// The first method entry naming `method_name` wins.
    pub fn method_binding(&self, method_name: &str) -> Option<&AffinityConfig> {
        self.method
            .iter()
            .find(|m| m.name.iter().any(|n| n == method_name))
            .and_then(|m| m.affinity.as_ref())
    }

    /// Flatten the method list into an exact-name lookup table.
    ///
    /// Entries with command `NONE` are left out.
    pub fn affinity_table(&self) -> HashMap<String, AffinityConfig> {
        let mut table = HashMap::new();
        for method in &self.method {
            let Some(affinity) = &method.affinity else {
                continue;
            };
            for name in &method.name {
                if !table.contains_key(name) && affinity.command != AffinityCommand::None {
                    table.insert(name.clone(), affinity.clone());
                }
            }
        }
        table
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for method in &self.method {
            if let Some(affinity) = &method.affinity {
                if affinity.command != AffinityCommand::None && affinity.affinity_key.is_empty() {
                    return Err(ConfigError::Malformed(format!(
                        "affinity command {:?} on {:?} has no affinityKey",
                        affinity.command, method.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Resolve unset pool fields to their defaults.
///
/// Zero means "unset" for the size and watermark fields. `maxSize` is raised to
/// `minSize` when the two would otherwise be inverted.
pub fn apply_defaults(mut partial: ApiConfig) -> ApiConfig {
    let pool = &mut partial.channel_pool;
    if pool.min_size == 0 {
        pool.min_size = DEFAULT_MIN_SIZE;
    }
    if pool.max_size == 0 {
        pool.max_size = DEFAULT_MAX_SIZE;
    }
    if pool.max_size < pool.min_size {
        pool.max_size = pool.min_size;
    }
    if pool.max_concurrent_streams_low_watermark == 0 {
        pool.max_concurrent_streams_low_watermark = DEFAULT_MAX_STREAMS;
    }
    partial
}

/// Decode a JSON configuration document and resolve defaults.
///
/// Empty input and a JSON `null` both resolve to [`ApiConfig::defaults`].
pub fn parse(raw: &[u8]) -> Result<ApiConfig, ConfigError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(ApiConfig::defaults());
    }

    let decoded: Option<ApiConfig> =
        serde_json::from_slice(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    let config = apply_defaults(decoded.unwrap_or_default());
    config.validate()?;
    Ok(config)
}

/// Encode a configuration as JSON, the inverse of [`parse`]
pub fn to_json(config: &ApiConfig) -> Result<Vec<u8>, ConfigError> {
    serde_json::to_vec(config).map_err(|e| ConfigError::Malformed(e.to_string()))
}

/// Load configuration from a YAML or JSON file.
///
/// Files ending in `.json` are decoded as JSON, anything else as YAML.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ApiConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config file: {:?}", path))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        return parse(content.as_bytes()).context("Failed to parse JSON configuration");
    }
    if content.trim().is_empty() {
        return Ok(ApiConfig::defaults());
    }

    let decoded: Option<ApiConfig> =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;
    let config = apply_defaults(decoded.unwrap_or_default());
    config.validate().context("Invalid YAML configuration")?;

    debug!(path = ?path, methods = config.method.len(), "Loaded configuration file");
    Ok(config)
}

/// Load pool settings from environment variables
///
/// Recognised variables (each optional, unparsable values are ignored):
/// - CHANPOOL_MIN_SIZE
/// - CHANPOOL_MAX_SIZE
/// - CHANPOOL_LOW_WATERMARK
/// - CHANPOOL_FALLBACK_TO_READY
/// - CHANPOOL_UNRESPONSIVE_MS
/// - CHANPOOL_UNRESPONSIVE_CALLS
pub fn load_from_env() -> Result<ApiConfig> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let mut config = ApiConfig::default();
    let pool = &mut config.channel_pool;

    read_env("CHANPOOL_MIN_SIZE", &mut pool.min_size);
    read_env("CHANPOOL_MAX_SIZE", &mut pool.max_size);
    read_env(
        "CHANPOOL_LOW_WATERMARK",
        &mut pool.max_concurrent_streams_low_watermark,
    );
    read_env("CHANPOOL_FALLBACK_TO_READY", &mut pool.fallback_to_ready);
    read_env("CHANPOOL_UNRESPONSIVE_MS", &mut pool.unresponsive_detection_ms);
    read_env("CHANPOOL_UNRESPONSIVE_CALLS", &mut pool.unresponsive_calls);

    Ok(apply_defaults(config))
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse() {
            Ok(val) => *slot = val,
            Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable value"),
        }
    }
}

/// Load configuration from file or environment
///
/// # Arguments
/// * `config_path` - Optional path to a YAML/JSON config file
///
/// # Returns
/// * `Result<ApiConfig>` - Resolved configuration or error
pub fn load_config(config_path: Option<&str>) -> Result<ApiConfig> {
    match config_path {
        Some(path) => load_from_file(path),
        None => load_from_env(),
    }
}
