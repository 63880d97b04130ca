//! Configuration schema, validation and the read-only store the rest of the
//! library works from.
//!
//! The raw [`ConfigFile`] mirrors the structured-text configuration the host
//! hands us. [`ConfigStore::new`] validates it in one pass and either returns
//! a fully-populated store or leaves nothing behind — a store is never
//! partially loaded.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Which portion of an HTTP transaction a payload represents.
///
/// `Everything` is a wildcard on the plugin side only: a model that accepts
/// `Everything` is eligible for any segment, but an `analyze` call always
/// names a concrete segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    RequestHeaders,
    RequestBody,
    AllRequest,
    ResponseHeaders,
    ResponseBody,
    AllResponse,
    Everything,
}

impl SegmentType {
    pub const ALL: [SegmentType; 7] = [
        SegmentType::RequestHeaders,
        SegmentType::RequestBody,
        SegmentType::AllRequest,
        SegmentType::ResponseHeaders,
        SegmentType::ResponseBody,
        SegmentType::AllResponse,
        SegmentType::Everything,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentType::RequestHeaders => "RequestHeaders",
            SegmentType::RequestBody => "RequestBody",
            SegmentType::AllRequest => "AllRequest",
            SegmentType::ResponseHeaders => "ResponseHeaders",
            SegmentType::ResponseBody => "ResponseBody",
            SegmentType::AllResponse => "AllResponse",
            SegmentType::Everything => "Everything",
        }
    }

    /// True if a model accepting `self` may process a payload of `segment`.
    pub fn accepts(&self, segment: SegmentType) -> bool {
        *self == segment || *self == SegmentType::Everything
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a segment name is not one of the seven known values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid segment type {0}")]
pub struct BadSegmentError(pub String);

impl FromStr for SegmentType {
    type Err = BadSegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RequestHeaders" => Ok(SegmentType::RequestHeaders),
            "RequestBody" => Ok(SegmentType::RequestBody),
            "AllRequest" => Ok(SegmentType::AllRequest),
            "ResponseHeaders" => Ok(SegmentType::ResponseHeaders),
            "ResponseBody" => Ok(SegmentType::ResponseBody),
            "AllResponse" => Ok(SegmentType::AllResponse),
            "Everything" => Ok(SegmentType::Everything),
            other => Err(BadSegmentError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Directive string understood by the tracing env filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ERROR") {
            Ok(LogLevel::Error)
        } else if s.eq_ignore_ascii_case("WARN") {
            Ok(LogLevel::Warn)
        } else if s.eq_ignore_ascii_case("INFO") {
            Ok(LogLevel::Info)
        } else if s.eq_ignore_ascii_case("DEBUG") {
            Ok(LogLevel::Debug)
        } else {
            Err(ConfigError::BadLogLevel(s.to_string()))
        }
    }
}

/// Raw model plugin entry as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModelPluginFile {
    pub id: String,
    pub path: String,
    pub weight: f64,
    pub threshold: f64,
    pub params: HashMap<String, String>,
    pub plugintype: String,
    pub mode: PluginMode,
    pub remote: bool,
}

/// Raw decision plugin entry as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DecisionPluginFile {
    pub id: String,
    pub path: String,
    pub wafweight: f64,
    pub decisionbalance: f64,
    pub params: HashMap<String, String>,
}

/// The full configuration file schema.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub logpath: String,
    pub loglevel: String,
    pub natsurl: String,
    pub modelplugins: Vec<ModelPluginFile>,
    pub decisionplugins: Vec<DecisionPluginFile>,
}

/// Validated model plugin descriptor. Immutable after config load.
#[derive(Debug, Clone)]
pub struct ModelPluginConfig {
    pub id: String,
    pub path: PathBuf,
    pub weight: f64,
    pub threshold: f64,
    pub params: HashMap<String, String>,
    pub segment: SegmentType,
    pub mode: PluginMode,
    pub remote: bool,
}

/// Validated decision plugin descriptor. Immutable after config load.
#[derive(Debug, Clone)]
pub struct DecisionPluginConfig {
    pub id: String,
    pub path: PathBuf,
    pub waf_weight: f64,
    pub decision_balance: f64,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("log path empty")]
    EmptyLogPath,
    #[error("invalid log path {path}: {source}")]
    LogPath {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid log level {0}")]
    BadLogLevel(String),
    #[error("{id} plugin path is empty, please provide a valid path")]
    EmptyPluginPath { id: String },
    #[error("{id} plugin path {path} cannot be opened: {source}")]
    PluginPath {
        id: String,
        path: String,
        source: std::io::Error,
    },
    #[error("{id} plugin type cannot be empty, please provide a valid type")]
    EmptySegment { id: String },
    #[error(transparent)]
    Segment(#[from] BadSegmentError),
    #[error("duplicate plugin id {0}")]
    DuplicateId(String),
}

const DEFAULT_NATS_URL: &str = "localhost:4222";

/// Validated plugin registry plus bus endpoint and logging settings.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    model_plugins: HashMap<String, ModelPluginConfig>,
    decision_plugins: HashMap<String, DecisionPluginConfig>,
    log_path: PathBuf,
    log_level: LogLevel,
    nats_url: String,
}

impl ConfigStore {
    /// Validate a raw configuration and build the store. On the first
    /// validation error nothing is kept.
    pub fn new(file: ConfigFile) -> Result<Self, ConfigError> {
        check_log_path(&file.logpath)?;
        let log_level: LogLevel = file.loglevel.parse()?;

        let mut model_plugins = HashMap::new();
        for entry in &file.modelplugins {
            check_plugin_path(&entry.id, &entry.path)?;
            if entry.plugintype.is_empty() {
                return Err(ConfigError::EmptySegment {
                    id: entry.id.clone(),
                });
            }
            let segment: SegmentType = entry.plugintype.parse()?;
            let descriptor = ModelPluginConfig {
                id: entry.id.clone(),
                path: PathBuf::from(&entry.path),
                weight: entry.weight,
                threshold: entry.threshold,
                params: entry.params.clone(),
                segment,
                mode: entry.mode,
                remote: entry.remote,
            };
            if model_plugins.insert(entry.id.clone(), descriptor).is_some() {
                return Err(ConfigError::DuplicateId(entry.id.clone()));
            }
        }

        let mut decision_plugins = HashMap::new();
        for entry in &file.decisionplugins {
            check_plugin_path(&entry.id, &entry.path)?;
            let descriptor = DecisionPluginConfig {
                id: entry.id.clone(),
                path: PathBuf::from(&entry.path),
                waf_weight: entry.wafweight,
                decision_balance: entry.decisionbalance,
                params: entry.params.clone(),
            };
            if decision_plugins
                .insert(entry.id.clone(), descriptor)
                .is_some()
            {
                return Err(ConfigError::DuplicateId(entry.id.clone()));
            }
        }

        let nats_url = if file.natsurl.is_empty() {
            DEFAULT_NATS_URL.to_string()
        } else {
            file.natsurl
        };

        Ok(Self {
            model_plugins,
            decision_plugins,
            log_path: PathBuf::from(file.logpath),
            log_level,
            nats_url,
        })
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        Self::new(file)
    }

    pub fn model(&self, id: &str) -> Option<&ModelPluginConfig> {
        self.model_plugins.get(id)
    }

    pub fn decision(&self, id: &str) -> Option<&DecisionPluginConfig> {
        self.decision_plugins.get(id)
    }

    /// True if the model plugin runs in async (non-gating) mode. Unknown ids
    /// are reported as sync.
    pub fn is_async(&self, id: &str) -> bool {
        self.model_plugins
            .get(id)
            .map(|m| m.mode == PluginMode::Async)
            .unwrap_or(false)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelPluginConfig> {
        self.model_plugins.values()
    }

    pub fn decisions(&self) -> impl Iterator<Item = &DecisionPluginConfig> {
        self.decision_plugins.values()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn nats_url(&self) -> &str {
        &self.nats_url
    }
}

fn check_log_path(path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::EmptyLogPath);
    }
    let p = Path::new(path);
    if fs::metadata(p).is_err() {
        // The file does not exist yet: probe writability by creating and
        // removing an empty one.
        fs::write(p, b"")
            .and_then(|_| fs::remove_file(p))
            .map_err(|source| ConfigError::LogPath {
                path: path.to_string(),
                source,
            })?;
    }
    Ok(())
}

fn check_plugin_path(id: &str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::EmptyPluginPath { id: id.to_string() });
    }
    fs::metadata(path).map_err(|source| ConfigError::PluginPath {
        id: id.to_string(),
        path: path.to_string(),
        source,
    })?;
    Ok(())
}
