use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable carrying the serialized configuration from the
/// master process to a worker. The worker parses it once at startup and
/// removes it from its environment.
pub const PAYLOAD_ENV: &str = "FRONTDOOR_CONFIG";

/// Errors produced while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to encode config payload: {0}")]
    EncodePayload(serde_json::Error),
    #[error("failed to decode config payload: {0}")]
    DecodePayload(serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the front door
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Listeners to bind, plain or TLS
    #[serde(default)]
    pub listen: Vec<ListenSpec>,

    /// Routing rules, evaluated in array order
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    /// Number of worker processes: an integer, `true` (CPU count) or
    /// `false` (a single worker)
    #[serde(default)]
    pub workers: WorkerCount,

    /// Numeric uid the worker switches to after binding (Unix only)
    pub user: Option<u32>,

    /// Numeric gid the worker switches to after binding (Unix only)
    pub group: Option<u32>,
}

/// Worker count coercion: `integer | true (= CPU count) | false (= 1)`
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WorkerCount {
    Count(usize),
    Auto(bool),
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Auto(false)
    }
}

impl WorkerCount {
    /// Resolve to a concrete worker count (at least 1)
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::Count(n) => n.max(1),
            WorkerCount::Auto(true) => num_cpus::get(),
            WorkerCount::Auto(false) => 1,
        }
    }
}

/// One listener to bind
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListenSpec {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub address: String,

    /// Port to listen on
    pub port: u16,

    /// TLS material; absent means a plain listener
    pub tls: Option<TlsSpec>,
}

/// TLS material for a listener: static files, hostname-templated path
/// patterns, or both (static material serves clients that send no SNI)
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TlsSpec {
    /// Path to a PEM certificate chain
    pub cert: Option<String>,

    /// Path to a PEM private key
    pub key: Option<String>,

    /// Certificate path pattern; the `:hostname` token is replaced with
    /// the SNI hostname of each handshake
    pub cert_template: Option<String>,

    /// Key path pattern, same substitution as `cert_template`
    pub key_template: Option<String>,
}

impl TlsSpec {
    /// Whether this spec asks for per-SNI certificate resolution
    pub fn is_templated(&self) -> bool {
        self.cert_template.is_some() || self.key_template.is_some()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_template.is_some() != self.key_template.is_some() {
            return Err(ConfigError::Invalid(
                "tls cert_template and key_template must be set together".to_string(),
            ));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(ConfigError::Invalid(
                "tls cert and key must be set together".to_string(),
            ));
        }
        if self.cert.is_none() && self.cert_template.is_none() {
            return Err(ConfigError::Invalid(
                "tls listener needs cert/key or cert_template/key_template".to_string(),
            ));
        }
        Ok(())
    }
}

/// One routing rule: an action plus an optional predicate
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RuleSpec {
    /// The action to dispatch to
    #[serde(flatten)]
    pub action: ActionSpec,

    /// Predicate; a rule without one matches unconditionally
    pub when: Option<MatchSpec>,
}

/// Configured action variants
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionSpec {
    /// Serve files under a document root
    Static { root: PathBuf },

    /// Serve an HTML directory listing under a document root
    Index { root: PathBuf },

    /// Forward requests (and upgrades) to a single upstream target
    Proxy { target: String },

    /// Redirect to a fixed URL or to the request URL with components
    /// overridden
    Redirect {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        scheme: Option<String>,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        path: Option<String>,
    },

    /// Diagnostics endpoint; not intended for production exposure
    Info,
}

/// Declarative request predicate; all present fields must match
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MatchSpec {
    /// Exact hostname (case-insensitive, port stripped)
    pub host: Option<String>,

    /// Exact request path
    pub path: Option<String>,

    /// Segment-aligned path prefix
    pub path_prefix: Option<String>,

    /// HTTP method (case-insensitive)
    pub method: Option<String>,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        for spec in &self.listen {
            if let Some(tls) = &spec.tls {
                tls.validate()?;
            }
        }
        for rule in &self.rules {
            if let ActionSpec::Proxy { target } = &rule.action {
                let uri: hyper::Uri = target.parse().map_err(|e| {
                    ConfigError::Invalid(format!("proxy target '{}': {}", target, e))
                })?;
                if uri.authority().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "proxy target '{}' has no host",
                        target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize for the master→worker environment hand-off
    pub fn to_payload(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(ConfigError::EncodePayload)
    }

    /// Parse a payload produced by [`Config::to_payload`]
    pub fn from_payload(payload: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(payload).map_err(ConfigError::DecodePayload)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
