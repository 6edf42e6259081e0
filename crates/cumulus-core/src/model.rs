use crate::constants::defaults;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn short_id(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl Credentials {
    pub fn kind(&self) -> AuthKind {
        match self {
            Credentials::Token(_) => AuthKind::Token,
            Credentials::Basic { .. } => AuthKind::Basic,
        }
    }

    /// Builds credentials from the loose fields a config file or the CLI provides.
    pub fn from_parts(
        cluster: &str,
        token: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, ConfigError> {
        let token = token.filter(|t| !t.is_empty());
        let username = username.filter(|u| !u.is_empty());
        match (token, username, password) {
            (Some(_), Some(_), _) => Err(ConfigError::AmbiguousCredentials(cluster.to_string())),
            (Some(token), None, _) => Ok(Credentials::Token(token)),
            (None, Some(_), None) => Err(ConfigError::MissingPassword(cluster.to_string())),
            (None, Some(username), Some(password)) => Ok(Credentials::Basic { username, password }),
            (None, None, _) => Err(ConfigError::MissingCredentials(cluster.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Token,
    Basic,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Token => write!(f, "token"),
            AuthKind::Basic => write!(f, "basic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    Sequential,
    #[default]
    Parallel,
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMode::Sequential => write!(f, "sequential"),
            ConcurrencyMode::Parallel => write!(f, "parallel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseConcurrencyModeError(pub String);

impl fmt::Display for ParseConcurrencyModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid concurrency mode: '{}'. Valid values are: sequential, parallel",
            self.0
        )
    }
}

impl std::error::Error for ParseConcurrencyModeError {}

impl FromStr for ConcurrencyMode {
    type Err = ParseConcurrencyModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" | "serial" => Ok(ConcurrencyMode::Sequential),
            "parallel" => Ok(ConcurrencyMode::Parallel),
            _ => Err(ParseConcurrencyModeError(s.to_string())),
        }
    }
}

/// What the job does after a step fails for good.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnError::Stop => write!(f, "stop"),
            OnError::Continue => write!(f, "continue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOnErrorError(pub String);

impl fmt::Display for ParseOnErrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid on-error policy: '{}'. Valid values are: stop, continue",
            self.0
        )
    }
}

impl std::error::Error for ParseOnErrorError {}

impl FromStr for OnError {
    type Err = ParseOnErrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(OnError::Stop),
            "continue" => Ok(OnError::Continue),
            _ => Err(ParseOnErrorError(s.to_string())),
        }
    }
}

/// Storage endpoint settings, shared between clusters or local to one.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

impl StorageConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: None,
            secret_key: None,
            verify_tls: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Cluster entry exactly as written in `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawClusterConfig {
    #[serde(default)]
    name: Option<String>,
    endpoint: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_true", alias = "ssl")]
    verify_tls: bool,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    dedicated: bool,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    storage: Option<StorageConfig>,
}

/// One compute cluster. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawClusterConfig")]
pub struct ClusterConfig {
    pub name: String,
    pub endpoint: String,
    pub credentials: Credentials,
    pub verify_tls: bool,
    /// Steps explicitly bound to this cluster.
    pub steps: BTreeSet<String>,
    /// Excludes the cluster from round-robin; it only runs bound steps.
    pub dedicated: bool,
    pub service: String,
    /// Cluster-local object store, used only when it is the sole cluster.
    pub storage: Option<StorageConfig>,
}

impl TryFrom<RawClusterConfig> for ClusterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawClusterConfig) -> Result<Self, Self::Error> {
        let endpoint = raw.endpoint.trim().to_string();
        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| derive_cluster_name(&endpoint));
        if endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint(name));
        }
        let credentials = Credentials::from_parts(&name, raw.token, raw.username, raw.password)?;
        Ok(ClusterConfig {
            name,
            endpoint,
            credentials,
            verify_tls: raw.verify_tls,
            steps: raw.steps.into_iter().collect(),
            dedicated: raw.dedicated,
            service: raw
                .service
                .unwrap_or_else(|| defaults::SERVICE_NAME.to_string()),
            storage: raw.storage,
        })
    }
}

impl ClusterConfig {
    pub fn new(
        name: Option<String>,
        endpoint: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into().trim().to_string();
        let name = name.unwrap_or_else(|| derive_cluster_name(&endpoint));
        if endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint(name));
        }
        Ok(ClusterConfig {
            name,
            endpoint,
            credentials,
            verify_tls: true,
            steps: BTreeSet::new(),
            dedicated: false,
            service: defaults::SERVICE_NAME.to_string(),
            storage: None,
        })
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// `https://oscar.example.org:443/path` becomes `cluster-oscar.example.org`.
pub fn derive_cluster_name(endpoint: &str) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let host = host_port.split(':').next().unwrap_or_default();
    if host.is_empty() {
        "cluster-local".to_string()
    } else {
        format!("cluster-{}", host)
    }
}
