use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `GYMSLOT_*` environment variables at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
}

/// PEM certificate chain and private key for the optional TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Malformed { var: &'static str, value: String },
    Empty(&'static str),
    /// Only one of the two TLS variables was set.
    TlsPair { set: &'static str, missing: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Malformed { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::Empty(var) => write!(f, "{var} must not be empty"),
            ConfigError::TlsPair { set, missing } => {
                write!(f, "{set} is set but {missing} is not; set both or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "gymslot".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let admin_user = lookup("GYMSLOT_ADMIN_USER").unwrap_or(defaults.admin_user);
        if admin_user.is_empty() {
            return Err(ConfigError::Empty("GYMSLOT_ADMIN_USER"));
        }
        Ok(Self {
            port: parsed(&lookup, "GYMSLOT_PORT")?.unwrap_or(defaults.port),
            bind: lookup("GYMSLOT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("GYMSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("GYMSLOT_PASSWORD").unwrap_or(defaults.password),
            admin_user,
            max_connections: parsed(&lookup, "GYMSLOT_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "GYMSLOT_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "GYMSLOT_METRICS_PORT")?,
            tls: tls_files(&lookup)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn tls_files(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<TlsFiles>, ConfigError> {
    const CERT: &str = "GYMSLOT_TLS_CERT";
    const KEY: &str = "GYMSLOT_TLS_KEY";
    match (lookup(CERT), lookup(KEY)) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsFiles {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        })),
        (Some(_), None) => Err(ConfigError::TlsPair { set: CERT, missing: KEY }),
        (None, Some(_)) => Err(ConfigError::TlsPair { set: KEY, missing: CERT }),
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { var, value }),
    }
}
