//! Connection configuration.
//!
//! A [`ConnectionContext`] is built once, before the link is used, and is
//! read-only afterwards. It can be assembled in code, from a flat property
//! map, or from a YAML/TOML file with environment overrides.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{CommError, ErrorKind};

/// Default peer host
pub const DEFAULT_HOST: &str = "localhost";
/// Default RFC1006 port
pub const DEFAULT_PORT: u16 = 102;
/// Default connection name
pub const DEFAULT_NAME: &str = "link";
/// Default connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 20_000;

/// Property keys understood by [`ConnectionContext::from_properties`]
pub mod keys {
    /// Peer host (client) or ignored (server)
    pub const HOST: &str = "host";
    /// TCP port
    pub const PORT: &str = "port";
    /// Connection name used in logs and errors
    pub const NAME: &str = "name";
    /// `CLIENT` or `SERVER`
    pub const MODE: &str = "mode";
    /// Connection timeout in milliseconds
    pub const TIMEOUT_MILLIS: &str = "timeout.millis";
    /// Calling TSAP
    pub const CALLING_TSAP: &str = "calling.tsap";
    /// Called TSAP
    pub const CALLED_TSAP: &str = "called.tsap";
    /// Acknowledgement tracking flag
    pub const AK_ENABLED: &str = "ak.enabled";
}

/// Which side of the link this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionMode {
    /// Opens both channels towards the peer
    Client,
    /// Listens and accepts both channels from the peer
    Server,
}

impl FromStr for ConnectionMode {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLIENT" => Ok(ConnectionMode::Client),
            "SERVER" => Ok(ConnectionMode::Server),
            _ => Err(CommError::new(ErrorKind::TypeConvert, "unknown connection mode")
                .with_arg("parameter", keys::MODE)
                .with_arg("value", s)),
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Client => f.write_str("CLIENT"),
            ConnectionMode::Server => f.write_str("SERVER"),
        }
    }
}

/// Validated, immutable connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionContext {
    /// Peer host
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Connection name
    pub name: String,
    /// Client or server side
    pub mode: ConnectionMode,
    /// Budget for establishing the link, handshake included
    pub timeout: Duration,
    /// Calling TSAP exchanged during the handshake
    pub calling_tsap: String,
    /// Called TSAP exchanged during the handshake
    pub called_tsap: String,
    /// Whether sent messages must be acknowledged by the peer
    pub ak_enabled: bool,
}

impl ConnectionContext {
    /// Create a context with default host, port, name, timeout and acknowledgements on
    pub fn new(mode: ConnectionMode, calling_tsap: impl Into<String>, called_tsap: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            name: DEFAULT_NAME.to_string(),
            mode,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MILLIS),
            calling_tsap: calling_tsap.into(),
            called_tsap: called_tsap.into(),
            ak_enabled: true,
        }
    }

    /// Set the peer host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the TCP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable acknowledgement tracking
    pub fn with_ak_enabled(mut self, ak_enabled: bool) -> Self {
        self.ak_enabled = ak_enabled;
        self
    }

    /// Whether this endpoint is the client side
    pub fn is_client(&self) -> bool {
        self.mode == ConnectionMode::Client
    }

    /// Build a context from the flat property keys in [`keys`]
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, CommError> {
        let mut config = ConnectionConfig::default();
        for (key, value) in properties {
            config.set(key, value)?;
        }
        config.build()
    }

    /// Load from a YAML (or `.toml`) file, then apply `LINK_*` environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> anyhow::Result<Self> {
        let mut config = ConnectionConfig::load_from_file(config_path)?;
        config.apply_environment_overrides();
        let context = config.build()?;

        info!(
            "Final connection configuration: name={}, mode={}, host={}, port={}, timeout={:?}, ak_enabled={}",
            context.name, context.mode, context.host, context.port, context.timeout, context.ak_enabled
        );
        Ok(context)
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {}:{})", self.name, self.mode, self.host, self.port)
    }
}

/// Raw configuration values, every field optional until [`ConnectionConfig::build`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Peer host
    pub host: Option<String>,
    /// TCP port
    pub port: Option<u16>,
    /// Connection name
    pub name: Option<String>,
    /// Client or server side (mandatory)
    pub mode: Option<ConnectionMode>,
    /// Connection timeout in milliseconds
    pub timeout_millis: Option<u64>,
    /// Calling TSAP (mandatory)
    pub calling_tsap: Option<String>,
    /// Called TSAP (mandatory)
    pub called_tsap: Option<String>,
    /// Acknowledgement tracking flag
    pub ak_enabled: Option<bool>,
}

impl ConnectionConfig {
    /// Read a configuration file; a missing file yields an empty configuration
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> anyhow::Result<Self> {
        let path = config_path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                return Ok(Self::default());
            }
        };

        let is_toml = path.extension().map_or(false, |ext| ext == "toml");
        let config = if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("failed to parse TOML config {:?}", path))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse YAML config {:?}", path))?
        };

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Set one value from its property key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), CommError> {
        match key {
            keys::HOST => self.host = Some(value.to_string()),
            keys::PORT => self.port = Some(parse_value(key, value)?),
            keys::NAME => self.name = Some(value.to_string()),
            keys::MODE => self.mode = Some(value.parse()?),
            keys::TIMEOUT_MILLIS => self.timeout_millis = Some(parse_value(key, value)?),
            keys::CALLING_TSAP => self.calling_tsap = Some(value.to_string()),
            keys::CALLED_TSAP => self.called_tsap = Some(value.to_string()),
            keys::AK_ENABLED => self.ak_enabled = Some(parse_value(key, value)?),
            _ => warn!("Ignoring unknown connection property {}", key),
        }
        Ok(())
    }

    /// Apply `LINK_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        const OVERRIDES: [(&str, &str); 8] = [
            ("LINK_HOST", keys::HOST),
            ("LINK_PORT", keys::PORT),
            ("LINK_NAME", keys::NAME),
            ("LINK_MODE", keys::MODE),
            ("LINK_TIMEOUT_MILLIS", keys::TIMEOUT_MILLIS),
            ("LINK_CALLING_TSAP", keys::CALLING_TSAP),
            ("LINK_CALLED_TSAP", keys::CALLED_TSAP),
            ("LINK_AK_ENABLED", keys::AK_ENABLED),
        ];

        for (variable, key) in OVERRIDES {
            if let Some(value) = lookup(variable) {
                match self.set(key, &value) {
                    Ok(()) => info!("{} overridden by environment: {}", key, value),
                    Err(e) => warn!("Ignoring {}={}: {}", variable, value, e),
                }
            }
        }
    }

    /// Check mandatory values and produce the immutable context
    pub fn build(self) -> Result<ConnectionContext, CommError> {
        let mode = self.mode.ok_or_else(|| mandatory(keys::MODE))?;
        let calling_tsap = self
            .calling_tsap
            .filter(|tsap| !tsap.is_empty())
            .ok_or_else(|| mandatory(keys::CALLING_TSAP))?;
        let called_tsap = self
            .called_tsap
            .filter(|tsap| !tsap.is_empty())
            .ok_or_else(|| mandatory(keys::CALLED_TSAP))?;

        let mut context = ConnectionContext::new(mode, calling_tsap, called_tsap);
        if let Some(host) = self.host {
            context.host = host;
        }
        if let Some(port) = self.port {
            context.port = port;
        }
        if let Some(name) = self.name {
            context.name = name;
        }
        if let Some(millis) = self.timeout_millis {
            context.timeout = Duration::from_millis(millis);
        }
        if let Some(ak_enabled) = self.ak_enabled {
            context.ak_enabled = ak_enabled;
        }
        Ok(context)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, CommError> {
    value.trim().parse().map_err(|_| {
        CommError::new(ErrorKind::TypeConvert, "cannot convert property value")
            .with_arg("parameter", key)
            .with_arg("value", value)
            .with_arg("type", std::any::type_name::<T>())
    })
}

fn mandatory(key: &str) -> CommError {
    CommError::new(ErrorKind::Configuration, "mandatory connection value missing")
        .with_arg("parameter", key)
        .with_arg("value", "null")
}
