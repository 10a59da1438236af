//! Session and manager configuration
//!
//! [`SessionConfig`] describes one signaling connection: agent identity,
//! server endpoints, ICE/relay servers and the custom routing headers
//! attached to calls. It is built once per `initialize()` and owned by the
//! session manager for the lifetime of that connection.
//!
//! [`ManagerSettings`] holds the orchestration timing: poll interval,
//! eviction grace, lookup and retry budgets.
//!
//! # Usage Examples
//!
//! ```rust
//! use call_session_core::{SessionConfig, HeaderValue};
//!
//! let config = SessionConfig::new("agent-7", "s3cret")
//!     .with_display_name("Agent Seven")
//!     .with_realm("voice.example.com")
//!     .with_signaling_url("wss://voice.example.com/ws")
//!     .with_header("X-Campaign-Id", 4711)
//!     .with_header("X-Queue", "inbound-sales")
//!     .with_verbose_logging(true);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.custom_headers["X-Campaign-Id"], HeaderValue::Integer(4711));
//! ```
//!
//! ## Loading from TOML
//!
//! ```rust
//! use call_session_core::SessionConfig;
//!
//! let config = SessionConfig::from_toml_str(r#"
//!     username = "agent-7"
//!     password = "s3cret"
//!     realm = "voice.example.com"
//!     signaling_url = "wss://voice.example.com/ws"
//!
//!     [[ice_servers]]
//!     urls = ["stun:stun.example.com:3478"]
//!
//!     [custom_headers]
//!     X-Campaign-Id = 4711
//! "#).unwrap();
//!
//! assert_eq!(config.ice_servers.len(), 1);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SessionError, SessionResult};
use crate::recovery::RetryConfig;

/// Scalar value of a custom routing header (campaign id, queue id, disposition...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{}", v),
            HeaderValue::Integer(v) => write!(f, "{}", v),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Integer(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Integer(v.into())
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

/// Ordered header map; ordering keeps logs and wire encoding stable
pub type Headers = BTreeMap<String, HeaderValue>;

/// One STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Immutable per-connection configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Agent address of record, e.g. `agent-7@voice.example.com`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub signaling_url: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub custom_headers: Headers,
    /// Verbose logging for the signaling client
    #[serde(default)]
    pub debug: bool,
}

// Keep the password out of logs
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("address", &self.address)
            .field("realm", &self.realm)
            .field("signaling_url", &self.signaling_url)
            .field("ice_servers", &self.ice_servers.len())
            .field("custom_headers", &self.custom_headers)
            .field("debug", &self.debug)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            display_name: None,
            address: None,
            realm: None,
            signaling_url: None,
            ice_servers: Vec::new(),
            custom_headers: Headers::new(),
            debug: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> SessionResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| SessionError::InvalidConfiguration {
            field: "toml".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| SessionError::InvalidConfiguration {
            field: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&input)
    }

    /// Check credentials and endpoints
    ///
    /// Failures are configuration errors: fatal to `initialize()` and never
    /// retried.
    pub fn validate(&self) -> SessionResult<()> {
        if self.username.trim().is_empty() {
            return Err(invalid("username", "must not be empty"));
        }
        if self.password.is_empty() {
            return Err(invalid("password", "must not be empty"));
        }
        if let Some(raw) = &self.signaling_url {
            let url = Url::parse(raw).map_err(|e| invalid("signaling_url", &e.to_string()))?;
            if !matches!(url.scheme(), "ws" | "wss" | "http" | "https" | "sip" | "sips") {
                return Err(invalid(
                    "signaling_url",
                    &format!("unsupported scheme '{}'", url.scheme()),
                ));
            }
        }
        for (index, server) in self.ice_servers.iter().enumerate() {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err(invalid(&format!("ice_servers[{}]", index), "urls must not be empty"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> SessionError {
    SessionError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Orchestration timing and retry budgets
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Interval between reconciliation ticks
    pub poll_interval: Duration,
    /// How long an evicted call keeps its subscriptions before release
    pub eviction_grace: Duration,
    /// Attempts to find a dialed call in the registry
    pub call_lookup_attempts: u32,
    /// Delay between lookup attempts
    pub call_lookup_delay: Duration,
    /// Upper bound for a single registration round-trip
    pub register_timeout: Duration,
    /// Retry budget for connect + register
    pub connect_retry: RetryConfig,
    /// Retry budget for dial requests
    pub dial_retry: RetryConfig,
    /// Retry budget for the automatic post-call reconnection
    pub reconnect_retry: RetryConfig,
    /// Subscriber callbacks running longer than this are reported
    pub callback_budget: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            eviction_grace: Duration::from_secs(10),
            call_lookup_attempts: 10,
            call_lookup_delay: Duration::from_millis(300),
            register_timeout: Duration::from_secs(10),
            connect_retry: RetryConfig::fixed(3, Duration::from_millis(500)),
            dial_retry: RetryConfig::quick(),
            reconnect_retry: RetryConfig::slow(),
            callback_budget: Duration::from_millis(50),
        }
    }
}

impl ManagerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    pub fn with_call_lookup(mut self, attempts: u32, delay: Duration) -> Self {
        self.call_lookup_attempts = attempts;
        self.call_lookup_delay = delay;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    pub fn with_dial_retry(mut self, retry: RetryConfig) -> Self {
        self.dial_retry = retry;
        self
    }

    pub fn with_reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.reconnect_retry = retry;
        self
    }

    pub fn with_callback_budget(mut self, budget: Duration) -> Self {
        self.callback_budget = budget;
        self
    }
}

/// Normalize a dial destination into canonical international form
///
/// Formatting characters are stripped, a leading `00` becomes `+` and a
/// missing `+` is prepended. The digits must form a valid E.164 number.
///
/// ```rust
/// use call_session_core::normalize_destination;
///
/// assert_eq!(normalize_destination("1 (555) 123-4567").unwrap(), "+15551234567");
/// assert_eq!(normalize_destination("0044 20 7946 0000").unwrap(), "+442079460000");
/// assert!(normalize_destination("call me").is_err());
/// ```
pub fn normalize_destination(destination: &str) -> SessionResult<String> {
    let compact: String = destination
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    let digits = if let Some(rest) = compact.strip_prefix('+') {
        rest
    } else if let Some(rest) = compact.strip_prefix("00") {
        rest
    } else {
        compact.as_str()
    };

    if digits.is_empty() || digits.len() > 15 {
        return Err(SessionError::InvalidInput {
            field: "destination",
            reason: format!("'{}' is not a dialable number", destination),
        });
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(SessionError::InvalidInput {
            field: "destination",
            reason: format!("'{}' contains non-digit characters", destination),
        });
    }
    Ok(format!("+{}", digits))
}

/// Validate and upper-case a DTMF tone string
pub fn normalize_dtmf(tone: &str) -> SessionResult<String> {
    if tone.is_empty() {
        return Err(SessionError::InvalidInput {
            field: "dtmf",
            reason: "tone must not be empty".to_string(),
        });
    }
    let upper = tone.to_ascii_uppercase();
    if let Some(bad) = upper
        .chars()
        .find(|c| !(c.is_ascii_digit() || matches!(c, '*' | '#' | 'A' | 'B' | 'C' | 'D')))
    {
        return Err(SessionError::InvalidInput {
            field: "dtmf",
            reason: format!("'{}' is not a DTMF digit", bad),
        });
    }
    Ok(upper)
}
