//! Configuration for the mail account, timeouts and polling
//!
//! All configuration is loaded from environment variables prefixed with
//! `MAILPOLL_`. Server addresses are `host:port` strings; a [`Provider`]
//! preset fills them in for well-known mail services.

use std::env;
use std::env::VarError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};
use crate::retriever::DEFAULT_FETCH_LIMIT;

/// Well-known mail providers with their IMAP and SMTP addresses
///
/// Gmail needs an app password; Zoho needs IMAP enabled in its mail account
/// settings; AOL needs an app password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Google Mail
    Gmail,
    /// Zoho Mail
    Zoho,
    /// AOL Mail
    Aol,
}

impl Provider {
    /// IMAP `host:port`
    pub fn imap_addr(self) -> &'static str {
        match self {
            Self::Gmail => "imap.gmail.com:993",
            Self::Zoho => "imap.zoho.com:993",
            Self::Aol => "imap.aol.com:993",
        }
    }

    /// SMTP submission `host:port`
    pub fn smtp_addr(self) -> &'static str {
        match self {
            Self::Gmail => "smtp.gmail.com:587",
            Self::Zoho => "smtp.zoho.com:465",
            Self::Aol => "smtp.aol.com:465",
        }
    }
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "zoho" | "zohomail" => Ok(Self::Zoho),
            "aol" | "aolmail" => Ok(Self::Aol),
            other => Err(AppError::InvalidInput(format!(
                "unknown provider '{other}'; expected gmail, zoho or aol"
            ))),
        }
    }
}

/// A server's transport address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Hostname, also used for TLS SNI
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServerAddr {
    /// Parse a `host:port` string
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the port is missing or not a valid `u16`,
    /// or if the host is empty.
    pub fn parse(addr: &str) -> AppResult<Self> {
        let (host, port) = addr.trim().rsplit_once(':').ok_or_else(|| {
            AppError::InvalidInput(format!("address '{addr}' must be host:port"))
        })?;
        if host.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "address '{addr}' has an empty host"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AppError::InvalidInput(format!("address '{addr}' has an invalid port")))?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Mail account configuration
///
/// One credential pair used for both retrieval and submission. The password
/// is stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// IMAP server address
    pub imap: ServerAddr,
    /// SMTP submission address, if sending is configured
    pub smtp: Option<ServerAddr>,
    /// Username, usually the full email address
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

impl AccountConfig {
    /// Build an account from a transport address and credentials
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `imap_addr` is not a valid `host:port`.
    pub fn new(imap_addr: &str, user: impl Into<String>, pass: impl Into<String>) -> AppResult<Self> {
        let pass: String = pass.into();
        Ok(Self {
            imap: ServerAddr::parse(imap_addr)?,
            smtp: None,
            user: user.into(),
            pass: SecretString::new(pass.into()),
        })
    }

    /// Build an account from a provider preset, including its SMTP address
    ///
    /// # Errors
    ///
    /// Never fails for the built-in presets; kept fallible for symmetry with
    /// [`AccountConfig::new`].
    pub fn for_provider(
        provider: Provider,
        user: impl Into<String>,
        pass: impl Into<String>,
    ) -> AppResult<Self> {
        let mut account = Self::new(provider.imap_addr(), user, pass)?;
        account.smtp = Some(ServerAddr::parse(provider.smtp_addr())?);
        Ok(account)
    }
}

/// Socket timeouts applied to every network call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// TLS handshake, greeting and LOGIN timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-command socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl Timeouts {
    /// TCP connect timeout
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// TLS handshake, greeting and LOGIN timeout
    pub fn greeting(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    /// Per-command socket I/O timeout
    pub fn socket(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            greeting_timeout_ms: 15_000,
            socket_timeout_ms: 300_000,
        }
    }
}

/// Whole-process configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Account credentials and server addresses
    pub account: AccountConfig,
    /// Socket timeouts
    pub timeouts: Timeouts,
    /// Sleep between poll cycles in milliseconds
    pub poll_interval_ms: u64,
    /// Default poll budget in milliseconds
    pub poll_timeout_ms: u64,
    /// Maximum number of most recent matches fetched per mailbox
    pub fetch_limit: usize,
}

impl AppConfig {
    /// Load all configuration from environment variables
    ///
    /// Server addresses come from `MAILPOLL_IMAP_ADDR` and
    /// `MAILPOLL_SMTP_ADDR`; either may be omitted when `MAILPOLL_PROVIDER`
    /// names a preset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAILPOLL_PROVIDER=gmail
    /// MAILPOLL_USER=user@gmail.com
    /// MAILPOLL_PASS=app-password
    /// MAILPOLL_POLL_INTERVAL_MS=5000
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let provider = optional_env("MAILPOLL_PROVIDER")?
            .map(|p| p.parse::<Provider>())
            .transpose()?;

        let imap_addr = match (optional_env("MAILPOLL_IMAP_ADDR")?, provider) {
            (Some(addr), _) => addr,
            (None, Some(p)) => p.imap_addr().to_owned(),
            (None, None) => {
                return Err(AppError::InvalidInput(
                    "set MAILPOLL_IMAP_ADDR or MAILPOLL_PROVIDER".to_owned(),
                ));
            }
        };
        let smtp_addr = optional_env("MAILPOLL_SMTP_ADDR")?
            .or_else(|| provider.map(|p| p.smtp_addr().to_owned()));

        let mut account = AccountConfig::new(
            &imap_addr,
            required_env("MAILPOLL_USER")?,
            required_env("MAILPOLL_PASS")?,
        )?;
        account.smtp = smtp_addr.as_deref().map(ServerAddr::parse).transpose()?;

        let defaults = Timeouts::default();
        let fetch_limit = parse_usize_env("MAILPOLL_FETCH_LIMIT", DEFAULT_FETCH_LIMIT)?;
        if fetch_limit == 0 {
            return Err(AppError::InvalidInput(
                "MAILPOLL_FETCH_LIMIT must be at least 1".to_owned(),
            ));
        }

        Ok(Self {
            account,
            timeouts: Timeouts {
                connect_timeout_ms: parse_u64_env(
                    "MAILPOLL_CONNECT_TIMEOUT_MS",
                    defaults.connect_timeout_ms,
                )?,
                greeting_timeout_ms: parse_u64_env(
                    "MAILPOLL_GREETING_TIMEOUT_MS",
                    defaults.greeting_timeout_ms,
                )?,
                socket_timeout_ms: parse_u64_env(
                    "MAILPOLL_SOCKET_TIMEOUT_MS",
                    defaults.socket_timeout_ms,
                )?,
            },
            poll_interval_ms: parse_u64_env("MAILPOLL_POLL_INTERVAL_MS", 10_000)?,
            poll_timeout_ms: parse_u64_env("MAILPOLL_POLL_TIMEOUT_MS", 125_000)?,
            fetch_limit,
        })
    }

    /// Sleep between poll cycles
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default poll budget
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; empty counts as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
