//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Leaf variants carry a
//! human-readable message; the connection, retrieval and poll variants carry
//! the mailbox and step they belong to plus the underlying cause, so callers
//! can tell a rejected login apart from an unreachable spam folder.

use std::fmt;

use thiserror::Error;

use crate::mailbox::MailboxKind;

/// Step of opening a mailbox connection that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// TCP connect, TLS handshake or greeting
    Connect,
    /// LOGIN
    Authenticate,
    /// LIST of the account's folders
    List,
    /// EXAMINE of the resolved folder
    Select,
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Authenticate => "authenticate",
            Self::List => "list folders",
            Self::Select => "select folder",
        })
    }
}

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed configuration)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (folder, body section, missing mailbox connection)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Opening a mailbox connection failed at `step`
    #[error("{mailbox} connection failed to {step}: {source}")]
    Connection {
        /// Mailbox the connection was meant for
        mailbox: MailboxKind,
        /// Step that failed
        step: ConnectStep,
        /// Underlying cause
        #[source]
        source: Box<AppError>,
    },
    /// Search, fetch or parse failure on a live connection
    #[error("retrieval from {mailbox} failed: {source}")]
    Retrieval {
        /// Mailbox the retrieval ran against
        mailbox: MailboxKind,
        /// Underlying cause
        #[source]
        source: Box<AppError>,
    },
    /// Poll deadline passed without a matching message
    #[error("no matching message before the deadline{}", last_error_suffix(.last_error))]
    DeadlineExceeded {
        /// Last retrieval error observed while polling, if any
        last_error: Option<Box<AppError>>,
    },
    /// Poll was cancelled before a matching message arrived
    #[error("polling cancelled{}", last_error_suffix(.last_error))]
    Cancelled {
        /// Last retrieval error observed while polling, if any
        last_error: Option<Box<AppError>>,
    },
    /// Outbound SMTP submission failed
    #[error("send failed: {0}")]
    Send(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error ended a poll without a match
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. } | Self::Cancelled { .. })
    }

    /// Last retrieval error carried by an expired poll
    pub fn last_error(&self) -> Option<&AppError> {
        match self {
            Self::DeadlineExceeded { last_error } | Self::Cancelled { last_error } => {
                last_error.as_deref()
            }
            _ => None,
        }
    }
}

fn last_error_suffix(last_error: &Option<Box<AppError>>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
