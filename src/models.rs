//! Normalized message model
//!
//! [`Message`] is the single simplified shape every fetched message is
//! reduced to, whatever its wire-level MIME structure was.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mailbox::MailboxKind;

/// Text body flavour, used both for the selected main part and for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MimeType {
    /// `text/plain`
    #[serde(rename = "text/plain")]
    PlainText,
    /// `text/html`
    #[serde(rename = "text/html")]
    Html,
}

impl MimeType {
    /// Content type string, e.g. `text/html`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlainText => "text/plain",
            Self::Html => "text/html",
        }
    }

    /// Classify a declared content type; anything but plain text or HTML is `None`
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.trim().to_ascii_lowercase().as_str() {
            "text/plain" => Some(Self::PlainText),
            "text/html" => Some(Self::Html),
            _ => None,
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetched message reduced to what a caller polling for a reply needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Envelope date; `None` if missing or unparseable
    pub date: Option<DateTime<Utc>>,
    /// First envelope sender address, empty if unknown
    pub from: String,
    /// Envelope subject, empty if unknown
    pub subject: String,
    /// Content of the selected main part only
    pub body: String,
    /// Top-level content type reported by the server
    pub mime_type: String,
    /// Which text part became `body`; `None` when there was no inline text
    pub main_part: Option<MimeType>,
    /// Mailbox the message was fetched from
    pub mailbox: MailboxKind,
    /// Sequence number at fetch time
    pub seq: u32,
    /// Server UID, if reported
    pub uid: Option<u32>,
}
