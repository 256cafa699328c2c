//! mailpoll: wait for an email to arrive over IMAP
//!
//! Opens read-only IMAP connections to an account's inbox and spam folders,
//! searches both with one set of criteria, reduces every match to a single
//! text body, and polls until a matching message arrives or a deadline
//! passes. Built for flows like "send a one-time code, then read it back".
//!
//! # Architecture
//!
//! - [`config`]: Environment-driven account, provider and timeout settings
//! - [`errors`]: Application error model
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`mailbox`]: Mailbox kinds, folder resolution and one connection per kind
//! - [`search`]: Criteria and their translation to IMAP `SEARCH`
//! - [`mime`]: Message normalization and main-part selection
//! - [`models`]: The normalized message type
//! - [`retriever`]: Concurrent retrieval across several mailboxes
//! - [`poll`]: Repeated retrieval until a match or deadline
//! - [`sender`]: Outgoing mail over SMTP

pub mod config;
pub mod errors;
pub mod imap;
pub mod mailbox;
pub mod mime;
pub mod models;
pub mod poll;
pub mod retriever;
pub mod search;
pub mod sender;

#[cfg(test)]
mod testing;

pub use config::{AccountConfig, AppConfig, Provider, Timeouts};
pub use errors::{AppError, AppResult};
pub use imap::{ImapConnector, TlsSession};
pub use mailbox::MailboxKind;
pub use models::{Message, MimeType};
pub use poll::Poller;
pub use retriever::Retriever;
pub use search::SearchCriteria;
pub use sender::{Sender, SmtpSender};

/// Retriever over real TLS IMAP sessions
pub type ImapRetriever = Retriever<TlsSession>;
