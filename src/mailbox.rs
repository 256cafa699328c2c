//! Logical mailboxes and the connections bound to them
//!
//! A [`MailboxKind`] names a category of folder (inbox, spam) independent of
//! how a provider spells it. [`resolve_folder`] maps a kind onto the real
//! folder list, and [`MailboxConnection`] owns one authenticated session
//! that has that folder selected read-only.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::errors::{AppError, AppResult, ConnectStep};
use crate::imap::{Connector, FolderStatus, MailSession, RawMessage};

static INBOX_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| case_insensitive(MailboxKind::Inbox.pattern()));
static SPAM_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| case_insensitive(MailboxKind::Spam.pattern()));

fn case_insensitive(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

/// Logical mailbox category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    /// The primary inbox
    Inbox,
    /// Spam / bulk / junk folder
    Spam,
}

impl MailboxKind {
    /// Every kind, in the order connections are opened
    pub const ALL: [MailboxKind; 2] = [MailboxKind::Inbox, MailboxKind::Spam];

    /// Pattern matched case-insensitively against real folder names
    pub fn pattern(self) -> &'static str {
        match self {
            Self::Inbox => "INBOX",
            Self::Spam => "SPAM|BULK",
        }
    }

    /// Whether a (decoded) folder name belongs to this kind
    pub fn matches(self, folder: &str) -> bool {
        let regex = match self {
            Self::Inbox => &*INBOX_PATTERN,
            Self::Spam => &*SPAM_PATTERN,
        };
        regex.as_ref().is_some_and(|r| r.is_match(folder))
    }
}

impl fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbox => "inbox",
            Self::Spam => "spam",
        })
    }
}

impl FromStr for MailboxKind {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(Self::Inbox),
            "spam" | "bulk" | "junk" => Ok(Self::Spam),
            other => Err(AppError::InvalidInput(format!(
                "unknown mailbox '{other}'; expected inbox or spam"
            ))),
        }
    }
}

/// Pick the real folder name for `kind`
///
/// Folder names arrive in modified UTF-7; they are decoded for matching but
/// the raw name is returned since that is what `EXAMINE` expects. The first
/// match in server order wins. With no match the pattern itself is returned
/// and the subsequent select is left to fail.
pub fn resolve_folder(folders: &[String], kind: MailboxKind) -> String {
    folders
        .iter()
        .find(|raw| kind.matches(&utf7_imap::decode_utf7_imap((*raw).clone())))
        .cloned()
        .unwrap_or_else(|| kind.pattern().to_owned())
}

/// An authenticated session with one mailbox kind's folder selected
pub struct MailboxConnection<S> {
    kind: MailboxKind,
    folder: String,
    session: S,
    status: FolderStatus,
}

impl<S: MailSession> MailboxConnection<S> {
    /// Connect, authenticate, resolve and examine the folder for `kind`
    ///
    /// A session that was opened but failed a later step is logged out
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// `Connection` naming the failed step and the cause.
    #[instrument(name = "mailbox_open", skip_all, fields(mailbox = %kind))]
    pub async fn open<C>(connector: &C, kind: MailboxKind) -> AppResult<Self>
    where
        C: Connector<Session = S>,
    {
        let mut session = connector
            .connect(kind)
            .await
            .map_err(|(step, e)| connection_error(kind, step, e))?;

        match select_folder(&mut session, kind).await {
            Ok((folder, status)) => {
                debug!(%folder, exists = status.exists, "mailbox ready");
                Ok(Self {
                    kind,
                    folder,
                    session,
                    status,
                })
            }
            Err((step, e)) => {
                if let Err(logout_err) = session.logout().await {
                    warn!(error = %logout_err, "logout after failed open also failed");
                }
                Err(connection_error(kind, step, e))
            }
        }
    }

    pub fn kind(&self) -> MailboxKind {
        self.kind
    }

    /// Real folder name this connection selects
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Folder status as of the most recent select
    pub fn status(&self) -> FolderStatus {
        self.status
    }

    /// Examine the folder again so newly arrived messages become visible
    pub async fn reselect(&mut self) -> AppResult<FolderStatus> {
        self.status = self.session.examine(&self.folder).await?;
        Ok(self.status)
    }

    /// Search the selected folder and fetch the most recent `limit` matches
    ///
    /// Fetched messages keep the server's order.
    pub async fn search_fetch(&mut self, query: &str, limit: usize) -> AppResult<Vec<RawMessage>> {
        let mut seqs = self.session.search(query).await?;
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        if seqs.len() > limit {
            debug!(
                matches = seqs.len(),
                limit, "search matched more than the fetch limit; keeping the newest"
            );
            seqs.drain(..seqs.len() - limit);
        }
        self.session.fetch(&seqs).await
    }

    /// Log the session out
    pub async fn close(mut self) -> AppResult<()> {
        self.session.logout().await
    }
}

/// List, resolve and examine; errors are tagged with their step
async fn select_folder<S: MailSession>(
    session: &mut S,
    kind: MailboxKind,
) -> Result<(String, FolderStatus), (ConnectStep, AppError)> {
    let folders = session
        .list_folders()
        .await
        .map_err(|e| (ConnectStep::List, e))?;
    let folder = resolve_folder(&folders, kind);
    let status = session
        .examine(&folder)
        .await
        .map_err(|e| (ConnectStep::Select, e))?;
    Ok((folder, status))
}

fn connection_error(mailbox: MailboxKind, step: ConnectStep, source: AppError) -> AppError {
    AppError::Connection {
        mailbox,
        step,
        source: Box::new(source),
    }
}
