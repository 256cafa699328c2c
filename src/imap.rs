//! IMAP transport and session operations
//!
//! Defines the [`MailSession`] and [`Connector`] seams the retrieval engine
//! talks to, and their production implementation over `async-imap`. Every
//! network call is TLS-only and bounded by a timeout taken from
//! [`Timeouts`].

use std::sync::Arc;
use std::time::Duration;

use async_imap::imap_proto::{BodyStructure, Envelope};
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{AccountConfig, Timeouts};
use crate::errors::{AppError, AppResult, ConnectStep};
use crate::mailbox::MailboxKind;
use crate::mime;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Items fetched for every matched message; `BODY.PEEK` leaves `\Seen` alone
const FETCH_ITEMS: &str = "(UID ENVELOPE BODYSTRUCTURE BODY.PEEK[])";

/// State of a folder right after `EXAMINE`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatus {
    /// Number of messages in the folder
    pub exists: u32,
    /// Folder `UIDVALIDITY`, if the server reported one
    pub uid_validity: Option<u32>,
}

/// Envelope fields as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEnvelope {
    /// Raw `Date` header value
    pub date: Option<String>,
    /// Sender addresses in envelope order (`mailbox@host`)
    pub from: Vec<String>,
    /// Decoded subject
    pub subject: Option<String>,
}

/// One message as fetched from the wire, before normalization
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Message sequence number
    pub seq: u32,
    /// Message UID
    pub uid: Option<u32>,
    /// Envelope, absent if the server did not send one
    pub envelope: Option<RawEnvelope>,
    /// Top-level content type from `BODYSTRUCTURE` (e.g. `multipart/alternative`)
    pub mime_type: Option<String>,
    /// Full RFC822 source, absent if the body section was not returned
    pub body: Option<Vec<u8>>,
}

/// Authenticated session bound to an account
///
/// A session is driven by exactly one caller at a time, hence `&mut self`.
#[async_trait]
pub trait MailSession: Send {
    /// List every visible folder name, in server order
    async fn list_folders(&mut self) -> AppResult<Vec<String>>;
    /// Select a folder read-only
    async fn examine(&mut self, folder: &str) -> AppResult<FolderStatus>;
    /// Run `SEARCH` in the selected folder and return ascending sequence numbers
    async fn search(&mut self, query: &str) -> AppResult<Vec<u32>>;
    /// Fetch envelope, structure and body for the given sequence numbers
    async fn fetch(&mut self, seqs: &[u32]) -> AppResult<Vec<RawMessage>>;
    /// End the session
    async fn logout(&mut self) -> AppResult<()>;
}

/// Opens authenticated sessions
///
/// A failure reports which step (connect or authenticate) went wrong.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector
    type Session: MailSession;

    /// Open and authenticate a session meant for `kind`
    async fn connect(
        &self,
        kind: MailboxKind,
    ) -> Result<Self::Session, (ConnectStep, AppError)>;
}

/// Production connector: TCP, rustls, IMAP greeting and LOGIN
#[derive(Debug, Clone)]
pub struct ImapConnector {
    account: AccountConfig,
    timeouts: Timeouts,
}

impl ImapConnector {
    /// Create a connector for one account
    pub fn new(account: AccountConfig, timeouts: Timeouts) -> Self {
        Self { account, timeouts }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    type Session = TlsSession;

    async fn connect(&self, kind: MailboxKind) -> Result<TlsSession, (ConnectStep, AppError)> {
        debug!(mailbox = %kind, host = %self.account.imap.host, "opening IMAP session");
        let client = open_client(&self.account, &self.timeouts)
            .await
            .map_err(|e| (ConnectStep::Connect, e))?;
        let session = login(client, &self.account, &self.timeouts)
            .await
            .map_err(|e| (ConnectStep::Authenticate, e))?;
        Ok(TlsSession {
            session,
            socket_timeout: self.timeouts.socket(),
        })
    }
}

/// Connect to the IMAP server and read its greeting
///
/// Performs the connection sequence with timeouts:
/// 1. TCP connect (`connect_timeout_ms`)
/// 2. TLS handshake with webpki roots (`greeting_timeout_ms`)
/// 3. IMAP greeting read (`greeting_timeout_ms`)
///
/// # Errors
///
/// - `InvalidInput` if the hostname is invalid for TLS SNI
/// - `Timeout` if any phase times out
/// - `Internal` for TCP, TLS, or greeting failures
async fn open_client(
    account: &AccountConfig,
    timeouts: &Timeouts,
) -> AppResult<Client<tokio_rustls::client::TlsStream<TcpStream>>> {
    let greeting_duration = timeouts.greeting();
    let host = account.imap.host.as_str();

    let tcp = timeout(
        timeouts.connect(),
        TcpStream::connect((host, account.imap.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Internal(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }
    Ok(client)
}

/// Authenticate with LOGIN
async fn login(
    client: Client<tokio_rustls::client::TlsStream<TcpStream>>,
    account: &AccountConfig,
    timeouts: &Timeouts,
) -> AppResult<ImapSession> {
    let pass = account.pass.expose_secret();
    timeout(timeouts.greeting(), client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Internal(msg)
                }
            })
        })
}

/// `async-imap` session over rustls
pub struct TlsSession {
    session: ImapSession,
    socket_timeout: Duration,
}

#[async_trait]
impl MailSession for TlsSession {
    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let stream = timeout(self.socket_timeout, self.session.list(None, Some("*")))
            .await
            .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LIST failed: {e}"))))?;

        let names: Vec<async_imap::types::Name> =
            timeout(self.socket_timeout, stream.try_collect())
                .await
                .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Internal(format!("LIST stream failed: {e}")))
                })?;
        Ok(names.iter().map(|n| n.name().to_owned()).collect())
    }

    /// Uses `EXAMINE` so polling never marks messages as read.
    async fn examine(&mut self, folder: &str) -> AppResult<FolderStatus> {
        let selected = timeout(self.socket_timeout, self.session.examine(folder))
            .await
            .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::NotFound(format!("cannot examine folder '{folder}': {e}")))
            })?;
        Ok(FolderStatus {
            exists: selected.exists,
            uid_validity: selected.uid_validity,
        })
    }

    async fn search(&mut self, query: &str) -> AppResult<Vec<u32>> {
        let set = timeout(self.socket_timeout, self.session.search(query))
            .await
            .map_err(|_| AppError::Timeout("SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("search failed: {e}"))))?;
        let mut seqs: Vec<u32> = set.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn fetch(&mut self, seqs: &[u32]) -> AppResult<Vec<RawMessage>> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        let set = sequence_set(seqs);
        let stream = timeout(self.socket_timeout, self.session.fetch(set, FETCH_ITEMS))
            .await
            .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("fetch failed: {e}"))))?;
        let fetches: Vec<Fetch> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("FETCH stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("fetch stream failed: {e}"))))?;
        Ok(fetches.iter().map(raw_message).collect())
    }

    async fn logout(&mut self) -> AppResult<()> {
        timeout(self.socket_timeout, self.session.logout())
            .await
            .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LOGOUT failed: {e}"))))
    }
}

/// Render sequence numbers as an IMAP sequence set (`1,5,9`)
fn sequence_set(seqs: &[u32]) -> String {
    seqs.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn raw_message(fetch: &Fetch) -> RawMessage {
    RawMessage {
        seq: fetch.message,
        uid: fetch.uid,
        envelope: fetch.envelope().map(raw_envelope),
        mime_type: fetch.bodystructure().map(structure_mime_type),
        body: fetch.body().map(<[u8]>::to_vec),
    }
}

fn raw_envelope(envelope: &Envelope<'_>) -> RawEnvelope {
    let from = envelope
        .from
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|addr| {
            let mailbox = addr.mailbox.as_ref().map(|m| String::from_utf8_lossy(m))?;
            Some(match addr.host.as_ref() {
                Some(host) => format!("{mailbox}@{}", String::from_utf8_lossy(host)),
                None => mailbox.into_owned(),
            })
        })
        .collect();

    RawEnvelope {
        date: envelope
            .date
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned()),
        from,
        subject: envelope
            .subject
            .as_ref()
            .map(|s| mime::decode_header_value(s)),
    }
}

fn structure_mime_type(structure: &BodyStructure<'_>) -> String {
    let common = match structure {
        BodyStructure::Basic { common, .. }
        | BodyStructure::Text { common, .. }
        | BodyStructure::Message { common, .. }
        | BodyStructure::Multipart { common, .. } => common,
    };
    format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::sequence_set;

    #[test]
    fn sequence_set_joins_with_commas() {
        assert_eq!(sequence_set(&[3]), "3");
        assert_eq!(sequence_set(&[1, 5, 9]), "1,5,9");
    }
}
