//! In-memory IMAP and SMTP stand-ins for unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{AppError, AppResult, ConnectStep};
use crate::imap::{Connector, FolderStatus, MailSession, RawEnvelope, RawMessage};
use crate::mailbox::MailboxKind;
use crate::models::MimeType;
use crate::sender::Sender;

/// Messages held by one fake folder, keyed by sequence number
pub type MailStore = Arc<Mutex<BTreeMap<u32, RawMessage>>>;

/// Commands a [`FakeSession`] has seen
#[derive(Debug, Default)]
pub struct SessionLog {
    pub examined: Vec<String>,
    pub queries: Vec<String>,
    pub fetched: Vec<Vec<u32>>,
    pub logged_out: bool,
}

/// Scripted session over a single in-memory folder
///
/// Searches answer from the script first; once it runs out every stored
/// message matches. An optional delay makes `LIST` and `SEARCH` take that
/// long, and a search is only logged once the delay has passed.
pub struct FakeSession {
    folders: Vec<String>,
    delay: Option<Duration>,
    failing_examine: bool,
    searches: VecDeque<AppResult<Vec<u32>>>,
    store: MailStore,
    log: Arc<Mutex<SessionLog>>,
}

impl FakeSession {
    pub fn new(folders: &[&str]) -> Self {
        Self {
            folders: folders.iter().map(|f| (*f).to_owned()).collect(),
            delay: None,
            failing_examine: false,
            searches: VecDeque::new(),
            store: MailStore::default(),
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<SessionLog>> {
        Arc::clone(&self.log)
    }

    pub fn store(&self) -> MailStore {
        Arc::clone(&self.store)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn wait(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn failing_examine(mut self) -> Self {
        self.failing_examine = true;
        self
    }

    pub fn with_search(mut self, result: AppResult<Vec<u32>>) -> Self {
        self.searches.push_back(result);
        self
    }

    pub fn with_message(self, message: RawMessage) -> Self {
        self.store
            .lock()
            .expect("store")
            .insert(message.seq, message);
        self
    }

    pub fn with_plain_messages(self, seqs: impl IntoIterator<Item = u32>) -> Self {
        seqs.into_iter().fold(self, |session, seq| {
            session.with_message(message_at(
                seq,
                "Mon, 7 Jun 2021 12:00:00 +0000",
                &format!("message {seq}"),
            ))
        })
    }
}

#[async_trait]
impl MailSession for FakeSession {
    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        self.wait().await;
        Ok(self.folders.clone())
    }

    async fn examine(&mut self, folder: &str) -> AppResult<FolderStatus> {
        self.log.lock().expect("log").examined.push(folder.to_owned());
        if self.failing_examine {
            return Err(AppError::NotFound(format!("no such folder: {folder}")));
        }
        let exists = self.store.lock().expect("store").len() as u32;
        Ok(FolderStatus {
            exists,
            uid_validity: Some(1),
        })
    }

    async fn search(&mut self, query: &str) -> AppResult<Vec<u32>> {
        self.wait().await;
        self.log.lock().expect("log").queries.push(query.to_owned());
        match self.searches.pop_front() {
            Some(result) => result,
            None => Ok(self.store.lock().expect("store").keys().copied().collect()),
        }
    }

    async fn fetch(&mut self, seqs: &[u32]) -> AppResult<Vec<RawMessage>> {
        self.log.lock().expect("log").fetched.push(seqs.to_vec());
        let store = self.store.lock().expect("store");
        Ok(seqs.iter().filter_map(|seq| store.get(seq).cloned()).collect())
    }

    async fn logout(&mut self) -> AppResult<()> {
        self.log.lock().expect("log").logged_out = true;
        Ok(())
    }
}

/// Hands out prepared sessions or failures, one per mailbox kind
#[derive(Default)]
pub struct FakeConnector {
    outcomes: Mutex<HashMap<MailboxKind, Result<FakeSession, (ConnectStep, AppError)>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, kind: MailboxKind, session: FakeSession) -> Self {
        self.outcomes.lock().expect("outcomes").insert(kind, Ok(session));
        self
    }

    pub fn with_failure(self, kind: MailboxKind, step: ConnectStep, error: AppError) -> Self {
        self.outcomes
            .lock()
            .expect("outcomes")
            .insert(kind, Err((step, error)));
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, kind: MailboxKind) -> Result<FakeSession, (ConnectStep, AppError)> {
        self.outcomes
            .lock()
            .expect("outcomes")
            .remove(&kind)
            .unwrap_or_else(|| {
                Err((
                    ConnectStep::Connect,
                    AppError::Internal(format!("no fake session for {kind}")),
                ))
            })
    }
}

/// Delivers into a [`FakeSession`] store as if the server received the mail
pub struct FakeSender {
    from: String,
    store: MailStore,
}

impl FakeSender {
    pub fn new(from: &str, store: MailStore) -> Self {
        Self {
            from: from.to_owned(),
            store,
        }
    }
}

#[async_trait]
impl Sender for FakeSender {
    async fn send(&self, to: &str, subject: &str, mime_type: MimeType, body: &str) -> AppResult<()> {
        let date = Utc::now().to_rfc2822();
        let source = format!(
            "Date: {date}\r\nFrom: {}\r\nTo: {to}\r\nSubject: {subject}\r\n\
             Content-Type: {mime_type}; charset=utf-8\r\n\r\n{body}\r\n",
            self.from
        );
        let mut store = self.store.lock().expect("store");
        let seq = store.len() as u32 + 1;
        store.insert(
            seq,
            RawMessage {
                seq,
                uid: Some(seq),
                envelope: Some(RawEnvelope {
                    date: Some(date),
                    from: vec![self.from.clone()],
                    subject: Some(subject.to_owned()),
                }),
                mime_type: Some(mime_type.as_str().to_owned()),
                body: Some(source.into_bytes()),
            },
        );
        Ok(())
    }
}

/// Single-part plain text message with `uid == seq`
pub fn message_at(seq: u32, date: &str, body: &str) -> RawMessage {
    let source = format!(
        "Date: {date}\r\nFrom: otp@example.com\r\nSubject: code\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    );
    RawMessage {
        seq,
        uid: Some(seq),
        envelope: Some(RawEnvelope {
            date: Some(date.to_owned()),
            from: vec!["otp@example.com".to_owned()],
            subject: Some("code".to_owned()),
        }),
        mime_type: Some("text/plain".to_owned()),
        body: Some(source.into_bytes()),
    }
}
