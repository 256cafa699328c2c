//! Multi-mailbox retrieval
//!
//! A [`Retriever`] owns one [`MailboxConnection`] per mailbox kind. The
//! connection map is built once from the joined open results and never
//! changes afterwards, so it needs no lock. Retrieval fans out over all
//! connections concurrently and fails as a whole if any mailbox fails.

use std::collections::BTreeMap;

use futures::future;
use tracing::{debug, info, instrument, warn};

use crate::errors::{AppError, AppResult};
use crate::imap::{Connector, MailSession};
use crate::mailbox::{MailboxConnection, MailboxKind};
use crate::mime;
use crate::models::Message;
use crate::search::{self, SearchCriteria, TranslatedSearch};

/// Most recent matches fetched per mailbox per retrieval
pub const DEFAULT_FETCH_LIMIT: usize = 1000;

/// Retrieval across several mailboxes of one account
///
/// Connections stay open until [`Retriever::close`] is called; callers must
/// close on every exit path.
pub struct Retriever<S> {
    connections: BTreeMap<MailboxKind, MailboxConnection<S>>,
    fetch_limit: usize,
}

impl<S: MailSession> Retriever<S> {
    /// Open one connection per kind, concurrently
    ///
    /// Duplicate kinds are opened once. If any connection fails, the ones
    /// that did open are logged out and the first failure is returned.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `kinds` is empty
    /// - `Connection` for the first mailbox that failed to open
    #[instrument(name = "retriever_open", skip_all, fields(kinds = ?kinds))]
    pub async fn open<C>(connector: &C, kinds: &[MailboxKind]) -> AppResult<Self>
    where
        C: Connector<Session = S>,
    {
        let mut unique = kinds.to_vec();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Err(AppError::InvalidInput(
                "at least one mailbox kind is required".to_owned(),
            ));
        }

        let results = future::join_all(
            unique
                .iter()
                .map(|kind| MailboxConnection::open(connector, *kind)),
        )
        .await;

        let mut connections = BTreeMap::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => {
                    connections.insert(conn.kind(), conn);
                }
                Err(e) => {
                    warn!(error = %e, "mailbox connection failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            close_all(connections.into_values()).await;
            return Err(e);
        }

        info!(mailboxes = connections.len(), "retriever ready");
        Ok(Self {
            connections,
            fetch_limit: DEFAULT_FETCH_LIMIT,
        })
    }

    /// Cap the number of most recent matches fetched per mailbox
    pub fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit.max(1);
        self
    }

    /// Kinds this retriever holds connections for
    pub fn kinds(&self) -> impl Iterator<Item = MailboxKind> + '_ {
        self.connections.keys().copied()
    }

    /// Real folder name resolved for `kind`
    pub fn folder(&self, kind: MailboxKind) -> Option<&str> {
        self.connections.get(&kind).map(MailboxConnection::folder)
    }

    /// `UIDVALIDITY` of `kind`'s folder as of its last select
    pub fn uid_validity(&self, kind: MailboxKind) -> Option<u32> {
        self.connections
            .get(&kind)
            .and_then(|c| c.status().uid_validity)
    }

    /// Search every mailbox and merge the matches
    ///
    /// Messages from one mailbox keep the server's order; there is no
    /// ordering across mailboxes. Every mailbox runs to completion before
    /// the call returns, even when another one has already failed, so no
    /// session is left with a command half-read.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the criteria do not translate
    /// - `Retrieval` for the first failed mailbox in mailbox order; no
    ///   partial results
    #[instrument(name = "retrieve_all", skip_all)]
    pub async fn retrieve_all(&mut self, criteria: &SearchCriteria) -> AppResult<Vec<Message>> {
        let search = search::translate(criteria)?;
        let limit = self.fetch_limit;
        let results = future::join_all(
            self.connections
                .values_mut()
                .map(|conn| retrieve_from(conn, &search, limit)),
        )
        .await;
        let batches = results.into_iter().collect::<AppResult<Vec<_>>>()?;
        let messages: Vec<Message> = batches.into_iter().flatten().collect();
        debug!(matches = messages.len(), "retrieval finished");
        Ok(messages)
    }

    /// Search a single mailbox
    ///
    /// # Errors
    ///
    /// - `NotFound` if this retriever has no connection for `kind`
    /// - `InvalidInput` or `Retrieval` as for [`Retriever::retrieve_all`]
    pub async fn retrieve(
        &mut self,
        kind: MailboxKind,
        criteria: &SearchCriteria,
    ) -> AppResult<Vec<Message>> {
        let search = search::translate(criteria)?;
        let limit = self.fetch_limit;
        let conn = self
            .connections
            .get_mut(&kind)
            .ok_or_else(|| AppError::NotFound(format!("no connection for {kind} mailbox")))?;
        retrieve_from(conn, &search, limit).await
    }

    /// Log out every connection
    ///
    /// All connections are attempted even if some fail.
    ///
    /// # Errors
    ///
    /// The first logout failure.
    pub async fn close(self) -> AppResult<()> {
        match close_all(self.connections.into_values()).await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Re-select, search, fetch and normalize one mailbox
#[instrument(skip_all, fields(mailbox = %conn.kind(), folder = %conn.folder()))]
async fn retrieve_from<S: MailSession>(
    conn: &mut MailboxConnection<S>,
    search: &TranslatedSearch,
    limit: usize,
) -> AppResult<Vec<Message>> {
    let kind = conn.kind();
    let result = async {
        conn.reselect().await?;
        let raw = conn.search_fetch(&search.query, limit).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for message in &raw {
            if let Some(normalized) = mime::normalize(message, kind, &search.filter)? {
                messages.push(normalized);
            }
        }
        debug!(fetched = raw.len(), kept = messages.len(), "mailbox searched");
        Ok::<_, AppError>(messages)
    }
    .await;

    result.map_err(|e| AppError::Retrieval {
        mailbox: kind,
        source: Box::new(e),
    })
}

/// Log out connections concurrently, returning the first failure
async fn close_all<S: MailSession>(
    connections: impl Iterator<Item = MailboxConnection<S>>,
) -> Option<AppError> {
    let results = future::join_all(connections.map(|conn| async move {
        let kind = conn.kind();
        conn.close().await.map_err(|e| (kind, e))
    }))
    .await;

    let mut first_error = None;
    for (kind, e) in results.into_iter().filter_map(Result::err) {
        warn!(mailbox = %kind, error = %e, "logout failed");
        first_error.get_or_insert(e);
    }
    first_error
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use tokio::time::Instant;

    use super::Retriever;
    use crate::errors::{AppError, ConnectStep};
    use crate::mailbox::MailboxKind;
    use crate::search::SearchCriteria;
    use crate::testing::{FakeConnector, FakeSession, message_at};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn merges_matches_from_every_mailbox() {
        let inbox = FakeSession::new(&["INBOX", "[Gmail]/Spam"])
            .with_search(Ok(vec![1]))
            .with_plain_messages(1..=1);
        let spam = FakeSession::new(&["INBOX", "[Gmail]/Spam"])
            .with_search(Ok(vec![2]))
            .with_plain_messages(2..=2);
        let spam_log = spam.log();
        let connector = FakeConnector::new()
            .with_session(MailboxKind::Inbox, inbox)
            .with_session(MailboxKind::Spam, spam);

        let mut retriever = Retriever::open(&connector, &MailboxKind::ALL)
            .await
            .expect("open");
        assert_eq!(retriever.folder(MailboxKind::Spam), Some("[Gmail]/Spam"));

        let messages = retriever
            .retrieve_all(&SearchCriteria::new().from("otp@example.com"))
            .await
            .expect("retrieve");
        let mut kinds: Vec<_> = messages.iter().map(|m| m.mailbox).collect();
        kinds.sort();
        assert_eq!(kinds, vec![MailboxKind::Inbox, MailboxKind::Spam]);

        // open examines once, retrieval re-examines
        let log = spam_log.lock().expect("log");
        assert_eq!(log.examined.len(), 2);
        assert_eq!(log.queries, vec!["FROM \"otp@example.com\""]);
        drop(log);

        retriever.close().await.expect("close");
        assert!(spam_log.lock().expect("log").logged_out);
    }

    #[tokio::test]
    async fn one_failing_mailbox_fails_the_whole_call() {
        let inbox = FakeSession::new(&["INBOX"])
            .with_search(Ok(vec![1]))
            .with_plain_messages(1..=1);
        let spam = FakeSession::new(&["Spam"])
            .with_search(Err(AppError::Timeout("SEARCH timed out".to_owned())));
        let connector = FakeConnector::new()
            .with_session(MailboxKind::Inbox, inbox)
            .with_session(MailboxKind::Spam, spam);
        let mut retriever = Retriever::open(&connector, &MailboxKind::ALL)
            .await
            .expect("open");

        let err = retriever
            .retrieve_all(&SearchCriteria::new())
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            AppError::Retrieval {
                mailbox: MailboxKind::Spam,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_mailbox_waits_for_the_slow_one() {
        let inbox = FakeSession::new(&["INBOX"])
            .with_delay(Duration::from_millis(200))
            .with_search(Ok(vec![1]))
            .with_plain_messages(1..=1);
        let inbox_log = inbox.log();
        let spam = FakeSession::new(&["Spam"])
            .with_search(Err(AppError::Timeout("SEARCH timed out".to_owned())));
        let connector = FakeConnector::new()
            .with_session(MailboxKind::Inbox, inbox)
            .with_session(MailboxKind::Spam, spam);
        let mut retriever = Retriever::open(&connector, &MailboxKind::ALL)
            .await
            .expect("open");

        let err = retriever
            .retrieve_all(&SearchCriteria::new())
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            AppError::Retrieval {
                mailbox: MailboxKind::Spam,
                ..
            }
        ));

        let log = inbox_log.lock().expect("log");
        assert_eq!(log.queries, vec!["ALL"]);
        assert_eq!(log.fetched, vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn mailboxes_open_and_search_concurrently() {
        let delay = Duration::from_millis(200);
        let inbox = FakeSession::new(&["INBOX"])
            .with_delay(delay)
            .with_search(Ok(vec![1]))
            .with_plain_messages(1..=1);
        let spam = FakeSession::new(&["Spam"])
            .with_delay(delay)
            .with_search(Ok(vec![1]))
            .with_plain_messages(1..=1);
        let connector = FakeConnector::new()
            .with_session(MailboxKind::Inbox, inbox)
            .with_session(MailboxKind::Spam, spam);

        let started = Instant::now();
        let mut retriever = Retriever::open(&connector, &MailboxKind::ALL)
            .await
            .expect("open");
        assert!(started.elapsed() < delay * 2);

        let started = Instant::now();
        let messages = retriever
            .retrieve_all(&SearchCriteria::new())
            .await
            .expect("retrieve");
        assert_eq!(messages.len(), 2);
        assert!(started.elapsed() < delay * 2);
    }

    #[tokio::test]
    async fn partial_open_failure_closes_opened_connections() {
        let inbox = FakeSession::new(&["INBOX"]);
        let inbox_log = inbox.log();
        let connector = FakeConnector::new()
            .with_session(MailboxKind::Inbox, inbox)
            .with_failure(
                MailboxKind::Spam,
                ConnectStep::Connect,
                AppError::Timeout("tcp connect timeout".to_owned()),
            );

        let err = Retriever::open(&connector, &MailboxKind::ALL)
            .await
            .err()
            .expect("open must fail");
        assert!(matches!(
            err,
            AppError::Connection {
                mailbox: MailboxKind::Spam,
                step: ConnectStep::Connect,
                ..
            }
        ));
        assert!(inbox_log.lock().expect("log").logged_out);
    }

    #[tokio::test]
    async fn missing_kind_fails_instead_of_skipping() {
        let connector =
            FakeConnector::new().with_session(MailboxKind::Inbox, FakeSession::new(&["INBOX"]));
        let mut retriever = Retriever::open(&connector, &[MailboxKind::Inbox])
            .await
            .expect("open");
        let err = retriever
            .retrieve(MailboxKind::Spam, &SearchCriteria::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_kind_list_is_rejected() {
        let connector = FakeConnector::new();
        let result = Retriever::<FakeSession>::open(&connector, &[]).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn exact_bounds_hold_for_every_returned_message() {
        let since = at("2021-06-07T10:00:00Z");
        let before = at("2021-06-07T12:00:00Z");
        let inbox = FakeSession::new(&["INBOX"])
            .with_search(Ok(vec![1, 2, 3, 4]))
            .with_message(message_at(1, "Mon, 7 Jun 2021 09:59:59 +0000", "early"))
            .with_message(message_at(2, "Mon, 7 Jun 2021 10:00:00 +0000", "on floor"))
            .with_message(message_at(3, "Mon, 7 Jun 2021 11:59:59 +0000", "inside"))
            .with_message(message_at(4, "Mon, 7 Jun 2021 12:00:00 +0000", "on ceiling"));
        let connector = FakeConnector::new().with_session(MailboxKind::Inbox, inbox);
        let mut retriever = Retriever::open(&connector, &[MailboxKind::Inbox])
            .await
            .expect("open");

        let messages = retriever
            .retrieve(
                MailboxKind::Inbox,
                &SearchCriteria::new().sent_since(since).sent_before(before),
            )
            .await
            .expect("retrieve");
        let bodies: Vec<_> = messages.iter().map(|m| m.body.trim().to_owned()).collect();
        assert_eq!(bodies, vec!["on floor", "inside"]);
        assert!(
            messages
                .iter()
                .all(|m| m.date.is_some_and(|d| d >= since && d < before))
        );
    }

    #[tokio::test]
    async fn fetch_limit_applies_per_mailbox() {
        let inbox = FakeSession::new(&["INBOX"])
            .with_search(Ok((1..=10).collect()))
            .with_plain_messages(1..=10);
        let log = inbox.log();
        let connector = FakeConnector::new().with_session(MailboxKind::Inbox, inbox);
        let mut retriever = Retriever::open(&connector, &[MailboxKind::Inbox])
            .await
            .expect("open")
            .with_fetch_limit(3);

        let messages = retriever
            .retrieve_all(&SearchCriteria::new())
            .await
            .expect("retrieve");
        assert_eq!(
            messages.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        assert_eq!(log.lock().expect("log").fetched, vec![vec![8, 9, 10]]);
    }
}
