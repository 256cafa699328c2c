//! Polling for a matching message
//!
//! [`Poller::poll_until_match`] drives [`Retriever::retrieve_all`] on a fixed
//! interval until a message matches, the deadline passes, or the
//! cancellation token fires. Deadline and cancellation are checked only
//! between cycles: a cycle in flight always completes, so the call may
//! overrun the deadline by up to one interval plus one cycle.
//!
//! Retrieval errors are retried on the next cycle; the last one is reported
//! if the poll expires.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{AppError, AppResult};
use crate::imap::MailSession;
use crate::mailbox::MailboxKind;
use crate::models::Message;
use crate::retriever::Retriever;
use crate::search::SearchCriteria;

/// Sleep between poll cycles unless configured otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Highest UID already handed out for a folder incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeenMark {
    uid_validity: u32,
    uid: u32,
}

/// Repeated retrieval until a message matches
///
/// By default a poller remembers, per mailbox, the highest UID among the
/// matches of the cycle that returned, and skips those messages on later
/// polls, so polling twice for "the next code" does not return the same
/// message twice.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    cancel: Option<CancellationToken>,
    skip_seen: bool,
    seen: HashMap<MailboxKind, SeenMark>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cancel: None,
            skip_seen: true,
            seen: HashMap::new(),
        }
    }

    /// Stop at the next cycle boundary once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Enable or disable skipping messages returned by earlier polls
    pub fn skip_seen(mut self, enabled: bool) -> Self {
        self.skip_seen = enabled;
        self
    }

    /// Poll with a budget measured from now
    ///
    /// # Errors
    ///
    /// See [`Poller::poll_until_match`].
    pub async fn poll_for<S: MailSession>(
        &mut self,
        retriever: &mut Retriever<S>,
        criteria: &SearchCriteria,
        budget: Duration,
    ) -> AppResult<Message> {
        self.poll_until_match(retriever, criteria, Instant::now() + budget)
            .await
    }

    /// Poll until a message matches `criteria` or `deadline` passes
    ///
    /// When a cycle returns several messages, the one with the newest date
    /// wins; unknown dates count as oldest and ties go to the later message
    /// in merge order.
    ///
    /// # Errors
    ///
    /// - `DeadlineExceeded` or `Cancelled`, carrying the last retrieval
    ///   error if any cycle failed
    /// - `InvalidInput` immediately if the criteria cannot be translated
    #[instrument(name = "poll", skip_all, fields(interval_ms = self.interval.as_millis() as u64))]
    pub async fn poll_until_match<S: MailSession>(
        &mut self,
        retriever: &mut Retriever<S>,
        criteria: &SearchCriteria,
        deadline: Instant,
    ) -> AppResult<Message> {
        let mut last_error: Option<AppError> = None;
        let mut cycle: u64 = 0;
        loop {
            if cycle > 0 {
                sleep(self.interval).await;
            }
            cycle += 1;

            if self
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                info!(cycle, "poll cancelled");
                return Err(AppError::Cancelled {
                    last_error: last_error.map(Box::new),
                });
            }
            if Instant::now() >= deadline {
                info!(cycle, "poll deadline passed");
                return Err(AppError::DeadlineExceeded {
                    last_error: last_error.map(Box::new),
                });
            }

            match retriever.retrieve_all(criteria).await {
                Err(e @ AppError::InvalidInput(_)) => return Err(e),
                Err(e) => {
                    warn!(cycle, error = %e, "poll cycle failed; will retry");
                    last_error = Some(e);
                }
                Ok(messages) => {
                    let fresh = self.unseen(retriever, messages);
                    self.remember(retriever, &fresh);
                    if let Some(found) = newest(fresh) {
                        info!(cycle, mailbox = %found.mailbox, seq = found.seq, "matching message found");
                        return Ok(found);
                    }
                    debug!(cycle, "no matching message yet");
                }
            }
        }
    }

    fn unseen<S: MailSession>(&self, retriever: &Retriever<S>, messages: Vec<Message>) -> Vec<Message> {
        if !self.skip_seen {
            return messages;
        }
        messages
            .into_iter()
            .filter(|m| !self.already_seen(retriever.uid_validity(m.mailbox), m))
            .collect()
    }

    fn already_seen(&self, uid_validity: Option<u32>, message: &Message) -> bool {
        match (self.seen.get(&message.mailbox), uid_validity, message.uid) {
            (Some(mark), Some(validity), Some(uid)) => {
                mark.uid_validity == validity && uid <= mark.uid
            }
            _ => false,
        }
    }

    fn remember<S: MailSession>(&mut self, retriever: &Retriever<S>, messages: &[Message]) {
        if !self.skip_seen {
            return;
        }
        for message in messages {
            let (Some(uid_validity), Some(uid)) =
                (retriever.uid_validity(message.mailbox), message.uid)
            else {
                continue;
            };
            let mark = self.seen.entry(message.mailbox).or_insert(SeenMark {
                uid_validity,
                uid,
            });
            if mark.uid_validity != uid_validity {
                *mark = SeenMark { uid_validity, uid };
            } else {
                mark.uid = mark.uid.max(uid);
            }
        }
    }
}

/// Newest message by date; ties resolve to the later element
fn newest(messages: Vec<Message>) -> Option<Message> {
    messages.into_iter().max_by_key(|m| m.date)
}
