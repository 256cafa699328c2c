//! mailpoll: command-line front end
//!
//! - `search`: one retrieval, matches printed as JSON lines
//! - `wait`: poll until a message matches, print it as JSON
//! - `send-otp`: send a random six-digit code, optionally wait for it to
//!   arrive back
//!
//! Ctrl-C stops a running poll at the next cycle boundary; connections are
//! always logged out before exit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use mailpoll::{
    AppConfig, AppError, AppResult, ImapConnector, ImapRetriever, MailboxKind, Message,
    MimeType, Poller, Retriever, SearchCriteria, Sender, SmtpSender,
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mailpoll", version, about = "Search and poll IMAP inbox and spam folders")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search once and print every match as a JSON line
    Search(Filter),
    /// Poll until a message matches and print it as JSON
    Wait {
        #[command(flatten)]
        filter: Filter,
        /// Poll budget in seconds; defaults to MAILPOLL_POLL_TIMEOUT_MS
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Send a random six-digit code to the account (or --to)
    SendOtp {
        /// Recipient; defaults to the account user
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "mailpoll OTP")]
        subject: String,
        /// Send as text/html instead of text/plain
        #[arg(long)]
        html: bool,
        /// Poll the account until the code arrives; only valid when sending
        /// to the account itself
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Args)]
struct Filter {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    /// Matches any header or the body
    #[arg(long)]
    text: Option<String>,
    /// RFC 3339 lower bound, inclusive
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// RFC 3339 upper bound, exclusive
    #[arg(long)]
    before: Option<DateTime<Utc>>,
    /// Mailboxes to search (inbox, spam); repeatable, defaults to both
    #[arg(long = "mailbox")]
    mailboxes: Vec<MailboxKind>,
}

impl Filter {
    fn criteria(&self) -> SearchCriteria {
        SearchCriteria {
            sent_since: self.since,
            sent_before: self.before,
            from: self.from.clone(),
            subject: self.subject.clone(),
            text: self.text.clone(),
        }
    }

    fn kinds(&self) -> Vec<MailboxKind> {
        if self.mailboxes.is_empty() {
            MailboxKind::ALL.to_vec()
        } else {
            self.mailboxes.clone()
        }
    }
}

/// Application entry point
///
/// Initializes tracing from environment (logs go to stderr, results to
/// stdout), loads config and runs one subcommand.
///
/// # Environment Variables
///
/// See [`AppConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from_env()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current cycle");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Search(filter) => {
            let mut retriever = open_retriever(&config, &filter.kinds()).await?;
            let outcome = retriever.retrieve_all(&filter.criteria()).await;
            finish(retriever, outcome)
                .await?
                .iter()
                .try_for_each(print_json)?;
        }
        Command::Wait {
            filter,
            timeout_secs,
        } => {
            let budget = timeout_secs.map_or(config.poll_timeout(), Duration::from_secs);
            let mut retriever = open_retriever(&config, &filter.kinds()).await?;
            let outcome = poller(&config, &cancel)
                .poll_for(&mut retriever, &filter.criteria(), budget)
                .await;
            print_json(&finish(retriever, outcome).await?)?;
        }
        Command::SendOtp {
            to,
            subject,
            html,
            wait,
            timeout_secs,
        } => {
            let to = to.unwrap_or_else(|| config.account.user.clone());
            if wait {
                check_wait_target(&config.account.user, &to)?;
            }
            let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
            let (mime_type, body) = if html {
                (MimeType::Html, format!("<p>OTP is <h1>{code}</h1></p>"))
            } else {
                (MimeType::PlainText, code.clone())
            };

            // Open first so the code cannot arrive before polling starts
            let retriever = if wait {
                Some(open_retriever(&config, &MailboxKind::ALL).await?)
            } else {
                None
            };
            let criteria = SearchCriteria::new()
                .sent_since(Utc::now() - chrono::Duration::minutes(1))
                .from(config.account.user.clone())
                .subject(subject.clone());

            let sent = match SmtpSender::new(&config.account, &config.timeouts) {
                Ok(sender) => sender.send(&to, &subject, mime_type, &body).await,
                Err(e) => Err(e),
            };
            if sent.is_ok() {
                println!("{code}");
            }

            if let Some(mut retriever) = retriever {
                let outcome = match sent {
                    Ok(()) => {
                        let budget = timeout_secs.map_or(config.poll_timeout(), Duration::from_secs);
                        poller(&config, &cancel)
                            .poll_for(&mut retriever, &criteria, budget)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let found = finish(retriever, outcome).await?;
                if !found.body.contains(&code) {
                    return Err(AppError::NotFound(format!(
                        "received message does not contain code {code}"
                    ))
                    .into());
                }
                print_json(&found)?;
            } else {
                sent?;
            }
        }
    }
    Ok(())
}

async fn open_retriever(config: &AppConfig, kinds: &[MailboxKind]) -> AppResult<ImapRetriever> {
    let connector = ImapConnector::new(config.account.clone(), config.timeouts);
    Ok(Retriever::open(&connector, kinds)
        .await?
        .with_fetch_limit(config.fetch_limit))
}

/// `--wait` polls the account's own mailbox, so it only sees mail sent to it
fn check_wait_target(user: &str, to: &str) -> AppResult<()> {
    if to.trim().eq_ignore_ascii_case(user.trim()) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "--wait polls {user}'s own mailbox and cannot see mail sent to {to}"
        )))
    }
}

fn poller(config: &AppConfig, cancel: &CancellationToken) -> Poller {
    Poller::new(config.poll_interval()).with_cancellation(cancel.clone())
}

/// Close the retriever, preferring the operation's error over a logout error
async fn finish<T>(retriever: ImapRetriever, outcome: AppResult<T>) -> AppResult<T> {
    let closed = retriever.close().await;
    let value = outcome?;
    closed?;
    Ok(value)
}

fn print_json(message: &Message) -> AppResult<()> {
    let line = serde_json::to_string(message)
        .map_err(|e| AppError::Internal(format!("failed to serialize message: {e}")))?;
    println!("{line}");
    Ok(())
}
