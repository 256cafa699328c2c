//! Outgoing mail
//!
//! [`Sender`] is the seam callers use to send the message whose reply they
//! then poll for. [`SmtpSender`] is the production implementation over
//! `lettre`'s async SMTP transport.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;
use tokio::time::timeout;
use tracing::{info, instrument};

use crate::config::{AccountConfig, Timeouts};
use crate::errors::{AppError, AppResult};
use crate::models::MimeType;

/// Port on which SMTP servers expect TLS from the first byte
const IMPLICIT_TLS_PORT: u16 = 465;

/// Sends a single-part text message
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send `body` to `to`, labelled with `mime_type`
    async fn send(&self, to: &str, subject: &str, mime_type: MimeType, body: &str)
    -> AppResult<()>;
}

/// Authenticated SMTP submission for the configured account
pub struct SmtpSender {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    send_timeout: Duration,
}

impl SmtpSender {
    /// Build a sender for `account`, sending as the account user
    ///
    /// Port 465 uses implicit TLS; any other port upgrades with STARTTLS.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the account has no SMTP server or the user is not a
    /// valid address.
    pub fn new(account: &AccountConfig, timeouts: &Timeouts) -> AppResult<Self> {
        let smtp = account.smtp.as_ref().ok_or_else(|| {
            AppError::InvalidInput("no SMTP server configured for this account".to_owned())
        })?;
        let from: Mailbox = account.user.parse().map_err(|e| {
            AppError::InvalidInput(format!("invalid sender address '{}': {e}", account.user))
        })?;

        let builder = if smtp.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        }
        .map_err(|e| AppError::InvalidInput(format!("invalid SMTP relay {smtp}: {e}")))?;

        let credentials = Credentials::new(
            account.user.clone(),
            account.pass.expose_secret().to_owned(),
        );
        let transport = builder
            .port(smtp.port)
            .credentials(credentials)
            .timeout(Some(timeouts.connect()))
            .build();

        Ok(Self {
            from,
            transport,
            send_timeout: timeouts.socket(),
        })
    }
}

#[async_trait]
impl Sender for SmtpSender {
    #[instrument(skip(self, body), fields(mime_type = %mime_type))]
    async fn send(
        &self,
        to: &str,
        subject: &str,
        mime_type: MimeType,
        body: &str,
    ) -> AppResult<()> {
        let email = build_email(&self.from, to, subject, mime_type, body)?;
        timeout(self.send_timeout, self.transport.send(email))
            .await
            .map_err(|_| AppError::Timeout("SMTP send timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Send(e.to_string())))?;
        info!("message submitted");
        Ok(())
    }
}

/// Assemble a single-part message with the matching content type
pub fn build_email(
    from: &Mailbox,
    to: &str,
    subject: &str,
    mime_type: MimeType,
    body: &str,
) -> AppResult<lettre::Message> {
    let to: Mailbox = to
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("invalid recipient '{to}': {e}")))?;
    let content_type = match mime_type {
        MimeType::PlainText => ContentType::TEXT_PLAIN,
        MimeType::Html => ContentType::TEXT_HTML,
    };
    lettre::Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject)
        .header(content_type)
        .body(body.to_owned())
        .map_err(|e| AppError::Send(format!("failed to build message: {e}")))
}
