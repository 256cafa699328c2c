//! Message normalization and MIME handling
//!
//! Turns a [`RawMessage`] into a [`Message`]: envelope fields are decoded,
//! the exact date filter is applied, and the MIME tree parsed with
//! `mailparse` is walked to pick the single main text part.
//!
//! Part selection prefers HTML: the first inline `text/html` part wins and
//! is never replaced; the first inline `text/plain` part is used only when
//! no HTML part exists. Attachments never contribute.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::imap::RawMessage;
use crate::mailbox::MailboxKind;
use crate::models::{Message, MimeType};
use crate::search::LocalFilter;

/// Normalize one fetched message
///
/// Returns `Ok(None)` when the message falls outside `filter`. A missing
/// envelope gives empty date/from/subject; a message without inline text
/// gives an empty body and no main part.
///
/// # Errors
///
/// - `NotFound` if the server did not return the body section
/// - `Internal` if the message structure cannot be parsed or a text part
///   cannot be decoded
pub fn normalize(
    raw: &RawMessage,
    mailbox: MailboxKind,
    filter: &LocalFilter,
) -> AppResult<Option<Message>> {
    let envelope = raw.envelope.clone().unwrap_or_default();
    let date = envelope.date.as_deref().and_then(parse_date);
    if !filter.admits(date) {
        return Ok(None);
    }

    let source = raw.body.as_deref().ok_or_else(|| {
        AppError::NotFound(format!("body section missing for message {}", raw.seq))
    })?;
    let parsed = mailparse::parse_mail(source)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let main = select_main_part(&parsed)?;
    let mime_type = raw
        .mime_type
        .clone()
        .unwrap_or_else(|| parsed.ctype.mimetype.to_ascii_lowercase());

    Ok(Some(Message {
        date,
        from: envelope.from.into_iter().next().unwrap_or_default(),
        subject: envelope.subject.unwrap_or_default(),
        body: main.as_ref().map(|(_, body)| body.clone()).unwrap_or_default(),
        mime_type,
        main_part: main.map(|(kind, _)| kind),
        mailbox,
        seq: raw.seq,
        uid: raw.uid,
    }))
}

/// Pick the main text part of a parsed message
///
/// Returns the kind and decoded content of the winning part, or `None` if
/// the message has no inline text part.
pub fn select_main_part(parsed: &ParsedMail<'_>) -> AppResult<Option<(MimeType, String)>> {
    let mut plain = None;
    let mut html = None;
    walk_parts(parsed, &mut plain, &mut html)?;
    Ok(html
        .map(|body| (MimeType::Html, body))
        .or_else(|| plain.map(|body| (MimeType::PlainText, body))))
}

/// Walk MIME part tree recursively
///
/// Keeps the first inline text/plain and first inline text/html leaf.
fn walk_parts(
    part: &ParsedMail<'_>,
    plain: &mut Option<String>,
    html: &mut Option<String>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        if is_attachment(part) {
            return Ok(());
        }
        let slot = match MimeType::from_content_type(&part.ctype.mimetype) {
            Some(MimeType::PlainText) => plain,
            Some(MimeType::Html) => html,
            None => return Ok(()),
        };
        if slot.is_none() {
            let body = part
                .get_body()
                .map_err(|e| AppError::Internal(format!("failed decoding text part: {e}")))?;
            *slot = Some(body);
        }
        return Ok(());
    }

    for sub in &part.subparts {
        walk_parts(sub, plain, html)?;
    }
    Ok(())
}

/// Attachment if the disposition says so or the part carries a filename
fn is_attachment(part: &ParsedMail<'_>) -> bool {
    let disp = part.get_content_disposition();
    disp.disposition == DispositionType::Attachment
        || disp.params.contains_key("filename")
        || part.ctype.params.contains_key("name")
}

/// Parse an RFC 2822 date header into UTC
///
/// Strict RFC 2822 first, then `mailparse`'s lenient parser. The lenient
/// parser reports unparseable input as the epoch, which counts as unknown.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value.trim()) {
        return Some(date.with_timezone(&Utc));
    }
    let secs = mailparse::dateparse(value).ok().filter(|secs| *secs != 0)?;
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Decode RFC 2047 encoded words in a raw header value
pub fn decode_header_value(raw: &[u8]) -> String {
    let mut line = b"Subject: ".to_vec();
    line.extend_from_slice(raw);
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}
