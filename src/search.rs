//! Search criteria and their translation to IMAP `SEARCH`
//!
//! IMAP date predicates work on whole days and ignore time-of-day, so the
//! lower bound sent to the server is widened by a day and the exact instant
//! is re-applied locally through [`LocalFilter`] once messages are fetched.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};

use crate::errors::{AppError, AppResult};

/// Caller-supplied message filter
///
/// Every field is optional; unset (or empty) fields do not constrain the
/// search. Set fields combine with logical AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Header date at or after this instant, to the second
    pub sent_since: Option<DateTime<Utc>>,
    /// Header date strictly before this instant
    pub sent_before: Option<DateTime<Utc>>,
    /// Sender address
    pub from: Option<String>,
    /// Substring of the subject
    pub subject: Option<String>,
    /// Substring of any header or the body
    pub text: Option<String>,
}

impl SearchCriteria {
    /// Criteria matching every message
    pub fn new() -> Self {
        Self::default()
    }

    /// Only messages dated at or after `at`
    pub fn sent_since(mut self, at: DateTime<Utc>) -> Self {
        self.sent_since = Some(at);
        self
    }

    /// Only messages dated strictly before `at`
    pub fn sent_before(mut self, at: DateTime<Utc>) -> Self {
        self.sent_before = Some(at);
        self
    }

    /// Only messages from `address`
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    /// Only messages whose subject contains `subject`
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Only messages with `text` in a header or the body
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Exact date bounds re-applied after fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalFilter {
    /// Inclusive lower bound
    pub floor: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub ceiling: Option<DateTime<Utc>>,
}

impl LocalFilter {
    /// Whether a message dated `date` passes
    ///
    /// An unknown date fails any set bound since it cannot be shown to
    /// satisfy it.
    pub fn admits(&self, date: Option<DateTime<Utc>>) -> bool {
        if self.floor.is_none() && self.ceiling.is_none() {
            return true;
        }
        let Some(date) = date else {
            return false;
        };
        self.floor.is_none_or(|floor| date >= floor)
            && self.ceiling.is_none_or(|ceiling| date < ceiling)
    }
}

/// Wire query plus the local filter that completes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedSearch {
    /// IMAP `SEARCH` arguments
    pub query: String,
    /// Post-fetch date filter
    pub filter: LocalFilter,
}

/// Translate criteria into an IMAP `SEARCH` query and a local filter
///
/// # Errors
///
/// `InvalidInput` if a text field is too long or carries control characters,
/// or if `sent_since` is not before `sent_before`.
pub fn translate(criteria: &SearchCriteria) -> AppResult<TranslatedSearch> {
    if let (Some(since), Some(before)) = (criteria.sent_since, criteria.sent_before)
        && since >= before
    {
        return Err(AppError::InvalidInput(
            "sent_since must be earlier than sent_before".to_owned(),
        ));
    }

    let mut parts = Vec::new();
    if let Some(since) = criteria.sent_since {
        let widened = since - ChronoDuration::days(1);
        parts.push(format!("SENTSINCE {}", imap_date(widened.date_naive())));
    }
    if let Some(before) = criteria.sent_before {
        parts.push(format!("SENTBEFORE {}", imap_date(before.date_naive())));
    }
    if let Some(v) = non_empty(&criteria.from) {
        parts.push(format!("FROM \"{}\"", escape_imap_quoted(v)?));
    }
    if let Some(v) = non_empty(&criteria.subject) {
        parts.push(format!("SUBJECT \"{}\"", escape_imap_quoted(v)?));
    }
    if let Some(v) = non_empty(&criteria.text) {
        parts.push(format!("TEXT \"{}\"", escape_imap_quoted(v)?));
    }

    let query = if parts.is_empty() {
        "ALL".to_owned()
    } else {
        parts.join(" ")
    };
    Ok(TranslatedSearch {
        query,
        filter: LocalFilter {
            floor: criteria.sent_since,
            ceiling: criteria.sent_before,
        },
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Validate search text field bounds and characters
fn validate_search_text(input: &str) -> AppResult<()> {
    if input.len() > 256 {
        return Err(AppError::InvalidInput(
            "search text fields must be at most 256 chars".to_owned(),
        ));
    }
    if input.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(
            "search text must not contain control characters".to_owned(),
        ));
    }
    Ok(())
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> AppResult<String> {
    validate_search_text(input)?;
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Format date as IMAP SEARCH date (e.g., "1-Jan-2025")
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::{LocalFilter, SearchCriteria, translate};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_criteria_searches_all() {
        let translated = translate(&SearchCriteria::new()).expect("translate");
        assert_eq!(translated.query, "ALL");
        assert_eq!(translated.filter, LocalFilter::default());
    }

    #[test]
    fn widens_since_by_a_day_and_keeps_exact_floor() {
        let since = at("2021-05-11T13:16:00+07:00");
        let translated = translate(&SearchCriteria::new().sent_since(since)).expect("translate");
        assert_eq!(translated.query, "SENTSINCE 10-May-2021");
        assert_eq!(translated.filter.floor, Some(since));
    }

    #[test]
    fn passes_before_through_without_widening() {
        let before = at("2021-06-08T12:00:00Z");
        let translated =
            translate(&SearchCriteria::new().sent_before(before)).expect("translate");
        assert_eq!(translated.query, "SENTBEFORE 8-Jun-2021");
        assert_eq!(translated.filter.ceiling, Some(before));
    }

    #[test]
    fn combines_all_fields_with_and() {
        let criteria = SearchCriteria::new()
            .sent_since(at("2021-06-07T00:00:00Z"))
            .sent_before(at("2021-06-08T00:00:00Z"))
            .from("noreply@zohoaccounts.com")
            .subject("Welcome \"new\" user")
            .text("code");
        let translated = translate(&criteria).expect("translate");
        assert_eq!(
            translated.query,
            "SENTSINCE 6-Jun-2021 SENTBEFORE 8-Jun-2021 FROM \"noreply@zohoaccounts.com\" \
             SUBJECT \"Welcome \\\"new\\\" user\" TEXT \"code\""
        );
    }

    #[test]
    fn empty_strings_do_not_constrain() {
        let criteria = SearchCriteria::new().from("").subject("");
        assert_eq!(translate(&criteria).expect("translate").query, "ALL");
    }

    #[test]
    fn rejects_control_characters() {
        let err = translate(&SearchCriteria::new().subject("a\r\nb")).expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn rejects_inverted_window() {
        let t = at("2021-06-08T00:00:00Z");
        let err = translate(&SearchCriteria::new().sent_since(t).sent_before(t))
            .expect_err("must fail");
        assert!(err.to_string().contains("sent_since"));
    }

    #[test]
    fn local_filter_uses_time_of_day() {
        let floor = at("2021-05-11T13:16:00+07:00");
        let filter = LocalFilter {
            floor: Some(floor),
            ceiling: None,
        };
        assert!(filter.admits(Some(floor)));
        assert!(!filter.admits(Some(floor - Duration::minutes(1))));
        assert!(!filter.admits(None));
    }

    #[test]
    fn local_filter_ceiling_is_exclusive() {
        let ceiling = at("2021-06-08T00:00:00Z");
        let filter = LocalFilter {
            floor: None,
            ceiling: Some(ceiling),
        };
        assert!(filter.admits(Some(ceiling - Duration::seconds(1))));
        assert!(!filter.admits(Some(ceiling)));
        assert!(LocalFilter::default().admits(None));
    }
}
