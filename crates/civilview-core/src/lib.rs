//! Core domain model for Civil View foreclosure-sale tracking.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "civilview-core";

/// Collapses runs of whitespace and trims; blank input becomes `None`.
pub fn normalize_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%m/%d/%y", "%m-%d-%Y"];

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
}

/// Canonical form of a sales date: `YYYY-MM-DD` when the portal text is a
/// recognizable date (a trailing time is dropped), otherwise the
/// whitespace-normalized text as-is.
pub fn canonical_date(raw: &str) -> Option<String> {
    let text = normalize_text(raw)?;
    let parsed = parse_date_token(&text).or_else(|| {
        text.split_whitespace()
            .next()
            .and_then(parse_date_token)
    });
    match parsed {
        Some(date) => Some(date.format("%Y-%m-%d").to_string()),
        None => Some(text),
    }
}

/// Stable per-property key: the portal's sheriff number, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyIdentifier(String);

impl PropertyIdentifier {
    pub fn parse(raw: &str) -> Option<Self> {
        normalize_text(raw).map(|s| Self(s.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe name for this identifier. The hash suffix keeps two
    /// identifiers that sanitize to the same slug apart.
    pub fn file_stem(&self) -> String {
        let slug = self
            .0
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let digest = Sha256::digest(self.0.as_bytes());
        let short = hex::encode(&digest[..6]);
        if slug.is_empty() {
            short
        } else {
            format!("{slug}-{short}")
        }
    }
}

impl fmt::Display for PropertyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyParseError {
    #[error("empty amount")]
    Empty,
    #[error("malformed amount {0:?}")]
    Malformed(String),
}

/// A currency amount held as integer cents so equality is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Money {
    cents: i64,
}

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> i64 {
        self.cents
    }

    pub fn as_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    /// Parses portal currency text such as `"$123,456.00"`.
    pub fn parse(text: &str) -> Result<Self, MoneyParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let malformed = || MoneyParseError::Malformed(trimmed.to_string());

        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };
        let rest = rest.strip_prefix('$').unwrap_or(rest).trim_start();
        let digits = rest.replace(',', "");

        let (whole, frac) = match digits.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (digits.as_str(), ""),
        };
        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || frac.len() > 2
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        let whole: i64 = whole.parse().map_err(|_| malformed())?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| malformed())? * 10,
            _ => frac.parse().map_err(|_| malformed())?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(malformed)?;
        Ok(Self::from_cents(if negative { -cents } else { cents }))
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Self::from_cents((value * 100.0).round() as i64)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Minimal listing reference produced from one row of the sales index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingStub {
    pub identifier: PropertyIdentifier,
    pub property_id: String,
    pub detail_url: String,
    pub sales_date: Option<String>,
    pub address: Option<String>,
    pub plaintiff: Option<String>,
    pub defendant: Option<String>,
    pub page: u32,
}

/// The fields compared during reconciliation. The sheriff number is the key
/// and status history is derived, so neither appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    CaseNumber,
    Address,
    SalesDate,
    Plaintiff,
    Defendant,
    Attorney,
    AttorneyPhone,
    JudgmentAmount,
    GoodFaithUpset,
    Description,
}

impl FieldName {
    pub const COMPARABLE: [FieldName; 10] = [
        FieldName::CaseNumber,
        FieldName::Address,
        FieldName::SalesDate,
        FieldName::Plaintiff,
        FieldName::Defendant,
        FieldName::Attorney,
        FieldName::AttorneyPhone,
        FieldName::JudgmentAmount,
        FieldName::GoodFaithUpset,
        FieldName::Description,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::CaseNumber => "case_number",
            FieldName::Address => "address",
            FieldName::SalesDate => "sales_date",
            FieldName::Plaintiff => "plaintiff",
            FieldName::Defendant => "defendant",
            FieldName::Attorney => "attorney",
            FieldName::AttorneyPhone => "attorney_phone",
            FieldName::JudgmentAmount => "judgment_amount",
            FieldName::GoodFaithUpset => "good_faith_upset",
            FieldName::Description => "description",
        }
    }

    /// Column name in the record-storage table.
    pub fn column(&self) -> &'static str {
        match self {
            FieldName::CaseNumber => "Case Number",
            FieldName::Address => "Address",
            FieldName::SalesDate => "Sales Date",
            FieldName::Plaintiff => "Plaintiff",
            FieldName::Defendant => "Defendant",
            FieldName::Attorney => "Attorney",
            FieldName::AttorneyPhone => "Attorney Phone",
            FieldName::JudgmentAmount => "Judgment Amount",
            FieldName::GoodFaithUpset => "Good Faith Upset",
            FieldName::Description => "Description",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const SHERIFF_NUMBER_COLUMN: &str = "Sheriff Number";
pub const STATUS_HISTORY_COLUMN: &str = "Status History";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(Option<String>),
    Money(Option<Money>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.is_none(),
            FieldValue::Money(v) => v.is_none(),
        }
    }

    pub fn display(&self) -> Option<String> {
        match self {
            FieldValue::Text(v) => v.clone(),
            FieldValue::Money(v) => v.map(|m| m.to_string()),
        }
    }
}

/// The full structured entity for one foreclosure listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub sheriff_number: PropertyIdentifier,
    pub case_number: Option<String>,
    pub address: Option<String>,
    pub sales_date: Option<String>,
    pub plaintiff: Option<String>,
    pub defendant: Option<String>,
    pub attorney: Option<String>,
    pub attorney_phone: Option<String>,
    pub judgment_amount: Option<Money>,
    pub good_faith_upset: Option<Money>,
    pub description: Option<String>,
    #[serde(default)]
    pub status_history: StatusHistory,
}

impl PropertyRecord {
    pub fn new(sheriff_number: PropertyIdentifier) -> Self {
        Self {
            sheriff_number,
            case_number: None,
            address: None,
            sales_date: None,
            plaintiff: None,
            defendant: None,
            attorney: None,
            attorney_phone: None,
            judgment_amount: None,
            good_faith_upset: None,
            description: None,
            status_history: StatusHistory::default(),
        }
    }

    pub fn identifier(&self) -> &PropertyIdentifier {
        &self.sheriff_number
    }

    pub fn field(&self, name: FieldName) -> FieldValue {
        match name {
            FieldName::CaseNumber => FieldValue::Text(self.case_number.clone()),
            FieldName::Address => FieldValue::Text(self.address.clone()),
            FieldName::SalesDate => FieldValue::Text(self.sales_date.clone()),
            FieldName::Plaintiff => FieldValue::Text(self.plaintiff.clone()),
            FieldName::Defendant => FieldValue::Text(self.defendant.clone()),
            FieldName::Attorney => FieldValue::Text(self.attorney.clone()),
            FieldName::AttorneyPhone => FieldValue::Text(self.attorney_phone.clone()),
            FieldName::JudgmentAmount => FieldValue::Money(self.judgment_amount),
            FieldName::GoodFaithUpset => FieldValue::Money(self.good_faith_upset),
            FieldName::Description => FieldValue::Text(self.description.clone()),
        }
    }

    /// Overwrites one field with the value `source` holds for it.
    pub fn copy_field_from(&mut self, name: FieldName, source: &PropertyRecord) {
        match name {
            FieldName::CaseNumber => self.case_number = source.case_number.clone(),
            FieldName::Address => self.address = source.address.clone(),
            FieldName::SalesDate => self.sales_date = source.sales_date.clone(),
            FieldName::Plaintiff => self.plaintiff = source.plaintiff.clone(),
            FieldName::Defendant => self.defendant = source.defendant.clone(),
            FieldName::Attorney => self.attorney = source.attorney.clone(),
            FieldName::AttorneyPhone => self.attorney_phone = source.attorney_phone.clone(),
            FieldName::JudgmentAmount => self.judgment_amount = source.judgment_amount,
            FieldName::GoodFaithUpset => self.good_faith_upset = source.good_faith_upset,
            FieldName::Description => self.description = source.description.clone(),
        }
    }

    /// Applies the comparison normal form to every text field. Idempotent.
    pub fn normalized(mut self) -> Self {
        fn norm(value: &mut Option<String>) {
            *value = value.as_deref().and_then(normalize_text);
        }
        norm(&mut self.case_number);
        norm(&mut self.address);
        norm(&mut self.plaintiff);
        norm(&mut self.defendant);
        norm(&mut self.attorney);
        norm(&mut self.attorney_phone);
        norm(&mut self.description);
        self.sales_date = self.sales_date.as_deref().and_then(canonical_date);
        self
    }
}

/// The most recent row of the portal's own status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalStatus {
    pub status: String,
    pub date: Option<String>,
}

impl fmt::Display for PortalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.date {
            Some(date) => write!(f, "{} ({})", self.status, date),
            None => f.write_str(&self.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: FieldName,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub observed_at: DateTime<Utc>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_status: Option<String>,
}

impl HistoryEntry {
    pub fn first_observed(
        observed_at: DateTime<Utc>,
        sales_date: Option<&str>,
        portal_status: Option<&PortalStatus>,
    ) -> Self {
        Self {
            observed_at,
            event: format!(
                "First observed, sales date = {}",
                sales_date.unwrap_or("unknown")
            ),
            changes: Vec::new(),
            portal_status: portal_status.map(ToString::to_string),
        }
    }

    pub fn changed(
        observed_at: DateTime<Utc>,
        changes: Vec<FieldChange>,
        portal_status: Option<&PortalStatus>,
    ) -> Self {
        Self {
            observed_at,
            event: summarize_changes(&changes),
            changes,
            portal_status: portal_status.map(ToString::to_string),
        }
    }
}

fn summarize_changes(changes: &[FieldChange]) -> String {
    let others = changes
        .iter()
        .filter(|c| c.field != FieldName::SalesDate)
        .map(|c| c.field.as_str())
        .collect::<Vec<_>>();

    let date_move = changes
        .iter()
        .find(|c| c.field == FieldName::SalesDate)
        .and_then(|c| {
            let old = NaiveDate::parse_from_str(c.old.as_deref()?, "%Y-%m-%d").ok()?;
            let new = NaiveDate::parse_from_str(c.new.as_deref()?, "%Y-%m-%d").ok()?;
            let verb = if new > old {
                "Sales date postponed"
            } else {
                "Sales date moved earlier"
            };
            Some(format!("{verb} from {old} to {new}"))
        });

    match date_move {
        Some(summary) if others.is_empty() => summary,
        Some(summary) => format!("{summary}; also updated: {}", others.join(", ")),
        None => format!(
            "Updated: {}",
            changes
                .iter()
                .map(|c| c.field.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("rendering status history entry: {0}")]
    Render(#[source] serde_yaml::Error),
    #[error("reading status history: {0}")]
    Read(#[source] serde_yaml::Error),
}

/// Append-only status log, stored as a YAML sequence in one text column.
///
/// Appending renders only the new entry and concatenates it after the
/// existing text, so earlier entries are never re-serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHistory(String);

impl StatusHistory {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn append(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let rendered =
            serde_yaml::to_string(std::slice::from_ref(entry)).map_err(HistoryError::Render)?;
        if !self.0.is_empty() && !self.0.ends_with('\n') {
            self.0.push('\n');
        }
        self.0.push_str(&rendered);
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&self.0).map_err(HistoryError::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn currency_parses_to_cents() {
        assert_eq!(Money::parse("$1,234.50").unwrap().as_f64(), 1234.50);
        assert_eq!(Money::parse("$123,456.00").unwrap().cents(), 12_345_600);
        assert_eq!(Money::parse(" $ 75 ").unwrap().cents(), 7_500);
        assert_eq!(Money::parse("$9.5").unwrap().cents(), 950);
        assert_eq!(Money::parse("-$10.00").unwrap().cents(), -1_000);
    }

    #[test]
    fn malformed_currency_is_an_error_not_a_panic() {
        assert_eq!(Money::parse(""), Err(MoneyParseError::Empty));
        assert_eq!(Money::parse("   "), Err(MoneyParseError::Empty));
        assert!(matches!(Money::parse("N/A"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(Money::parse("$1.234"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(Money::parse("$"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(
            Money::parse("$99999999999999999999"),
            Err(MoneyParseError::Malformed(_))
        ));
    }

    #[test]
    fn money_display_and_float_round_trip_are_exact_to_the_cent() {
        let m = Money::from(1234.5);
        assert_eq!(m.cents(), 123_450);
        assert_eq!(m.to_string(), "1234.50");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
    }

    #[test]
    fn identifiers_normalize_and_produce_distinct_file_stems() {
        let a = PropertyIdentifier::parse("  f-2300  123 ").unwrap();
        assert_eq!(a.as_str(), "F-2300 123");
        let b = PropertyIdentifier::parse("F/2300/123").unwrap();
        assert!(a.file_stem().starts_with("f-2300-123-"));
        assert!(b.file_stem().starts_with("f-2300-123-"));
        assert_ne!(a.file_stem(), b.file_stem());
        assert!(PropertyIdentifier::parse("   ").is_none());
    }

    #[test]
    fn sales_dates_are_canonicalized() {
        assert_eq!(canonical_date("10/23/2025").as_deref(), Some("2025-10-23"));
        assert_eq!(
            canonical_date(" 1/7/2026  2:00 PM").as_deref(),
            Some("2026-01-07")
        );
        assert_eq!(canonical_date("2026-01-07").as_deref(), Some("2026-01-07"));
        assert_eq!(canonical_date("TBD   later").as_deref(), Some("TBD later"));
        assert_eq!(canonical_date("  "), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut record = PropertyRecord::new(PropertyIdentifier::parse("F-1").unwrap());
        record.address = Some("  12  Main St\n Jersey City ".into());
        record.sales_date = Some("3/4/2025".into());
        record.plaintiff = Some("   ".into());
        let once = record.normalized();
        assert_eq!(once.address.as_deref(), Some("12 Main St Jersey City"));
        assert_eq!(once.sales_date.as_deref(), Some("2025-03-04"));
        assert_eq!(once.plaintiff, None);
        assert_eq!(once.clone().normalized(), once);
    }

    #[test]
    fn history_appends_without_touching_prior_text() {
        let mut history = StatusHistory::default();
        history
            .append(&HistoryEntry::first_observed(ts(1), Some("2025-04-01"), None))
            .unwrap();
        let before = history.as_str().to_string();

        let change = FieldChange {
            field: FieldName::SalesDate,
            old: Some("2025-04-01".into()),
            new: Some("2025-05-06".into()),
        };
        let status = PortalStatus {
            status: "Adjourned".into(),
            date: Some("3/2/2025".into()),
        };
        history
            .append(&HistoryEntry::changed(ts(2), vec![change], Some(&status)))
            .unwrap();

        assert!(history.as_str().starts_with(&before));
        let entries = history.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "First observed, sales date = 2025-04-01");
        assert_eq!(
            entries[1].event,
            "Sales date postponed from 2025-04-01 to 2025-05-06"
        );
        assert_eq!(entries[1].portal_status.as_deref(), Some("Adjourned (3/2/2025)"));
        assert!(entries[0].observed_at < entries[1].observed_at);
    }

    #[test]
    fn change_summary_lists_fields_when_no_date_move() {
        let entry = HistoryEntry::changed(
            ts(3),
            vec![
                FieldChange {
                    field: FieldName::Attorney,
                    old: None,
                    new: Some("Smith LLP".into()),
                },
                FieldChange {
                    field: FieldName::JudgmentAmount,
                    old: Some("10.00".into()),
                    new: Some("12.00".into()),
                },
            ],
            None,
        );
        assert_eq!(entry.event, "Updated: attorney, judgment_amount");
    }

    #[test]
    fn first_observed_without_date_says_unknown() {
        let entry = HistoryEntry::first_observed(ts(1), None, None);
        assert_eq!(entry.event, "First observed, sales date = unknown");
    }
}
