use std::collections::BTreeMap;
use std::sync::Arc;

use civilview_core::{
    canonical_date, normalize_text, ListingStub, Money, MoneyParseError, PortalStatus,
    PropertyIdentifier, PropertyRecord,
};
use civilview_storage::{CacheStore, FetchError, PageSource};
use scraper::Html;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{cell_text, element_text, normalize_label, selector, ParseError};

const SHERIFF: &[&str] = &["sheriff #", "sheriff number", "sheriff no.", "sheriff no"];
const CASE_NUMBER: &[&str] = &["court case #", "case #", "case number", "court case number"];
const ADDRESS: &[&str] = &["address", "property address"];
const SALES_DATE: &[&str] = &["sales date", "sale date"];
const PLAINTIFF: &[&str] = &["plaintiff"];
const DEFENDANT: &[&str] = &["defendant"];
const DESCRIPTION: &[&str] = &["description"];
const JUDGMENT: &[&str] = &["approx. judgment", "approx judgment", "judgment", "judgment amount"];
const UPSET: &[&str] = &["good faith upset", "upset amount", "upset"];
const ATTORNEY: &[&str] = &["attorney"];
const ATTORNEY_PHONE: &[&str] = &["attorney phone", "attorney phone #"];

/// Label → value pairs from the details table, keyed by normalized label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFieldMap(BTreeMap<String, String>);

impl RawFieldMap {
    /// First occurrence of a label wins.
    pub fn insert(&mut self, label: &str, value: String) {
        self.0.entry(normalize_label(label)).or_insert(value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, aliases: &[&str]) -> Option<&str> {
        aliases
            .iter()
            .find_map(|alias| self.0.get(*alias))
            .map(String::as_str)
    }

    fn text(&self, aliases: &[&str]) -> Option<String> {
        self.get(aliases).and_then(normalize_text)
    }

    pub fn identifier(&self) -> Result<PropertyIdentifier, ParseError> {
        self.get(SHERIFF)
            .and_then(PropertyIdentifier::parse)
            .ok_or(ParseError::MissingField("sheriff number"))
    }

    fn money(&self, identifier: &PropertyIdentifier, field: &str, aliases: &[&str]) -> Option<Money> {
        let raw = self.get(aliases)?;
        match Money::parse(raw) {
            Ok(amount) => Some(amount),
            Err(MoneyParseError::Empty) => {
                warn!(%identifier, field, "currency label present with no amount; storing null");
                None
            }
            Err(err) => {
                warn!(%identifier, field, raw, error = %err, "unparseable currency; storing null");
                None
            }
        }
    }

    /// Builds the normalized record. Only a missing sheriff number is fatal;
    /// every other field degrades to `None`.
    pub fn to_record(&self) -> Result<PropertyRecord, ParseError> {
        let identifier = self.identifier()?;
        let mut record = PropertyRecord::new(identifier.clone());
        record.case_number = self.text(CASE_NUMBER);
        record.address = self.text(ADDRESS);
        record.sales_date = self.get(SALES_DATE).and_then(canonical_date);
        record.plaintiff = self.text(PLAINTIFF);
        record.defendant = self.text(DEFENDANT);
        record.description = self.text(DESCRIPTION);
        record.attorney = self.text(ATTORNEY);
        record.attorney_phone = self.text(ATTORNEY_PHONE);
        record.judgment_amount = self.money(&identifier, "judgment_amount", JUDGMENT);
        record.good_faith_upset = self.money(&identifier, "good_faith_upset", UPSET);
        Ok(record.normalized())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDetail {
    pub fields: RawFieldMap,
    /// Rows of the portal's status table, oldest first.
    pub portal_status: Vec<PortalStatus>,
}

impl ParsedDetail {
    pub fn latest_status(&self) -> Option<&PortalStatus> {
        self.portal_status.last()
    }
}

/// Reads the labelled details table and the status table from a detail page.
pub fn parse_detail_page(html: &str) -> Result<ParsedDetail, ParseError> {
    let document = Html::parse_document(html);
    let details_sel = selector("table.table-striped:not(#longTable)")?;
    let row_sel = selector("tr")?;
    let heading_sel = selector("td.heading-bold, th")?;
    let td_sel = selector("td")?;
    let status_row_sel = selector("table#longTable tr")?;

    let table = document
        .select(&details_sel)
        .next()
        .ok_or(ParseError::MissingTable("details"))?;

    let mut fields = RawFieldMap::default();
    for row in table.select(&row_sel) {
        let Some(heading) = row.select(&heading_sel).next() else {
            continue;
        };
        let label = element_text(heading);
        if normalize_label(&label).is_empty() {
            continue;
        }
        let value = row
            .select(&td_sel)
            .find(|td| td.value().attr("class").is_none())
            .map(element_text)
            .unwrap_or_default();
        fields.insert(&label, value);
    }
    if fields.is_empty() {
        return Err(ParseError::NoLabelledRows);
    }

    let portal_status = document
        .select(&status_row_sel)
        .filter_map(|row| {
            let cells = row.select(&td_sel).collect::<Vec<_>>();
            if cells.len() < 2 {
                return None;
            }
            Some(PortalStatus {
                status: cell_text(cells[0])?,
                date: cell_text(cells[1]).as_deref().and_then(canonical_date),
            })
        })
        .collect();

    Ok(ParsedDetail {
        fields,
        portal_status,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProperty {
    pub record: PropertyRecord,
    pub portal_status: Option<PortalStatus>,
    pub from_cache: bool,
}

#[derive(Debug, Error)]
pub enum DetailError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("detail page did not match the expected layout: {0}")]
    Structural(#[from] ParseError),
}

impl DetailError {
    /// Structural failures point at a portal redesign rather than a flaky
    /// network, and count toward the run's abort threshold.
    pub fn is_structural(&self) -> bool {
        matches!(self, DetailError::Structural(_))
    }
}

/// Cache-first detail retrieval.
pub struct DetailFetcher {
    source: Arc<dyn PageSource>,
    cache: CacheStore,
}

impl DetailFetcher {
    pub fn new(source: Arc<dyn PageSource>, cache: CacheStore) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn parse(stub: &ListingStub, html: &str) -> Result<ParsedProperty, ParseError> {
        let detail = parse_detail_page(html)?;
        let record = detail.fields.to_record()?;
        if record.sheriff_number != stub.identifier {
            return Err(ParseError::IdentifierMismatch {
                expected: stub.identifier.clone(),
                found: record.sheriff_number,
            });
        }
        Ok(ParsedProperty {
            record,
            portal_status: detail.latest_status().cloned(),
            from_cache: false,
        })
    }

    /// Serves the detail page from cache when fresh, otherwise fetches it
    /// live. Only content that parsed is written back to the cache.
    #[instrument(skip(self, stub), fields(identifier = %stub.identifier))]
    pub async fn fetch_and_parse(&self, stub: &ListingStub) -> Result<ParsedProperty, DetailError> {
        if let Some(entry) = self.cache.get(&stub.identifier).await {
            match Self::parse(stub, &entry.content) {
                Ok(mut parsed) => {
                    debug!(fetched_at = %entry.fetched_at, "detail served from cache");
                    parsed.from_cache = true;
                    return Ok(parsed);
                }
                Err(err) => {
                    warn!(error = %err, "cached detail no longer parses; refetching");
                }
            }
        }

        let page = self.source.fetch_page(&stub.detail_url).await?;
        let parsed = Self::parse(stub, &page.body)?;
        if let Err(err) = self.cache.put(&stub.identifier, &page.body).await {
            warn!(error = %err, "failed to cache detail page");
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use tracing::{Dispatch, Level};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct TestWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    struct TestWriterGuard {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for TestWriter {
        type Writer = TestWriterGuard;

        fn make_writer(&'a self) -> Self::Writer {
            TestWriterGuard {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for TestWriterGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Runs `f` with a WARN-level subscriber and returns what it logged.
    fn captured_warnings(f: impl FnOnce()) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(TestWriter {
                buffer: buffer.clone(),
            })
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .finish();
        tracing::dispatcher::with_default(&Dispatch::new(subscriber), f);
        let logs = buffer.lock().expect("log buffer").clone();
        String::from_utf8(logs).expect("utf8 logs")
    }

    fn fixture(name: &str) -> String {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/civilview")
            .join(name);
        std::fs::read_to_string(&path).expect("read fixture")
    }

    #[test]
    fn detail_fixture_matches_snapshot() {
        let detail = parse_detail_page(&fixture("detail_page.html")).expect("parse");
        let record = detail.fields.to_record().expect("record");
        let expected: PropertyRecord =
            serde_json::from_str(&fixture("detail_snapshot.json")).expect("snapshot");
        assert_eq!(record, expected);

        assert_eq!(detail.portal_status.len(), 2);
        assert_eq!(
            detail.latest_status(),
            Some(&PortalStatus {
                status: "Adjourned - Plaintiff".to_string(),
                date: Some("2025-09-11".to_string()),
            })
        );
    }

    #[test]
    fn redesigned_page_is_a_structural_failure() {
        let err = parse_detail_page(&fixture("detail_redesigned.html")).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingTable("details") | ParseError::NoLabelledRows
        ));
    }

    #[test]
    fn unparseable_amounts_become_null_and_missing_sheriff_is_fatal() {
        let html = r#"<table class="table table-striped">
            <tr><td class="heading-bold">Sheriff # :</td><td>F-1</td></tr>
            <tr><td class="heading-bold">Approx. Judgment* :</td><td>N/A</td></tr>
            <tr><td class="heading-bold">Good Faith Upset* :</td><td></td></tr>
            <tr><td class="heading-bold">Sales Date :</td><td>TBD</td></tr>
        </table>"#;
        let record = parse_detail_page(html)
            .expect("parse")
            .fields
            .to_record()
            .expect("record");
        assert_eq!(record.judgment_amount, None);
        assert_eq!(record.good_faith_upset, None);
        assert_eq!(record.sales_date.as_deref(), Some("TBD"));
        assert_eq!(record.address, None);

        let no_id = r#"<table class="table table-striped">
            <tr><th>Address</th><td>1 MAIN ST</td></tr>
        </table>"#;
        let err = parse_detail_page(no_id)
            .expect("parse")
            .fields
            .to_record()
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField("sheriff number")));
    }

    #[test]
    fn null_amounts_are_logged_but_absent_labels_are_not() {
        let mut fields = RawFieldMap::default();
        fields.insert("Sheriff #", "F-3".to_string());
        fields.insert("Approx. Judgment*", "N/A".to_string());
        fields.insert("Good Faith Upset*", "  ".to_string());

        let logs = captured_warnings(|| {
            let record = fields.to_record().expect("record");
            assert_eq!(record.judgment_amount, None);
            assert_eq!(record.good_faith_upset, None);
        });
        assert!(logs.contains("unparseable currency; storing null"), "{logs}");
        assert!(logs.contains("judgment_amount"), "{logs}");
        assert!(logs.contains("currency label present with no amount"), "{logs}");
        assert!(logs.contains("good_faith_upset"), "{logs}");

        let mut bare = RawFieldMap::default();
        bare.insert("Sheriff #", "F-4".to_string());
        let logs = captured_warnings(|| {
            bare.to_record().expect("record");
        });
        assert!(logs.is_empty(), "{logs}");
    }

    #[test]
    fn first_label_wins_and_aliases_resolve() {
        let mut fields = RawFieldMap::default();
        fields.insert("Sheriff Number:", "F-2".to_string());
        fields.insert("Case #", "C-1".to_string());
        fields.insert("Case #", "C-2".to_string());
        fields.insert("Upset Amount*", "$10".to_string());
        let record = fields.to_record().expect("record");
        assert_eq!(record.sheriff_number.as_str(), "F-2");
        assert_eq!(record.case_number.as_deref(), Some("C-1"));
        assert_eq!(record.good_faith_upset, Some(Money::from_cents(1_000)));
    }
}
