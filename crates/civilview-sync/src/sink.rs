//! Record storage: the sink contract, the Airtable REST sink and an
//! in-memory sink for dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use civilview_core::{
    FieldName, FieldValue, Money, PropertyIdentifier, PropertyRecord, StatusHistory,
    SHERIFF_NUMBER_COLUMN, STATUS_HISTORY_COLUMN,
};
use civilview_storage::{
    classify_reqwest_error, classify_status, RetryDisposition, SimpleTokenBucket,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::reconcile::RecordPatch;

pub const AIRTABLE_API_ROOT: &str = "https://api.airtable.com/v0";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sink returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("unexpected sink response: {0}")]
    Decode(String),
    #[error("record {0} is not in the sink")]
    NotFound(PropertyIdentifier),
    #[error("sink rejected write for {0}")]
    Rejected(PropertyIdentifier),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            SinkError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            SinkError::Decode(_) | SinkError::NotFound(_) | SinkError::Rejected(_) => false,
        }
    }
}

/// Durable store of one record per identifier.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn find_by_identifier(
        &self,
        identifier: &PropertyIdentifier,
    ) -> Result<Option<PropertyRecord>, SinkError>;

    async fn create(&self, record: &PropertyRecord) -> Result<(), SinkError>;

    async fn update(
        &self,
        identifier: &PropertyIdentifier,
        patch: &RecordPatch,
    ) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkWrite {
    Create(PropertyIdentifier),
    Update {
        identifier: PropertyIdentifier,
        fields: Vec<FieldName>,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<PropertyIdentifier, PropertyRecord>,
    writes: Vec<SinkWrite>,
    rejected: HashSet<PropertyIdentifier>,
}

/// Keeps records in process memory and logs every write.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = PropertyRecord>) -> Self {
        let state = MemoryState {
            records: records
                .into_iter()
                .map(|r| (r.sheriff_number.clone(), r))
                .collect(),
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Every later write for `identifier` fails permanently.
    pub async fn reject_writes_for(&self, identifier: PropertyIdentifier) {
        self.state.lock().await.rejected.insert(identifier);
    }

    pub async fn record(&self, identifier: &PropertyIdentifier) -> Option<PropertyRecord> {
        self.state.lock().await.records.get(identifier).cloned()
    }

    pub async fn records(&self) -> Vec<PropertyRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn writes(&self) -> Vec<SinkWrite> {
        self.state.lock().await.writes.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn find_by_identifier(
        &self,
        identifier: &PropertyIdentifier,
    ) -> Result<Option<PropertyRecord>, SinkError> {
        Ok(self.record(identifier).await)
    }

    async fn create(&self, record: &PropertyRecord) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        let identifier = record.sheriff_number.clone();
        if state.rejected.contains(&identifier) {
            return Err(SinkError::Rejected(identifier));
        }
        state.records.insert(identifier.clone(), record.clone());
        state.writes.push(SinkWrite::Create(identifier));
        Ok(())
    }

    async fn update(
        &self,
        identifier: &PropertyIdentifier,
        patch: &RecordPatch,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if state.rejected.contains(identifier) {
            return Err(SinkError::Rejected(identifier.clone()));
        }
        let Some(target) = state.records.get_mut(identifier) else {
            return Err(SinkError::NotFound(identifier.clone()));
        };
        patch.apply_to(target);
        state.writes.push(SinkWrite::Update {
            identifier: identifier.clone(),
            fields: patch.fields.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_key: String,
    pub base_id: String,
    pub table_id: String,
    pub api_root: String,
    pub timeout: Duration,
    /// Airtable allows five requests per second per base.
    pub requests_per_second: u32,
}

impl AirtableConfig {
    pub fn new(api_key: String, base_id: String, table_id: String) -> Self {
        Self {
            api_key,
            base_id,
            table_id,
            api_root: AIRTABLE_API_ROOT.to_string(),
            timeout: Duration::from_secs(30),
            requests_per_second: 5,
        }
    }

    fn table_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_root.trim_end_matches('/'),
            self.base_id,
            self.table_id
        )
    }
}

#[derive(Debug, Clone)]
struct IndexedRow {
    record_id: String,
    record: PropertyRecord,
}

#[derive(Debug, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct AirtableListPage {
    records: Vec<AirtableRecord>,
    #[serde(default)]
    offset: Option<String>,
}

/// Airtable REST sink. The table is read once, on first lookup, into an index
/// keyed by sheriff number; creates and updates keep the index current.
pub struct AirtableSink {
    client: reqwest::Client,
    config: AirtableConfig,
    pacer: SimpleTokenBucket,
    index: Mutex<Option<HashMap<PropertyIdentifier, IndexedRow>>>,
}

impl AirtableSink {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .context("building airtable client")?;
        let rps = config.requests_per_second.max(1);
        Ok(Self {
            client,
            pacer: SimpleTokenBucket::new(rps, Duration::from_millis(1000 / u64::from(rps))),
            config,
            index: Mutex::new(None),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SinkError> {
        self.pacer.take().await;
        let resp = request.bearer_auth(&self.config.api_key).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn load_index(&self) -> Result<HashMap<PropertyIdentifier, IndexedRow>, SinkError> {
        let url = self.config.table_url();
        let mut index = HashMap::new();
        let mut offset: Option<String> = None;
        loop {
            let mut request = self.client.get(&url).query(&[("pageSize", "100")]);
            if let Some(offset) = &offset {
                request = request.query(&[("offset", offset.as_str())]);
            }
            let value = self.send(request).await?;
            let page: AirtableListPage =
                serde_json::from_value(value).map_err(|err| SinkError::Decode(err.to_string()))?;
            for row in page.records {
                match record_from_fields(&row.fields) {
                    Some(record) => {
                        index.insert(
                            record.sheriff_number.clone(),
                            IndexedRow {
                                record_id: row.id,
                                record,
                            },
                        );
                    }
                    None => warn!(record_id = %row.id, "airtable row without a sheriff number; ignored"),
                }
            }
            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        info!(records = index.len(), "loaded airtable index");
        Ok(index)
    }

    async fn with_index<T>(
        &self,
        f: impl FnOnce(&mut HashMap<PropertyIdentifier, IndexedRow>) -> T,
    ) -> Result<T, SinkError> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await?);
        }
        Ok(f(guard.get_or_insert_with(HashMap::new)))
    }
}

fn field_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Text(text) => text.map(Value::String).unwrap_or(Value::Null),
        FieldValue::Money(amount) => amount
            .and_then(|m| serde_json::Number::from_f64(m.as_f64()))
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}

fn record_fields(record: &PropertyRecord) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        SHERIFF_NUMBER_COLUMN.to_string(),
        Value::String(record.sheriff_number.to_string()),
    );
    for name in FieldName::COMPARABLE {
        fields.insert(name.column().to_string(), field_json(record.field(name)));
    }
    fields.insert(
        STATUS_HISTORY_COLUMN.to_string(),
        Value::String(record.status_history.as_str().to_string()),
    );
    fields
}

fn patch_fields(patch: &RecordPatch) -> Map<String, Value> {
    let mut fields = patch
        .values()
        .map(|(name, value)| (name.column().to_string(), field_json(value)))
        .collect::<Map<_, _>>();
    fields.insert(
        STATUS_HISTORY_COLUMN.to_string(),
        Value::String(patch.status_history().as_str().to_string()),
    );
    fields
}

fn text_cell(fields: &Map<String, Value>, column: &str) -> Option<String> {
    match fields.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn money_cell(fields: &Map<String, Value>, column: &str) -> Option<Money> {
    match fields.get(column)? {
        Value::Number(n) => n.as_f64().map(Money::from),
        Value::String(s) => Money::parse(s).ok(),
        _ => None,
    }
}

/// Reads a stored row back into a record. Rows without a sheriff number
/// cannot be matched and yield `None`.
fn record_from_fields(fields: &Map<String, Value>) -> Option<PropertyRecord> {
    let identifier = text_cell(fields, SHERIFF_NUMBER_COLUMN)
        .as_deref()
        .and_then(PropertyIdentifier::parse)?;
    let mut record = PropertyRecord::new(identifier);
    record.case_number = text_cell(fields, FieldName::CaseNumber.column());
    record.address = text_cell(fields, FieldName::Address.column());
    record.sales_date = text_cell(fields, FieldName::SalesDate.column());
    record.plaintiff = text_cell(fields, FieldName::Plaintiff.column());
    record.defendant = text_cell(fields, FieldName::Defendant.column());
    record.attorney = text_cell(fields, FieldName::Attorney.column());
    record.attorney_phone = text_cell(fields, FieldName::AttorneyPhone.column());
    record.judgment_amount = money_cell(fields, FieldName::JudgmentAmount.column());
    record.good_faith_upset = money_cell(fields, FieldName::GoodFaithUpset.column());
    record.description = text_cell(fields, FieldName::Description.column());
    record.status_history =
        StatusHistory::from_text(text_cell(fields, STATUS_HISTORY_COLUMN).unwrap_or_default());
    Some(record)
}

#[async_trait]
impl RecordSink for AirtableSink {
    async fn find_by_identifier(
        &self,
        identifier: &PropertyIdentifier,
    ) -> Result<Option<PropertyRecord>, SinkError> {
        self.with_index(|index| index.get(identifier).map(|row| row.record.clone()))
            .await
    }

    async fn create(&self, record: &PropertyRecord) -> Result<(), SinkError> {
        let body = serde_json::json!({ "fields": record_fields(record) });
        let created = match self
            .send(self.client.post(self.config.table_url()).json(&body))
            .await
        {
            Ok(created) => created,
            Err(err) => {
                if err.is_retryable() {
                    // The row may exist anyway; reload before the next lookup.
                    *self.index.lock().await = None;
                }
                return Err(err);
            }
        };
        let record_id = created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SinkError::Decode("create response without an id".to_string()))?;
        debug!(identifier = %record.sheriff_number, %record_id, "airtable record created");
        self.with_index(|index| {
            index.insert(
                record.sheriff_number.clone(),
                IndexedRow {
                    record_id,
                    record: record.clone(),
                },
            );
        })
        .await
    }

    async fn update(
        &self,
        identifier: &PropertyIdentifier,
        patch: &RecordPatch,
    ) -> Result<(), SinkError> {
        let record_id = self
            .with_index(|index| index.get(identifier).map(|row| row.record_id.clone()))
            .await?
            .ok_or_else(|| SinkError::NotFound(identifier.clone()))?;

        let body = serde_json::json!({ "fields": patch_fields(patch) });
        let url = format!("{}/{}", self.config.table_url(), record_id);
        self.send(self.client.patch(url).json(&body)).await?;
        debug!(%identifier, %record_id, fields = patch.fields.len(), "airtable record updated");

        self.with_index(|index| {
            if let Some(row) = index.get_mut(identifier) {
                patch.apply_to(&mut row.record);
            }
        })
        .await
    }
}
