//! Create / update / no-op classification against the last stored record.

use chrono::{DateTime, Utc};
use civilview_core::{
    FieldChange, FieldName, FieldValue, HistoryEntry, HistoryError, PortalStatus,
    PropertyIdentifier, PropertyRecord, StatusHistory,
};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    Create,
    Update,
    Noop,
}

/// What was seen on the portal alongside the parsed record.
#[derive(Debug, Clone)]
pub struct Observation {
    pub observed_at: DateTime<Utc>,
    pub portal_status: Option<PortalStatus>,
}

impl Observation {
    pub fn now(portal_status: Option<PortalStatus>) -> Self {
        Self {
            observed_at: Utc::now(),
            portal_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub action: ReconcileAction,
    /// The full record as it should stand in the sink after the write.
    pub record: PropertyRecord,
    pub changes: Vec<FieldChange>,
    pub status_delta: Option<HistoryEntry>,
    /// Fields that came back empty and kept their prior value instead.
    pub retained: Vec<FieldName>,
}

/// The subset of a record an update writes: changed fields plus the history.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    pub identifier: PropertyIdentifier,
    pub fields: Vec<FieldName>,
    record: PropertyRecord,
}

impl RecordPatch {
    pub fn values(&self) -> impl Iterator<Item = (FieldName, FieldValue)> + '_ {
        self.fields.iter().map(|name| (*name, self.record.field(*name)))
    }

    pub fn status_history(&self) -> &StatusHistory {
        &self.record.status_history
    }

    /// Writes the patched fields and history onto `target`.
    pub fn apply_to(&self, target: &mut PropertyRecord) {
        for name in &self.fields {
            target.copy_field_from(*name, &self.record);
        }
        target.status_history = self.record.status_history.clone();
    }
}

impl Reconciliation {
    pub fn patch(&self) -> Option<RecordPatch> {
        if self.action != ReconcileAction::Update {
            return None;
        }
        Some(RecordPatch {
            identifier: self.record.sheriff_number.clone(),
            fields: self.changes.iter().map(|c| c.field).collect(),
            record: self.record.clone(),
        })
    }
}

pub fn reconcile(
    new: PropertyRecord,
    prior: Option<&PropertyRecord>,
    observation: &Observation,
) -> Result<Reconciliation, HistoryError> {
    let new = new.normalized();
    let portal_status = observation.portal_status.as_ref();

    let Some(prior) = prior else {
        let mut record = new;
        record.status_history = StatusHistory::default();
        let entry = HistoryEntry::first_observed(
            observation.observed_at,
            record.sales_date.as_deref(),
            portal_status,
        );
        record.status_history.append(&entry)?;
        return Ok(Reconciliation {
            action: ReconcileAction::Create,
            record,
            changes: Vec::new(),
            status_delta: Some(entry),
            retained: Vec::new(),
        });
    };

    let mut record = prior.clone().normalized();
    let mut changes = Vec::new();
    let mut retained = Vec::new();

    for name in FieldName::COMPARABLE {
        let old = record.field(name);
        let fresh = new.field(name);
        if old == fresh {
            continue;
        }
        if fresh.is_empty() {
            warn!(
                identifier = %record.sheriff_number,
                field = %name,
                prior = ?old.display(),
                "field came back empty; keeping prior value"
            );
            retained.push(name);
            continue;
        }
        changes.push(FieldChange {
            field: name,
            old: old.display(),
            new: fresh.display(),
        });
    }

    if changes.is_empty() {
        return Ok(Reconciliation {
            action: ReconcileAction::Noop,
            record,
            changes,
            status_delta: None,
            retained,
        });
    }

    for change in &changes {
        record.copy_field_from(change.field, &new);
    }
    let entry = HistoryEntry::changed(observation.observed_at, changes.clone(), portal_status);
    record.status_history.append(&entry)?;

    Ok(Reconciliation {
        action: ReconcileAction::Update,
        record,
        changes,
        status_delta: Some(entry),
        retained,
    })
}
