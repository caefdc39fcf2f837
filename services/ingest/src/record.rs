//! Parsed telemetry records, batches, and their stored document form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One parsed telemetry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<i64>,
    captured_at: DateTime<Utc>,
}

impl Record {
    pub(crate) fn new(fields: Vec<i64>, captured_at: DateTime<Utc>) -> Self {
        Self {
            fields,
            captured_at,
        }
    }

    pub fn fields(&self) -> &[i64] {
        &self.fields
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Document shape written to the store.
    pub fn to_document(&self) -> TelemetryDocument {
        let values = match self.fields.as_slice() {
            [single] => FieldValues::Single { number: *single },
            many => FieldValues::Many {
                numbers: many.to_vec(),
            },
        };

        TelemetryDocument {
            values,
            timestamp: self.captured_at,
        }
    }
}

/// A group of records flushed to the sink as one unit.
///
/// Only the batcher creates batches, and never empty ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: Uuid,
    records: Vec<Record>,
    created_at: DateTime<Utc>,
}

impl Batch {
    /// Returns `None` for an empty record list.
    pub(crate) fn from_records(records: Vec<Record>) -> Option<Self> {
        let created_at = records.first()?.captured_at;
        Some(Self {
            id: Uuid::new_v4(),
            records,
            created_at,
        })
    }

    /// Sub-batch carrying the records at `indices`, keeping the batch id.
    ///
    /// Used to retry only the documents a partial insert rejected.
    pub(crate) fn subset(&self, indices: &[usize]) -> Option<Self> {
        let records: Vec<Record> = indices
            .iter()
            .filter_map(|&i| self.records.get(i).cloned())
            .collect();
        let created_at = records.first()?.captured_at;
        Some(Self {
            id: self.id,
            records,
            created_at,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn documents(&self) -> Vec<TelemetryDocument> {
        self.records.iter().map(Record::to_document).collect()
    }
}

/// Stored document: `{ number, timestamp }` for single-field records,
/// `{ numbers: [...], timestamp }` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryDocument {
    #[serde(flatten)]
    pub values: FieldValues,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValues {
    Single { number: i64 },
    Many { numbers: Vec<i64> },
}

impl TelemetryDocument {
    pub fn values(&self) -> Vec<i64> {
        match &self.values {
            FieldValues::Single { number } => vec![*number],
            FieldValues::Many { numbers } => numbers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
    }

    #[test]
    fn test_single_field_document_json() {
        let record = Record::new(vec![42], ts());
        let json = serde_json::to_value(record.to_document()).unwrap();

        assert_eq!(json["number"], 42);
        assert_eq!(json["timestamp"], "2024-01-15T10:30:45Z");
        assert!(json.get("numbers").is_none());
    }

    #[test]
    fn test_multi_field_document_json() {
        let record = Record::new(vec![1, 2, 3], ts());
        let json = serde_json::to_value(record.to_document()).unwrap();

        assert_eq!(json["numbers"], serde_json::json!([1, 2, 3]));
        assert!(json.get("number").is_none());
    }

    #[test]
    fn test_document_deserializes_both_shapes() {
        let single: TelemetryDocument =
            serde_json::from_str(r#"{"number": 7, "timestamp": "2024-01-15T10:30:45Z"}"#).unwrap();
        assert_eq!(single.values(), vec![7]);

        let many: TelemetryDocument = serde_json::from_str(
            r#"{"numbers": [4, 5, 6], "timestamp": "2024-01-15T10:30:45Z"}"#,
        )
        .unwrap();
        assert_eq!(many.values(), vec![4, 5, 6]);
        assert_eq!(many.timestamp, ts());
    }

    #[test]
    fn test_empty_batch_is_never_built() {
        assert!(Batch::from_records(Vec::new()).is_none());
    }

    #[test]
    fn test_batch_created_at_is_first_record() {
        let later = ts() + chrono::Duration::seconds(5);
        let batch =
            Batch::from_records(vec![Record::new(vec![1], ts()), Record::new(vec![2], later)])
                .unwrap();

        assert_eq!(batch.created_at(), ts());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_subset_keeps_batch_id() {
        let records = (0..5).map(|i| Record::new(vec![i], ts())).collect();
        let batch = Batch::from_records(records).unwrap();

        let subset = batch.subset(&[1, 3, 99]).unwrap();
        assert_eq!(subset.id(), batch.id());
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.records()[0].fields(), &[1]);
        assert_eq!(subset.records()[1].fields(), &[3]);

        assert!(batch.subset(&[]).is_none());
    }
}
