//! MongoDB document sink.

use super::{DocumentSink, SinkError};
use crate::config::SinkConfig;
use crate::record::{Batch, Record};
use async_trait::async_trait;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, InsertManyOptions};
use mongodb::{Client, Collection};
use tracing::{debug, info, instrument};

/// Bulk-inserts telemetry documents into one collection.
pub struct MongoSink {
    client: Client,
    collection: Collection<Document>,
    target: String,
}

impl MongoSink {
    /// Build a client from the configured URI.
    ///
    /// The driver connects lazily; use [`DocumentSink::ping`] to verify the
    /// server is reachable and the credentials are accepted.
    pub async fn connect(config: &SinkConfig) -> Result<Self, SinkError> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(classify_error)?;

        options.app_name = Some("telemetry-ingest".to_string());
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.connect_timeout());

        let hosts = options
            .hosts
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let client = Client::with_options(options).map_err(classify_error)?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);

        let target = format!("mongodb://{}/{}.{}", hosts, config.database, config.collection);
        info!(target = %target, "MongoDB client created");

        Ok(Self {
            client,
            collection,
            target,
        })
    }
}

#[async_trait]
impl DocumentSink for MongoSink {
    async fn ping(&self) -> Result<(), SinkError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(classify_error)?;

        debug!(target = %self.target, "MongoDB ping succeeded");
        Ok(())
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id(), records = batch.len()))]
    async fn insert_many(&self, batch: &Batch) -> Result<usize, SinkError> {
        let documents: Vec<Document> = batch.records().iter().map(to_bson).collect();

        // Unordered so one bad document does not hide the outcome of the rest
        let options = InsertManyOptions::builder().ordered(false).build();

        match self.collection.insert_many(documents, options).await {
            Ok(result) => Ok(result.inserted_ids.len()),
            Err(e) => Err(classify_insert_error(e, batch.len())),
        }
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        info!(target = %self.target, "MongoDB connection closed");
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// BSON form of a record. The timestamp is stored as a native date.
pub fn to_bson(record: &Record) -> Document {
    let timestamp = bson::DateTime::from_millis(record.captured_at().timestamp_millis());
    match record.fields() {
        [number] => doc! { "number": *number, "timestamp": timestamp },
        numbers => doc! { "numbers": numbers.to_vec(), "timestamp": timestamp },
    }
}

fn classify_insert_error(error: MongoError, total: usize) -> SinkError {
    if let ErrorKind::BulkWrite(failure) = error.kind.as_ref() {
        if let Some(write_errors) = &failure.write_errors {
            let mut failed_indices: Vec<usize> = write_errors.iter().map(|w| w.index).collect();
            failed_indices.sort_unstable();
            failed_indices.dedup();

            let message = write_errors
                .first()
                .map(|w| w.message.clone())
                .unwrap_or_default();

            return SinkError::Partial {
                inserted: total.saturating_sub(failed_indices.len()),
                failed_indices,
                message,
            };
        }
    }
    classify_error(error)
}

fn classify_error(error: MongoError) -> SinkError {
    match error.kind.as_ref() {
        ErrorKind::Authentication { .. } => SinkError::Authentication(error.to_string()),
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => SinkError::Unavailable(error.to_string()),
        _ => SinkError::Rejected(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_single_field_bson_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let doc = to_bson(&Record::new(vec![42], ts));

        assert_eq!(doc.get_i64("number").unwrap(), 42);
        assert!(doc.get("numbers").is_none());
        assert_eq!(
            doc.get_datetime("timestamp").unwrap().timestamp_millis(),
            ts.timestamp_millis()
        );
    }

    #[test]
    fn test_multi_field_bson_shape() {
        let doc = to_bson(&Record::new(vec![1, 2, 3], Utc::now()));
        let numbers: Vec<i64> = doc
            .get_array("numbers")
            .unwrap()
            .iter()
            .filter_map(|b| b.as_i64())
            .collect();

        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(doc.get("number").is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_uri() {
        let config = SinkConfig {
            uri: "mongodb://".to_string(),
            ..SinkConfig::default()
        };
        assert!(MongoSink::connect(&config).await.is_err());
    }
}
