use crate::error::{PipelineError, Result, StoreError};
use crate::store::ObjectStore;
use crate::structs::StorageLocation;
use arrow_array::{Array, ArrayRef, RecordBatch, RecordBatchReader};
use arrow_cast::{can_cast_types, cast};
use arrow_schema::{Field, Schema};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use log::debug;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const PARQUET_EXTENSION: &str = ".parquet";

/// A decoded input object, projected down to the timestamp column.
#[derive(Debug, Clone)]
pub struct InputObject {
    pub key: String,
    pub batch: RecordBatch,
}

/// Runs one object store call under `timeout`.
///
/// The outer error is the timeout; the inner result is left to the caller so
/// it can attach stage-specific context.
pub(crate) async fn timed<T>(
    timeout: Duration,
    operation: &'static str,
    key: &str,
    call: impl Future<Output = std::result::Result<T, StoreError>>,
) -> Result<std::result::Result<T, StoreError>> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| PipelineError::Timeout {
            operation,
            key: key.to_string(),
        })
}

/// Lists the `.parquet` objects under `location`, sorted by key.
///
/// # Errors
///
/// Returns `PipelineError::NoInputFiles` when nothing matches, before any
/// object is read.
pub async fn discover_inputs(
    store: &dyn ObjectStore,
    location: &StorageLocation,
    timeout: Duration,
) -> Result<Vec<String>> {
    debug!("Listing {}", location);
    let mut keys: Vec<String> = timed(
        timeout,
        "list",
        &location.prefix,
        store.list(&location.bucket, &location.prefix),
    )
    .await?
    .map_err(|source| PipelineError::Storage {
        operation: "list",
        key: location.prefix.clone(),
        source,
    })?
    .into_iter()
    .filter(|key| key.ends_with(PARQUET_EXTENSION))
    .collect();

    if keys.is_empty() {
        return Err(PipelineError::NoInputFiles {
            bucket: location.bucket.clone(),
            prefix: location.prefix.clone(),
        });
    }

    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Decodes one Parquet object, keeping only `column`.
///
/// All row groups of the object end up in a single batch.
///
/// # Errors
///
/// Returns `PipelineError::Decode` if `bytes` is not valid Parquet and
/// `PipelineError::MissingColumn` if the file has no `column`.
pub fn decode_parquet(key: &str, bytes: Bytes, column: &str) -> Result<RecordBatch> {
    let decode_err = |source: ParquetError| PipelineError::Decode {
        key: key.to_string(),
        source,
    };

    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(decode_err)?;
    let index = builder
        .schema()
        .index_of(column)
        .map_err(|_| PipelineError::MissingColumn {
            key: key.to_string(),
            column: column.to_string(),
        })?;

    let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
    let reader = builder.with_projection(mask).build().map_err(decode_err)?;
    let schema = reader.schema();

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| decode_err(ParquetError::ArrowError(source.to_string())))?;

    Ok(arrow_select::concat::concat_batches(&schema, &batches)?)
}

/// Fetches and decodes every key, with up to `concurrency` requests in flight.
///
/// The result is sorted by key regardless of completion order.
pub async fn fetch_inputs(
    store: &dyn ObjectStore,
    bucket: &str,
    keys: &[String],
    column: &str,
    timeout: Duration,
    concurrency: usize,
) -> Result<Vec<InputObject>> {
    let mut objects: Vec<InputObject> = stream::iter(keys)
        .map(|key| async move {
            debug!("Reading {} ...", key);
            let bytes = timed(timeout, "get", key, store.get(bucket, key))
                .await?
                .map_err(|source| PipelineError::Storage {
                    operation: "get",
                    key: key.clone(),
                    source,
                })?;
            let size = bytes.len();
            let batch = decode_parquet(key, bytes, column)?;
            debug!("Decoded {} ({} bytes, {} rows)", key, size, batch.num_rows());
            Ok::<_, PipelineError>(InputObject {
                key: key.clone(),
                batch,
            })
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

/// Concatenates the timestamp columns of all inputs into one batch.
///
/// Columns whose type differs from the first input's (another timestamp unit
/// or zone, a date or string encoding) are cast to the first input's type.
///
/// # Errors
///
/// Returns `PipelineError::Data` if a column cannot be cast to that type.
pub fn merge_inputs(objects: &[InputObject], column: &str) -> Result<RecordBatch> {
    let first = objects
        .first()
        .ok_or_else(|| PipelineError::Data("no input batches to merge".to_string()))?;
    let data_type = first.batch.schema().field(0).data_type().clone();

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(objects.len());
    for object in objects {
        let array = object.batch.column(0);
        if array.data_type() == &data_type {
            columns.push(array.clone());
            continue;
        }
        if !can_cast_types(array.data_type(), &data_type) {
            return Err(PipelineError::Data(format!(
                "column '{}' is {} in '{}' but {} in '{}'",
                column,
                data_type,
                first.key,
                array.data_type(),
                object.key
            )));
        }
        debug!(
            "Casting '{}' in {} from {} to {}",
            column,
            object.key,
            array.data_type(),
            data_type
        );
        let unified = cast(array, &data_type).map_err(|err| {
            PipelineError::Data(format!(
                "cannot cast column '{}' in '{}' to {}: {}",
                column, object.key, data_type, err
            ))
        })?;
        columns.push(unified);
    }

    let arrays: Vec<&dyn Array> = columns.iter().map(|array| array.as_ref()).collect();
    let merged: ArrayRef = arrow_select::concat::concat(&arrays)?;
    let schema = Arc::new(Schema::new(vec![Field::new(column, data_type, true)]));
    Ok(RecordBatch::try_new(schema, vec![merged])?)
}
