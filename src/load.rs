use crate::error::{PipelineError, Result};
use crate::extract::timed;
use crate::store::ObjectStore;
use crate::structs::{DateDimensionRow, StorageLocation};
use arrow_array::{BooleanArray, Date32Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use chrono::NaiveDate;
use log::debug;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use std::time::Duration;

/// File name of the published dimension table.
pub const OUTPUT_FILE_NAME: &str = "dim_date.snappy.parquet";

/// The ten columns of the date dimension.
pub fn dimension_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("calendar_date", DataType::Date32, false),
        Field::new("date_key", DataType::Int64, false),
        Field::new("day", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("year", DataType::Int32, false),
        Field::new("weekday_name", DataType::Utf8, false),
        Field::new("week_of_year", DataType::Int32, false),
        Field::new("quarter", DataType::Int32, false),
        Field::new("is_weekend", DataType::Boolean, false),
        Field::new("is_holiday", DataType::Boolean, false),
    ]))
}

/// Builds the Arrow batch for the dimension rows, in the given order.
///
/// # Errors
/// Returns error if the columns do not match [`dimension_schema`].
pub fn rows_to_batch(rows: &[DateDimensionRow]) -> Result<RecordBatch> {
    // NaiveDate::default() is the Unix epoch.
    let epoch = NaiveDate::default();

    let calendar_dates: Date32Array = rows
        .iter()
        .map(|r| Some((r.calendar_date - epoch).num_days() as i32))
        .collect();
    let date_keys: Int64Array = rows.iter().map(|r| r.date_key).collect();
    let days: Int32Array = rows.iter().map(|r| r.day as i32).collect();
    let months: Int32Array = rows.iter().map(|r| r.month as i32).collect();
    let years: Int32Array = rows.iter().map(|r| r.year).collect();
    let weekday_names = StringArray::from_iter_values(rows.iter().map(|r| r.weekday_name));
    let weeks: Int32Array = rows.iter().map(|r| r.week_of_year as i32).collect();
    let quarters: Int32Array = rows.iter().map(|r| r.quarter as i32).collect();
    let weekends: BooleanArray = rows.iter().map(|r| Some(r.is_weekend)).collect();
    let holidays: BooleanArray = rows.iter().map(|r| Some(r.is_holiday)).collect();

    Ok(RecordBatch::try_new(
        dimension_schema(),
        vec![
            Arc::new(calendar_dates),
            Arc::new(date_keys),
            Arc::new(days),
            Arc::new(months),
            Arc::new(years),
            Arc::new(weekday_names),
            Arc::new(weeks),
            Arc::new(quarters),
            Arc::new(weekends),
            Arc::new(holidays),
        ],
    )?)
}

/// Serializes the dimension as a Snappy-compressed Parquet file in memory.
///
/// Identical rows always produce identical bytes.
///
/// # Errors
/// Returns `PipelineError::Serialize` if the Parquet writer fails.
pub fn write_parquet(rows: &[DateDimensionRow]) -> Result<Bytes> {
    let batch = rows_to_batch(rows)?;
    let serialize_err = |source: ParquetError| PipelineError::Serialize { source };

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).map_err(serialize_err)?;
    writer.write(&batch).map_err(serialize_err)?;
    writer.close().map_err(serialize_err)?;

    Ok(Bytes::from(buffer))
}

/// Uploads the serialized dimension to `output`, replacing any previous table.
///
/// Returns the key written.
///
/// # Errors
/// Returns `PipelineError::Publish` on a store failure and
/// `PipelineError::Timeout` if the upload does not finish within `timeout`.
pub async fn publish(
    store: &dyn ObjectStore,
    output: &StorageLocation,
    bytes: Bytes,
    timeout: Duration,
) -> Result<String> {
    let key = output.key_for(OUTPUT_FILE_NAME);
    debug!("Uploading {} bytes to s3://{}/{}", bytes.len(), output.bucket, key);

    timed(timeout, "put", &key, store.put(&output.bucket, &key, bytes))
        .await?
        .map_err(|source| PipelineError::Publish {
            bucket: output.bucket.clone(),
            key: key.clone(),
            source,
        })?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{UsFederalHolidays, enrich_date};
    use crate::store::MemoryStore;
    use arrow_array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn rows() -> Vec<DateDimensionRow> {
        ["2005-05-24", "2006-06-03", "2006-07-04"]
            .iter()
            .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
            .map(|d| enrich_date(d, &UsFederalHolidays))
            .collect()
    }

    #[test]
    fn written_file_has_exactly_the_dimension_columns() {
        let bytes = write_parquet(&rows()).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).unwrap();
        let names: Vec<_> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "calendar_date",
                "date_key",
                "day",
                "month",
                "year",
                "weekday_name",
                "week_of_year",
                "quarter",
                "is_weekend",
                "is_holiday",
            ]
        );

        let batches: Vec<_> = builder
            .build()
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 3);
        let keys = batch
            .column_by_name("date_key")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(keys.values().to_vec(), vec![20050524, 20060603, 20060704]);
        let dates = batch
            .column_by_name("calendar_date")
            .unwrap()
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        assert_eq!(dates.value_as_date(1), NaiveDate::from_ymd_opt(2006, 6, 3));
    }

    #[test]
    fn columns_are_snappy_compressed() {
        let bytes = write_parquet(&rows()).unwrap();
        let reader = SerializedFileReader::new(bytes).unwrap();
        let row_group = reader.metadata().row_group(0);
        for column in row_group.columns() {
            assert_eq!(column.compression(), Compression::SNAPPY);
        }
    }

    #[test]
    fn serialization_is_deterministic() {
        assert_eq!(write_parquet(&rows()).unwrap(), write_parquet(&rows()).unwrap());
    }

    #[test]
    fn empty_dimension_still_has_schema() {
        let batch = rows_to_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 10);
        assert_eq!(batch.column(0).len(), 0);
    }

    #[tokio::test]
    async fn publish_overwrites_previous_table() {
        let store = MemoryStore::new();
        let output = StorageLocation::new("warehouse", "dim_date/");
        store.insert("warehouse", "dim_date/dim_date.snappy.parquet", &b"stale"[..]);

        let key = publish(&store, &output, Bytes::from("fresh"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(key, "dim_date/dim_date.snappy.parquet");
        assert_eq!(store.object("warehouse", &key), Some(Bytes::from("fresh")));
        assert_eq!(store.len(), 1);
    }
}
