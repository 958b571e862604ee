use crate::calendar::{HolidayCalendar, enrich_date};
use crate::error::{PipelineError, Result};
use crate::structs::DateDimensionRow;
use arrow_array::cast::AsArray;
use arrow_array::types::{
    ArrowTemporalType, Date32Type, Date64Type, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
};
use arrow_array::timezone::Tz;
use arrow_array::{Array, ArrayRef, PrimitiveArray, RecordBatch};
use arrow_schema::{DataType, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::debug;
use rayon::prelude::*;
use std::collections::BTreeSet;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const MAX_SAMPLES: usize = 5;

/// Distinct transaction dates plus the rows that could not contribute one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinctDates {
    /// Ascending, no duplicates.
    pub dates: Vec<NaiveDate>,
    /// Rows whose timestamp was null or unparseable.
    pub skipped: usize,
    /// A few of the skipped raw values, for the warning.
    pub skipped_samples: Vec<String>,
}

#[derive(Default)]
struct DateScan {
    dates: BTreeSet<NaiveDate>,
    skipped: usize,
    samples: Vec<String>,
}

impl DateScan {
    fn keep(&mut self, date: NaiveDate) {
        self.dates.insert(date);
    }

    fn skip(&mut self, raw: Option<String>) {
        self.skipped += 1;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(raw.unwrap_or_else(|| "null".to_string()));
        }
    }

    fn finish(self) -> DistinctDates {
        DistinctDates {
            dates: self.dates.into_iter().collect(),
            skipped: self.skipped,
            skipped_samples: self.samples,
        }
    }
}

/// Extracts the sorted set of distinct dates from the timestamp column.
///
/// Each timestamp is truncated to its calendar date. Zoned timestamp columns
/// give the wall-clock date in their zone, the same date an RFC 3339 string
/// of that instant carries. Nulls and values that do not parse are counted in
/// [`DistinctDates::skipped`] instead of failing the run.
///
/// # Errors
///
/// Returns `PipelineError::Data` if the column is missing, is not a
/// timestamp, date or string column, or names an unknown timezone.
pub fn derive_distinct_dates(batch: &RecordBatch, column: &str) -> Result<DistinctDates> {
    let array = get_column(batch, column)?;
    let mut scan = DateScan::default();

    match array.data_type() {
        DataType::Timestamp(unit, tz) => {
            let tz = parse_timezone(column, tz.as_deref())?;
            match unit {
                TimeUnit::Second => {
                    scan_temporal(array.as_primitive::<TimestampSecondType>(), tz, &mut scan)
                }
                TimeUnit::Millisecond => {
                    scan_temporal(array.as_primitive::<TimestampMillisecondType>(), tz, &mut scan)
                }
                TimeUnit::Microsecond => {
                    scan_temporal(array.as_primitive::<TimestampMicrosecondType>(), tz, &mut scan)
                }
                TimeUnit::Nanosecond => {
                    scan_temporal(array.as_primitive::<TimestampNanosecondType>(), tz, &mut scan)
                }
            }
        }
        DataType::Date32 => scan_temporal(array.as_primitive::<Date32Type>(), None, &mut scan),
        DataType::Date64 => scan_temporal(array.as_primitive::<Date64Type>(), None, &mut scan),
        DataType::Utf8 => scan_strings(array.as_string::<i32>().iter(), &mut scan),
        DataType::LargeUtf8 => scan_strings(array.as_string::<i64>().iter(), &mut scan),
        other => {
            return Err(PipelineError::Data(format!(
                "Column {} has unsupported type {}",
                column, other
            )));
        }
    }

    let distinct = scan.finish();
    debug!(
        "Found {} distinct dates in {} rows ({} skipped)",
        distinct.dates.len(),
        batch.num_rows(),
        distinct.skipped
    );
    Ok(distinct)
}

/// Enriches every date into a dimension row, keeping the input order.
pub fn build_dimension(
    dates: &[NaiveDate],
    holidays: &dyn HolidayCalendar,
) -> Vec<DateDimensionRow> {
    dates
        .par_iter()
        .map(|&date| enrich_date(date, holidays))
        .collect()
}

/// Parses a timestamp string down to its calendar date.
///
/// Accepts plain dates, `date time` / `dateTtime` with optional fractional
/// seconds, and RFC 3339 (the offset is ignored, the written date is kept).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return Some(date);
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    {
        return Some(dt.date());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.naive_local().date())
}

/// Gets a column from an Arrow RecordBatch by name.
fn get_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::Data(format!("Column not found: {}", name)))
}

fn parse_timezone(column: &str, tz: Option<&str>) -> Result<Option<Tz>> {
    tz.map(|name| {
        name.parse::<Tz>().map_err(|err| {
            PipelineError::Data(format!(
                "Column {} has unknown timezone {}: {}",
                column, name, err
            ))
        })
    })
    .transpose()
}

fn scan_temporal<T>(array: &PrimitiveArray<T>, tz: Option<Tz>, scan: &mut DateScan)
where
    T: ArrowTemporalType,
    i64: From<T::Native>,
{
    for i in 0..array.len() {
        if array.is_null(i) {
            scan.skip(None);
            continue;
        }
        let date = match tz {
            Some(tz) => array
                .value_as_datetime_with_tz(i, tz)
                .map(|dt| dt.date_naive()),
            None => array.value_as_datetime(i).map(|dt| dt.date()),
        };
        match date {
            Some(date) => scan.keep(date),
            None => scan.skip(Some(i64::from(array.value(i)).to_string())),
        }
    }
}

fn scan_strings<'a>(values: impl Iterator<Item = Option<&'a str>>, scan: &mut DateScan) {
    for value in values {
        match value {
            Some(raw) => match parse_date(raw) {
                Some(date) => scan.keep(date),
                None => scan.skip(Some(raw.to_string())),
            },
            None => scan.skip(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::UsFederalHolidays;
    use arrow_array::{
        Date32Array, Int64Array, StringArray, TimestampMicrosecondArray, TimestampSecondArray,
    };
    use arrow_schema::{Field, Schema};
    use std::sync::Arc;

    fn batch_of(array: ArrayRef) -> RecordBatch {
        let schema = Schema::new(vec![Field::new(
            "rental_date",
            array.data_type().clone(),
            true,
        )]);
        RecordBatch::try_new(Arc::new(schema), vec![array]).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn duplicates_collapse_and_dates_sort() {
        let array = StringArray::from(vec!["2005-05-25", "2005-05-24", "2005-05-24"]);
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24"), date("2005-05-25")]);
        assert_eq!(distinct.skipped, 0);
    }

    #[test]
    fn time_of_day_is_truncated() {
        let array = StringArray::from(vec![
            "2005-05-24 22:53:30",
            "2005-05-24T23:59:59.999",
            "2005-05-25T00:00:01+05:00",
        ]);
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24"), date("2005-05-25")]);
    }

    #[test]
    fn naive_timestamps_keep_their_stored_date() {
        // 2005-05-24 22:53:30 and 2005-05-25 00:00:00 in microseconds.
        let array = TimestampMicrosecondArray::from(vec![
            Some(1_116_975_210_000_000),
            Some(1_116_979_200_000_000),
            None,
        ]);
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24"), date("2005-05-25")]);
        assert_eq!(distinct.skipped, 1);
    }

    #[test]
    fn zoned_timestamps_use_the_local_date() {
        // Same instants as above; both are still May 24th in New York.
        let array = TimestampMicrosecondArray::from(vec![
            Some(1_116_975_210_000_000),
            Some(1_116_979_200_000_000),
        ])
        .with_timezone("America/New_York");
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24")]);

        let offset = TimestampSecondArray::from(vec![1_116_979_200]).with_timezone("+05:00");
        let distinct = derive_distinct_dates(&batch_of(Arc::new(offset)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-25")]);
    }

    #[test]
    fn same_instant_gives_same_date_as_string_or_timestamp() {
        let text = StringArray::from(vec!["2005-05-24T22:00:00-04:00"]);
        let stamp = TimestampSecondArray::from(vec![1_116_986_400]).with_timezone("America/New_York");

        let from_text = derive_distinct_dates(&batch_of(Arc::new(text)), "rental_date").unwrap();
        let from_stamp = derive_distinct_dates(&batch_of(Arc::new(stamp)), "rental_date").unwrap();
        assert_eq!(from_text.dates, vec![date("2005-05-24")]);
        assert_eq!(from_stamp.dates, from_text.dates);
    }

    #[test]
    fn unknown_timezone_is_a_data_error() {
        let array = TimestampSecondArray::from(vec![1_116_986_400]).with_timezone("Mars/Olympus");
        assert!(matches!(
            derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date"),
            Err(PipelineError::Data(_))
        ));
    }

    #[test]
    fn date32_columns_are_accepted() {
        let array = Date32Array::from(vec![12_927, 12_927, 12_928]);
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24"), date("2005-05-25")]);
    }

    #[test]
    fn bad_values_are_skipped_and_sampled() {
        let array = StringArray::from(vec![
            Some("2005-05-24"),
            None,
            Some("not a date"),
            Some("2005-13-01"),
        ]);
        let distinct = derive_distinct_dates(&batch_of(Arc::new(array)), "rental_date").unwrap();
        assert_eq!(distinct.dates, vec![date("2005-05-24")]);
        assert_eq!(distinct.skipped, 3);
        assert_eq!(distinct.skipped_samples, vec!["null", "not a date", "2005-13-01"]);
    }

    #[test]
    fn unsupported_and_missing_columns_fail() {
        let batch = batch_of(Arc::new(Int64Array::from(vec![1, 2])));
        assert!(matches!(
            derive_distinct_dates(&batch, "rental_date"),
            Err(PipelineError::Data(_))
        ));
        assert!(matches!(
            derive_distinct_dates(&batch, "payment_date"),
            Err(PipelineError::Data(_))
        ));
    }

    #[test]
    fn dimension_keeps_date_order() {
        let dates = vec![date("2005-05-24"), date("2005-05-25"), date("2006-07-04")];
        let rows = build_dimension(&dates, &UsFederalHolidays);
        let got: Vec<_> = rows.iter().map(|r| r.calendar_date).collect();
        assert_eq!(got, dates);
        assert!(rows[2].is_holiday);
        for row in &rows {
            assert_eq!(
                row.date_key,
                i64::from(row.year) * 10_000 + i64::from(row.month) * 100 + i64::from(row.day)
            );
            assert_eq!(
                row.is_weekend,
                row.weekday_name == "Saturday" || row.weekday_name == "Sunday"
            );
        }
    }
}
