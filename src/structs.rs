use chrono::NaiveDate;
use log::{Log, Metadata, Record as LogRecord};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Simple logger implementation
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &LogRecord) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// One row of the date dimension, derived from a single calendar date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateDimensionRow {
    pub calendar_date: NaiveDate,
    pub date_key: i64,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub weekday_name: &'static str,
    pub week_of_year: u32,
    pub quarter: u32,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

/// A bucket plus key prefix, e.g. `sakila-rds-customers` + `fact_rental/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub bucket: String,
    pub prefix: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Key of `name` inside this location's prefix.
    pub fn key_for(&self, name: &str) -> String {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            format!("{}{}", self.prefix, name)
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Configuration for one dimension build
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input: StorageLocation,
    pub output: StorageLocation,
    pub timestamp_column: String,
    /// Upper bound for every single object store call.
    pub timeout: Duration,
    pub fetch_concurrency: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: StorageLocation::new("sakila-rds-customers", "fact_rental/"),
            output: StorageLocation::new("sakila-rds-customers", "dim_date/"),
            timestamp_column: "rental_date".to_string(),
            timeout: Duration::from_secs(30),
            fetch_concurrency: 8,
        }
    }
}

/// Stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovering,
    Loading,
    Deriving,
    Enriching,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovering => "discovering",
            Stage::Loading => "loading",
            Stage::Deriving => "deriving",
            Stage::Enriching => "enriching",
            Stage::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

/// Run lifecycle. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running(Stage),
    Done,
    Failed(Stage),
}

impl RunState {
    /// The state after `stage` completes successfully.
    pub fn advance(self) -> RunState {
        match self {
            RunState::Running(Stage::Discovering) => RunState::Running(Stage::Loading),
            RunState::Running(Stage::Loading) => RunState::Running(Stage::Deriving),
            RunState::Running(Stage::Deriving) => RunState::Running(Stage::Enriching),
            RunState::Running(Stage::Enriching) => RunState::Running(Stage::Publishing),
            RunState::Running(Stage::Publishing) => RunState::Done,
            terminal => terminal,
        }
    }

    pub fn fail(self) -> RunState {
        match self {
            RunState::Running(stage) => RunState::Failed(stage),
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running(_))
    }
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input_files: usize,
    pub input_rows: usize,
    pub skipped_timestamps: usize,
    pub dimension_rows: usize,
    pub holidays: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub output_bucket: String,
    pub output_key: String,
    pub output_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_walks_stages_in_order() {
        let mut state = RunState::Running(Stage::Discovering);
        let mut seen = vec![state];
        while !state.is_terminal() {
            state = state.advance();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                RunState::Running(Stage::Discovering),
                RunState::Running(Stage::Loading),
                RunState::Running(Stage::Deriving),
                RunState::Running(Stage::Enriching),
                RunState::Running(Stage::Publishing),
                RunState::Done,
            ]
        );
    }

    #[test]
    fn failure_is_terminal_and_keeps_stage() {
        let failed = RunState::Running(Stage::Loading).fail();
        assert_eq!(failed, RunState::Failed(Stage::Loading));
        assert_eq!(failed.advance(), failed);
        assert!(failed.is_terminal());
    }

    #[test]
    fn key_for_joins_prefix() {
        assert_eq!(
            StorageLocation::new("b", "dim_date/").key_for("x.parquet"),
            "dim_date/x.parquet"
        );
        assert_eq!(
            StorageLocation::new("b", "dim_date").key_for("x.parquet"),
            "dim_date/x.parquet"
        );
        assert_eq!(StorageLocation::new("b", "").key_for("x.parquet"), "x.parquet");
    }
}
