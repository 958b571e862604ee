pub mod calendar;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod store;
pub mod structs;
pub mod transform;

// Re-export public API
pub use calendar::{Holiday, HolidayCalendar, UsFederalHolidays, enrich_date};
pub use error::{PipelineError, Result, RunFailure, StoreError};
pub use load::{OUTPUT_FILE_NAME, dimension_schema, write_parquet};
pub use pipeline::DateDimensionJob;
pub use store::{FsStore, MemoryStore, ObjectStore, S3Config, S3Store};
pub use structs::{
    DateDimensionRow, JobConfig, RunReport, RunState, SimpleLogger, Stage, StorageLocation,
};
pub use transform::{build_dimension, derive_distinct_dates};
