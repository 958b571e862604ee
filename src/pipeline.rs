//! The date dimension build, stage by stage.
//!
//! A run walks `Discovering → Loading → Deriving → Enriching → Publishing` and
//! ends in `Done`, or in `Failed` at the first error. Nothing is written to
//! the output location unless every earlier stage succeeded.

use crate::calendar::HolidayCalendar;
use crate::error::{PipelineError, Result, RunFailure};
use crate::extract::{discover_inputs, fetch_inputs, merge_inputs};
use crate::load::{publish, write_parquet};
use crate::store::ObjectStore;
use crate::structs::{JobConfig, RunReport, RunState, Stage};
use crate::transform::{build_dimension, derive_distinct_dates};
use log::{debug, info, warn};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds and publishes the date dimension for one configuration.
pub struct DateDimensionJob<'a> {
    store: &'a dyn ObjectStore,
    holidays: &'a dyn HolidayCalendar,
    config: JobConfig,
    cancel: CancellationToken,
}

impl<'a> DateDimensionJob<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        holidays: &'a dyn HolidayCalendar,
        config: JobConfig,
    ) -> Self {
        Self {
            store,
            holidays,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` to stop the run between stages or while one is waiting
    /// on the object store.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Runs every stage once.
    ///
    /// # Errors
    ///
    /// Returns the first stage error wrapped in a [`RunFailure`]; there is no
    /// retry and no partial output.
    pub async fn run(&self) -> std::result::Result<RunReport, RunFailure> {
        let config = &self.config;
        let mut state = RunState::Running(Stage::Discovering);

        let keys = self
            .stage(Stage::Discovering, &mut state, async {
                info!("Discovering inputs under {}", config.input);
                discover_inputs(self.store, &config.input, config.timeout).await
            })
            .await?;

        let (merged, input_files) = self
            .stage(Stage::Loading, &mut state, async {
                info!("Loading {} input files", keys.len());
                let objects = fetch_inputs(
                    self.store,
                    &config.input.bucket,
                    &keys,
                    &config.timestamp_column,
                    config.timeout,
                    config.fetch_concurrency,
                )
                .await?;
                let merged = merge_inputs(&objects, &config.timestamp_column)?;
                Ok::<_, PipelineError>((merged, objects.len()))
            })
            .await?;

        let distinct = self
            .stage(Stage::Deriving, &mut state, async {
                info!(
                    "Deriving distinct dates from {} rows of '{}'",
                    merged.num_rows(),
                    config.timestamp_column
                );
                let distinct = derive_distinct_dates(&merged, &config.timestamp_column)?;
                if distinct.skipped > 0 {
                    warn!(
                        "Skipped {} rows with null or unparseable '{}' values, e.g. {:?}",
                        distinct.skipped, config.timestamp_column, distinct.skipped_samples
                    );
                }
                if distinct.dates.is_empty() {
                    warn!("No valid transaction dates found; publishing an empty dimension");
                }
                Ok::<_, PipelineError>(distinct)
            })
            .await?;

        let rows = self
            .stage(Stage::Enriching, &mut state, async {
                info!("Enriching {} dates", distinct.dates.len());
                Ok::<_, PipelineError>(build_dimension(&distinct.dates, self.holidays))
            })
            .await?;

        let (output_key, output_bytes) = self
            .stage(Stage::Publishing, &mut state, async {
                let bytes = write_parquet(&rows)?;
                let size = bytes.len();
                // Last chance to stop before the output is replaced.
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled {
                        stage: Stage::Publishing,
                    });
                }
                info!("Publishing {} rows ({} bytes)", rows.len(), size);
                let key = publish(self.store, &config.output, bytes, config.timeout).await?;
                Ok::<_, PipelineError>((key, size))
            })
            .await?;

        debug_assert_eq!(state, RunState::Done);
        info!("Published s3://{}/{}", config.output.bucket, output_key);

        Ok(RunReport {
            input_files,
            input_rows: merged.num_rows(),
            skipped_timestamps: distinct.skipped,
            dimension_rows: rows.len(),
            holidays: rows.iter().filter(|row| row.is_holiday).count(),
            first_date: distinct.dates.first().copied(),
            last_date: distinct.dates.last().copied(),
            output_bucket: config.output.bucket.clone(),
            output_key,
            output_bytes,
        })
    }

    /// Drives `stage` and moves `state` on, or to `Failed`.
    async fn stage<T>(
        &self,
        stage: Stage,
        state: &mut RunState,
        work: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, RunFailure> {
        *state = RunState::Running(stage);
        let started = Instant::now();

        let outcome = if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled { stage })
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(PipelineError::Cancelled { stage }),
                outcome = work => outcome,
            }
        };

        match outcome {
            Ok(value) => {
                debug!("Stage {} finished in {:.2?}", stage, started.elapsed());
                *state = state.advance();
                Ok(value)
            }
            Err(error) => {
                *state = state.fail();
                Err(RunFailure { stage, error })
            }
        }
    }
}
