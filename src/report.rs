//! Per-tick stage-count output.
//!
//! Once [`ContextReportExt::add_stage_count_report`] has been called, every committed tick
//! appends one CSV row with the stage counts after that tick. Rows are buffered and reach the
//! file on [`ContextReportExt::flush_reports`], at the end of
//! [`run_simulation`](crate::stepper::ContextStepperExt::run_simulation), or when the buffer fills.

use crate::{
    context::{Context, DataPlugin},
    error::EpiError,
    log::trace,
    stepper::TickSummary,
    Tick,
};
use serde::Serialize;
use std::{fs::File, path::Path};

#[derive(Serialize)]
struct StageCountRow {
    tick: Tick,
    susceptible: usize,
    exposed: usize,
    infected: usize,
    recovered: usize,
    deceased: usize,
    cumulative_deaths: u64,
}

impl From<&TickSummary> for StageCountRow {
    fn from(summary: &TickSummary) -> Self {
        StageCountRow {
            tick: summary.tick,
            susceptible: summary.counts.susceptible,
            exposed: summary.counts.exposed,
            infected: summary.counts.infected,
            recovered: summary.counts.recovered,
            deceased: summary.counts.deceased,
            cumulative_deaths: summary.cumulative_deaths,
        }
    }
}

struct ReportData {
    stage_counts: Option<csv::Writer<File>>,
}

impl DataPlugin for ReportData {
    const new: &'static dyn Fn() -> Self = &|| ReportData { stage_counts: None };
}

pub trait ContextReportExt {
    /// Starts writing stage counts to a new CSV file at `path`, truncating any existing file.
    fn add_stage_count_report(&mut self, path: impl AsRef<Path>) -> Result<(), EpiError>;

    /// Flushes buffered rows to disk.
    fn flush_reports(&mut self) -> Result<(), EpiError>;
}

impl ContextReportExt for Context {
    fn add_stage_count_report(&mut self, path: impl AsRef<Path>) -> Result<(), EpiError> {
        let path = path.as_ref();
        let report = self.get_data_container_mut::<ReportData>();
        if report.stage_counts.is_some() {
            return Err(EpiError::StateError("stage count report already added".to_string()));
        }
        trace!("writing stage counts to {}", path.display());
        report.stage_counts = Some(csv::Writer::from_path(path)?);
        Ok(())
    }

    fn flush_reports(&mut self) -> Result<(), EpiError> {
        if let Some(writer) = self
            .get_data_container_mut::<ReportData>()
            .stage_counts
            .as_mut()
        {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Buffers the row for a committed tick, if a report is open.
pub(crate) fn record_tick(context: &mut Context, summary: &TickSummary) -> Result<(), EpiError> {
    if let Some(writer) = context.get_data_container_mut::<ReportData>().stage_counts.as_mut() {
        writer.serialize(StageCountRow::from(summary))?;
    }
    Ok(())
}
