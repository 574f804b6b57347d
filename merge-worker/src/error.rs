use std::fmt;

use merge_common::address::GeocodeError;
use merge_common::error::DatabaseError;
use merge_common::runs::{RunCounts, RunError};
use thiserror::Error;

/// The write-side step a merge was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    LoadStaging,
    WriteCustomers,
    WriteErrorReports,
    Deactivate,
}

impl MergeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStage::LoadStaging => "load_staging",
            MergeStage::WriteCustomers => "write_customers",
            MergeStage::WriteErrorReports => "write_error_reports",
            MergeStage::Deactivate => "deactivate",
        }
    }
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of reasons a merge run can fail.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("import {0} has no staging rows left after deduplication")]
    EmptyImport(i64),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("merge failed in stage {stage}: {source}")]
    Stage {
        stage: MergeStage,
        /// Registry changes committed before the failure.
        counts: RunCounts,
        source: DatabaseError,
    },
}

impl MergeError {
    /// Stage to record on the run, if the failure belongs to the run at all.
    pub fn failed_stage(&self) -> Option<MergeStage> {
        match self {
            MergeError::EmptyImport(_) => Some(MergeStage::LoadStaging),
            MergeError::Stage { stage, .. } => Some(*stage),
            MergeError::Run(_) => None,
        }
    }

    pub fn counts(&self) -> RunCounts {
        match self {
            MergeError::Stage { counts, .. } => *counts,
            _ => RunCounts::default(),
        }
    }
}

/// Enumeration of errors that stop the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect to the database: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("failed to build the geocoder client: {0}")]
    GeocoderError(#[from] GeocodeError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
