//! # neurobatch
//!
//! An idempotent parallel batch runner for neuroimaging pipelines built on
//! FreeSurfer and FSL command-line tools.
//!
//! ## Overview
//!
//! A batch run scans a data directory for work units (subjects, or
//! subject/session pairs), skips the units that are already complete, clears
//! stale partial outputs of the rest and runs each unit's pipeline of external
//! commands on a bounded pool of workers. One unit failing never cancels
//! another; the run ends with a [`batch::BatchReport`] listing what was
//! skipped, what succeeded and what failed, so re-running the same batch
//! retries only the failures.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use neurobatch::batch::{discover_units, BatchExecutor, DiscoverySpec};
//! use neurobatch::pipeline::ProcessRunner;
//! use neurobatch::recipes::ReconRecipe;
//!
//! # async fn example() -> neurobatch::Result<()> {
//! let units = discover_units("/data/sorted", &DiscoverySpec::subjects())?;
//! let recipe = ReconRecipe::subjects("t1/T1_unbiased.nii.gz");
//!
//! let report = BatchExecutor::new(Arc::new(ProcessRunner::new()))
//!     .with_concurrency_limit(8)
//!     .run_units(units, &recipe)
//!     .await?;
//!
//! println!("{} failed", report.failed_count());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: unit discovery, completion checks and the batch executor
//! - [`pipeline`]: step templates, the command runner seam and sequential execution
//! - [`recipes`]: recon-all, atlas parcellation and diffusion pipelines
//! - [`stats`]: statistics tables, metric scraping and workbook assembly
//! - [`config`]: immutable run settings loaded from TOML
//! - [`logging`]: append-only batch log and console tracing setup
//! - [`metrics`]: Prometheus counters for units and steps

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::path::PathBuf;

use thiserror::Error;

/// Result type for neurobatch operations
pub type Result<T> = std::result::Result<T, NeuroBatchError>;

/// Main error type for neurobatch operations
///
/// Only batch-wide setup failures surface through this type. Failures inside a
/// single unit are recorded in the batch report instead.
#[derive(Error, Debug)]
pub enum NeuroBatchError {
    /// The data root exists but could not be listed
    #[error("Discovery error at {path}: {source}")]
    Discovery {
        /// Directory being scanned
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration value is invalid
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// A step template could not be rendered
    #[error("Template error: {0}")]
    Template(#[from] pipeline::TemplateError),

    /// A metric extraction pattern failed to compile
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// Filesystem error outside a unit
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Workbook write error
    #[error("Workbook error: {0}")]
    Workbook(#[from] rust_xlsxwriter::XlsxError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics could not be encoded
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Unit discovery, completion checks and batch dispatch
pub mod batch;

/// Pipeline model and sequential step execution
pub mod pipeline;

/// Concrete pipeline descriptions for the supported tools
pub mod recipes;

/// Statistics extraction and tabular outputs
pub mod stats;

/// Run configuration
pub mod config;

/// Batch log and tracing setup
pub mod logging;

/// Prometheus metrics
pub mod metrics;
