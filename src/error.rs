//! Pipeline error types.
//!
//! All fatal failures funnel into [`PipelineError`]. Recoverable data
//! problems (parse failures, locked/crossed quotes, null fields, out-of-session
//! rows) are never errors: they are counted by the stage that sees them and
//! summarized in its report.
//!
//! Stage drivers wrap failures with [`PipelineError::Stage`] so the caller
//! always knows which stage and which shard failed.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Underlying I/O failure (missing inputs, unwritable outputs).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed columnar file.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow-level failure while building or reading record batches.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Malformed JSON artifact (model file, strategy config).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed TOML configuration file.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration rejected by `validate()`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A required column is absent from an input table.
    #[error("schema error: missing required column '{column}' in {path}")]
    MissingColumn { column: &'static str, path: PathBuf },

    /// A column exists but holds an unexpected Arrow type.
    #[error("schema error: column '{column}' has unexpected type {actual}")]
    ColumnType { column: &'static str, actual: String },

    /// Internal invariant violated (cell index out of range, day-order
    /// regression, writer reopened). Always a bug, never a data problem.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A stage failed; carries the stage name and the shard being processed.
    #[error("stage '{stage}' failed on shard '{shard}': {source}")]
    Stage {
        stage: &'static str,
        shard: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Wrap an error with stage and shard context.
    pub fn in_stage(self, stage: &'static str, shard: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            shard: shard.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait to attach stage context to any fallible stage operation.
pub trait StageContext<T> {
    fn stage(self, stage: &'static str, shard: impl Into<String>) -> Result<T>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: &'static str, shard: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.in_stage(stage, shard))
    }
}
