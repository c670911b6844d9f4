use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TilerError {
    /// Malformed, truncated or unreadable input. Aborts only the affected job.
    #[error("failed to read '{source_name}': {reason}")]
    Read { source_name: String, reason: String },

    /// Unknown or uninitialisable reference system. Fatal for the job.
    #[error("cannot reproject from EPSG:{srid}: {reason}")]
    Projection { srid: u32, reason: String },

    /// Degenerate geometry while building a node. Absorbed by the builder.
    #[error("octree build problem at depth {depth}: {reason}")]
    Build { depth: u32, reason: String },

    /// I/O failure while writing a payload or the manifest. Fatal for the job.
    #[error("failed to write '{}'", path.display())]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shared cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl TilerError {
    pub fn read(source_name: impl Into<String>, reason: impl ToString) -> Self {
        TilerError::Read {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn projection(srid: u32, reason: impl ToString) -> Self {
        TilerError::Projection {
            srid,
            reason: reason.to_string(),
        }
    }

    pub fn export(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TilerError::Export {
            path: path.into(),
            source,
        }
    }

    /// Cancellation is an early stop, not a failure of the job itself.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TilerError::Cancelled)
    }
}

pub type Result<T, E = TilerError> = std::result::Result<T, E>;
