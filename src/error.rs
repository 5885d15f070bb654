use std::path::PathBuf;

/// Failure categories surfaced by the geotag pipeline.
///
/// Soft failures (`LocationUnavailable`, `NetworkFetchFailure`,
/// `MetadataWriteFailure`) degrade the output and are reported as warnings on
/// a successful [`RunOutcome`](crate::pipeline::RunOutcome). Hard failures
/// abort the run before anything is written.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("map fetch failed: {0}")]
    NetworkFetchFailure(String),

    #[error("source image unreadable ({path}): {reason}")]
    SourceImageUnreadable { path: PathBuf, reason: String },

    #[error("metadata write failed: {0}")]
    MetadataWriteFailure(String),

    #[error("storage unavailable ({path}): {reason}")]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("a capture is already being processed")]
    RunInFlight,

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Hard failures short-circuit the run; soft ones only degrade the output.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_)
                | Self::SourceImageUnreadable { .. }
                | Self::StorageUnavailable { .. }
                | Self::RunInFlight
                | Self::Cancelled
        )
    }
}
