//! Pipeline error model.
//!
//! Only failures that must abort the run are errors here. A script's
//! non-zero exit is a value recorded on its task row, never a variant of
//! [`PipelineError`].

use millrace_state::StateError;

/// Categorized fatal pipeline error.
#[derive(Debug)]
pub enum PipelineError {
    /// Unusable manifest: parse failure, missing or duplicate start step,
    /// and similar. Fatal at run entry.
    Config(String),
    /// Metadata or object store failure. Fatal.
    Storage(StateError),
    /// Output mount could not be set up or torn down. Fatal at step entry.
    Mount(anyhow::Error),
    /// Host-side wiring failure: panicked worker, broken channel.
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Mount(e) => write!(f, "mount error: {e}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        Self::Storage(e)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Infrastructure(anyhow::anyhow!("worker task panicked: {e}"))
    }
}
