use quire_collab::{StoreError, SyncError};

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("server: {0}")]
    Server(#[from] SyncError),

    #[error("content is not valid JSON: {0}")]
    InvalidContent(String),

    #[error("output: {0}")]
    Output(#[from] serde_json::Error),
}
