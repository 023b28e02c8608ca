use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to create run directory {path}: {source}")]
    CreateDirError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to open transcript file {path}: {source}")]
    OpenError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write transcript: {0}")]
    WriteError(std::io::Error),
    #[error("Failed to serialize transcript entry: {0}")]
    SerializeError(#[from] serde_json::Error),
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::WriteError(error)
    }
}
