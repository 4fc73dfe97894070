//! Error type shared by the library modules.

/// Errors raised while generating data, fitting models, or scoring fits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("data does not match the model contract: {0}")]
    DataContract(String),

    #[error("invalid initial values: {0}")]
    InvalidInit(String),

    #[error("leave-one-out failed: {0}")]
    Loo(String),

    #[error("fits are not comparable: {0}")]
    IncompatibleComparison(String),

    #[error("fit engine failed: {0}")]
    Engine(String),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // keep the whole context chain
        Error::Engine(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
