use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Application error taxonomy. Test failures are not errors; they are
/// recorded as verdict outcomes. Only `Config` and fatal store problems
/// propagate to process exit.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("database unreachable: {0}")]
    StoreUnavailable(String),

    #[error("invalid proxy candidate {input:?}: {reason}")]
    Parse { input: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for errors that escape `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::StoreUnavailable(_) => 3,
            _ => 1,
        }
    }
}
