/// Core error type for the bot.
///
/// Adapter crates map their transport errors into this type so the core can
/// tell platform refusals (status codes) apart from local failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("platform error ({status}): {message}")]
    Platform { status: u16, message: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True when the platform refused the call for lack of permissions.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Platform { status: 403, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
