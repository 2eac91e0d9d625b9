use thiserror::Error;

/// Errors surfaced by collaborators and adapters.
///
/// The decision core never propagates these as fatal: detector and order
/// manager paths log them and degrade. They exist so adapters can report
/// what went wrong with enough detail to log.
#[derive(Debug, Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("exchange rejected request ({code}): {message}")]
    Exchange { code: i64, message: String },

    #[error("rate limited by {0}")]
    RateLimited(String),

    #[error("order manager is no longer running")]
    ManagerClosed,

    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(e: std::num::ParseFloatError) -> Self {
        Self::Other(format!("invalid number: {}", e))
    }
}
