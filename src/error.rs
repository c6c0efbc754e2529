/// Infrastructure-level errors
///
/// Library errors are wrapped as-is; the helpers add no retries or extra context.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Search API returned status {status}: {body}")]
    SearchApi { status: u16, body: String },

    #[error("No connection registered under alias '{0}'")]
    ConnectionNotFound(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("No live search nodes available")]
    NoLiveNodes,
}

pub type AppResult<T> = Result<T, AppError>;
