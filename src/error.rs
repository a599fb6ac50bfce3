use thiserror::Error;

#[derive(Error, Debug)]
pub enum TirelireError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Non authentifié")]
    Unauthenticated,

    #[error("Identifiants invalides")]
    InvalidCredentials,

    #[error("CSRF token invalid or missing")]
    Csrf,

    #[error("Accès refusé")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Refused without an HTTP error status, e.g. a duplicate name.
    #[error("{0}")]
    Duplicate(String),

    #[error("{0}")]
    Gone(String),

    #[error("Fichier trop volumineux")]
    PayloadTooLarge,

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("Fonds insuffisants sur cet objectif")]
    InsufficientFunds { available: f64 },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TirelireError>;

pub(crate) fn invalid(msg: impl Into<String>) -> TirelireError {
    TirelireError::Validation(msg.into())
}
