use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not a participant of this conversation")]
    Authorization,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("operation not allowed in current state: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to start server: {0}")]
    StartServer(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event bus error: {0}")]
    Bus(String),
}

impl AppError {
    /// Stable machine-readable tag used in error frames sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Authorization => "authorization",
            AppError::NotFound(_) => "not_found",
            AppError::State(_) => "state",
            AppError::Config(_) => "config",
            AppError::StartServer(_) => "start_server",
            AppError::Database(_) => "database",
            AppError::Bus(_) => "bus",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(sqlx::Error::PoolTimedOut)
                | AppError::Database(sqlx::Error::PoolClosed)
                | AppError::Database(sqlx::Error::Io(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AppError::Validation("x".into()).kind(), "validation");
        assert_eq!(AppError::Authorization.kind(), "authorization");
        assert_eq!(AppError::NotFound("message").kind(), "not_found");
        assert_eq!(AppError::State("already ended".into()).kind(), "state");
    }

    #[test]
    fn pool_timeouts_are_retryable() {
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!AppError::Validation("empty".into()).is_retryable());
        assert!(!AppError::Authorization.is_retryable());
    }

    #[test]
    fn not_found_names_the_resource() {
        let err = AppError::NotFound("conversation");
        assert_eq!(err.to_string(), "conversation not found");
    }
}
