use thiserror::Error;

/// Errors raised by the PostgreSQL-backed stores.
/// sqlx errors are wrapped together with the statement that produced them.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0}")]
    Unavailable(String),
}

impl DatabaseError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}
