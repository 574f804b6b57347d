use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::DatabaseError;

/// Open the connection pool shared by the staging reader, reference lookup, writer and run store.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, DatabaseError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|error| DatabaseError::ConnectionError { error })
}
