mod source;
mod importer;
mod factory;

pub use source::{PostgresConnection, PostgresSource, PostgresSourceConfig};
pub use importer::{CopyImporter, ImportIntoImporter};
pub use factory::PostgresSourceFactory;

use datamove_core::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a pool on the target database for the importers.
pub async fn connect_target(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| Error::Connection(format!("Failed to connect to target: {}", e)))
}

/// Escape `value` as a SQL string literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn db_error(context: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Error::Connection(format!("{}: {}", context, err))
        }
        other => Error::Export(format!("{}: {}", context, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_db_error_classification() {
        assert!(matches!(db_error("connect", sqlx::Error::PoolTimedOut), Error::Connection(_)));
        assert!(matches!(db_error("query", sqlx::Error::RowNotFound), Error::Export(_)));
    }
}
