use sea_query::{PostgresQueryBuilder, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{postgres::PgRow, sqlite::SqliteRow, FromRow, PgConnection, SqliteConnection};

use super::pool::{Backend, Capabilities};
use crate::errors::Result;

// Borrowed connection that queries are run against, whether it came from a transaction or
// straight from the pool. Statements are built for the matching dialect at execution time.
pub(crate) enum Executor<'c> {
    Postgres(&'c mut PgConnection),
    Sqlite(&'c mut SqliteConnection),
}

impl Executor<'_> {
    pub(crate) fn capabilities(&self) -> Capabilities {
        match self {
            Executor::Postgres(_) => Backend::Postgres.capabilities(),
            Executor::Sqlite(_) => Backend::Sqlite.capabilities(),
        }
    }

    pub(crate) async fn fetch_optional<T, S>(&mut self, stmt: &S) -> Result<Option<T>>
    where
        S: SqlxBinder + Sync,
        T: for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        match self {
            Executor::Postgres(conn) => {
                let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
                Ok(sqlx::query_as_with::<_, T, _>(&sql, values)
                    .fetch_optional(&mut **conn)
                    .await?)
            }
            Executor::Sqlite(conn) => {
                let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
                Ok(sqlx::query_as_with::<_, T, _>(&sql, values)
                    .fetch_optional(&mut **conn)
                    .await?)
            }
        }
    }

    pub(crate) async fn fetch_all<T, S>(&mut self, stmt: &S) -> Result<Vec<T>>
    where
        S: SqlxBinder + Sync,
        T: for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        match self {
            Executor::Postgres(conn) => {
                let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
                Ok(sqlx::query_as_with::<_, T, _>(&sql, values)
                    .fetch_all(&mut **conn)
                    .await?)
            }
            Executor::Sqlite(conn) => {
                let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
                Ok(sqlx::query_as_with::<_, T, _>(&sql, values)
                    .fetch_all(&mut **conn)
                    .await?)
            }
        }
    }

    /// Fetch the first column of at most one row.
    pub(crate) async fn fetch_scalar<V, S>(&mut self, stmt: &S) -> Result<Option<V>>
    where
        S: SqlxBinder + Sync,
        (V,): for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow>,
        V: Send + Unpin,
    {
        match self {
            Executor::Postgres(conn) => {
                let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
                Ok(sqlx::query_scalar_with::<_, V, _>(&sql, values)
                    .fetch_optional(&mut **conn)
                    .await?)
            }
            Executor::Sqlite(conn) => {
                let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
                Ok(sqlx::query_scalar_with::<_, V, _>(&sql, values)
                    .fetch_optional(&mut **conn)
                    .await?)
            }
        }
    }

    /// Fetch the first column of every row.
    pub(crate) async fn fetch_scalars<V, S>(&mut self, stmt: &S) -> Result<Vec<V>>
    where
        S: SqlxBinder + Sync,
        (V,): for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow>,
        V: Send + Unpin,
    {
        match self {
            Executor::Postgres(conn) => {
                let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
                Ok(sqlx::query_scalar_with::<_, V, _>(&sql, values)
                    .fetch_all(&mut **conn)
                    .await?)
            }
            Executor::Sqlite(conn) => {
                let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
                Ok(sqlx::query_scalar_with::<_, V, _>(&sql, values)
                    .fetch_all(&mut **conn)
                    .await?)
            }
        }
    }

    /// Run a statement and return the number of rows it affected.
    pub(crate) async fn execute<S>(&mut self, stmt: &S) -> Result<u64>
    where
        S: SqlxBinder + Sync,
    {
        match self {
            Executor::Postgres(conn) => {
                let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
                Ok(sqlx::query_with(&sql, values)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected())
            }
            Executor::Sqlite(conn) => {
                let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
                Ok(sqlx::query_with(&sql, values)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected())
            }
        }
    }
}
