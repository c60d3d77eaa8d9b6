//! PostgreSQL backend on `sqlx`.
//!
//! The engine is synchronous, so each connection owns a current-thread tokio
//! runtime and blocks on every round trip. Enable with `--features postgres`.

use super::{Connection, ConnectionProvider, DatabaseKind, LockKey, Row, Value};
use crate::error::DbError;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Postgres, Row as _, TypeInfo};
use tokio::runtime::Runtime;

/// A PostgreSQL connection.
pub struct PostgresConnection {
    conn: PgConnection,
    rt: Runtime,
}

impl PostgresConnection {
    /// Connect to `database_url`.
    pub fn connect(database_url: &str) -> Result<Self, DbError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let conn = rt.block_on(PgConnection::connect(database_url))?;
        Ok(Self { conn, rt })
    }

    /// Close the connection gracefully.
    pub fn close(self) -> Result<(), DbError> {
        let Self { conn, rt } = self;
        rt.block_on(conn.close())?;
        Ok(())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut columns = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)?
                .map(|v| Value::Integer(v.into())),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)?
                .map(|v| Value::Integer(v.into())),
            "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::Integer),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map(|v| Value::Real(v.into())),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(Value::Real),
            _ => row.try_get::<Option<String>, _>(i)?.map(Value::Text),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row::new(columns, values))
}

impl Connection for PostgresConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::PostgreSql
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let query = bind_all(sqlx::query(sql), params);
        let rows = self.rt.block_on(query.fetch_all(&mut self.conn))?;
        rows.iter().map(decode_row).collect()
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.rt.block_on(sqlx::raw_sql(sql).execute(&mut self.conn))?;
        Ok(())
    }

    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let query = bind_all(sqlx::query(sql), params);
        let result = self.rt.block_on(query.execute(&mut self.conn))?;
        Ok(result.rows_affected())
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.execute("BEGIN")
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK")
    }

    fn try_acquire_lock(&mut self, key: &LockKey) -> Result<bool, DbError> {
        let rows = self.query(
            "SELECT pg_try_advisory_lock($1) AS acquired",
            &[Value::Integer(key.advisory_key())],
        )?;
        match rows.first() {
            Some(row) => row.get_bool("acquired"),
            None => Ok(false),
        }
    }

    fn release_lock(&mut self, key: &LockKey) -> Result<(), DbError> {
        self.query(
            "SELECT pg_advisory_unlock($1) AS released",
            &[Value::Integer(key.advisory_key())],
        )?;
        Ok(())
    }
}

/// Opens PostgreSQL connections to one URL.
#[derive(Debug, Clone)]
pub struct PostgresProvider {
    database_url: String,
}

impl PostgresProvider {
    /// Provider for `database_url`.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Provider from the `DATABASE_URL` environment variable.
    pub fn from_env() -> Result<Self, DbError> {
        std::env::var("DATABASE_URL")
            .map(Self::new)
            .map_err(|_| DbError::UnsupportedUrl("DATABASE_URL is not set".to_string()))
    }
}

impl ConnectionProvider for PostgresProvider {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::PostgreSql
    }

    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        Ok(Box::new(PostgresConnection::connect(&self.database_url)?))
    }
}
