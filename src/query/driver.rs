//! SQL driver seam
//!
//! The two wire protocols sit behind `SqlDriver`/`SqlConnection`, so the
//! dispatcher, seeder and readiness probe never name a concrete client.
//! `SqlxDriver` is the production implementation for both variants.

use super::SqlValue;
use crate::environment::ConnectionDescriptor;
use crate::{Error, Result, Variant};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Column, ColumnIndex, Connection, Decode, Executor, Row, Statement, Type, TypeInfo};
use std::time::Duration;

/// Column names plus rows returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRows {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Rows, each with one value per column
    pub rows: Vec<Vec<SqlValue>>,
}

/// One open connection to an environment
#[async_trait]
pub trait SqlConnection: Send {
    /// Execute a statement, returning affected rows
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query and fetch every row
    async fn fetch(&mut self, sql: &str) -> Result<FetchedRows>;

    /// Close the connection, ignoring errors
    async fn close(self: Box<Self>);
}

/// Opens connections to environments
#[async_trait]
pub trait SqlDriver: Send + Sync {
    /// Open a fresh connection
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn SqlConnection>>;

    /// Readiness probe: connect and run `SELECT 1`
    async fn ping(&self, target: &ConnectionDescriptor) -> Result<()> {
        let mut conn = self.connect(target).await?;
        let probe = conn.fetch("SELECT 1").await;
        conn.close().await;
        probe.map(drop)
    }
}

/// sqlx-backed driver for PostgreSQL and MariaDB
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    connect_timeout: Duration,
}

impl Default for SqlxDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl SqlxDriver {
    /// Create a driver that gives up connecting after `connect_timeout`
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SqlDriver for SqlxDriver {
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn SqlConnection>> {
        tokio::time::timeout(self.connect_timeout, open(target))
            .await
            .map_err(|_| {
                Error::Driver(format!(
                    "connect to {}:{} timed out after {:?}",
                    target.host, target.port, self.connect_timeout
                ))
            })?
    }
}

async fn open(target: &ConnectionDescriptor) -> Result<Box<dyn SqlConnection>> {
    match target.variant {
        Variant::Postgres => {
            let options = PgConnectOptions::new()
                .host(&target.host)
                .port(target.port)
                .database(&target.database)
                .username(&target.user)
                .password(&target.password);
            let conn = PgConnection::connect_with(&options).await?;
            Ok(Box::new(PgSession { conn }))
        }
        Variant::MariaDb => {
            let options = MySqlConnectOptions::new()
                .host(&target.host)
                .port(target.port)
                .database(&target.database)
                .username(&target.user)
                .password(&target.password);
            let conn = MySqlConnection::connect_with(&options).await?;
            Ok(Box::new(MySqlSession { conn }))
        }
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl SqlConnection for PgSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(done.rows_affected())
    }

    async fn fetch(&mut self, sql: &str) -> Result<FetchedRows> {
        let statement = (&mut self.conn).prepare(sql).await?;
        let columns = statement.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = statement
            .query()
            .fetch_all(&mut self.conn)
            .await?
            .iter()
            .map(|row| (0..row.len()).map(|i| decode_pg(row, i)).collect())
            .collect();
        Ok(FetchedRows { columns, rows })
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.close().await;
    }
}

struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl SqlConnection for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(done.rows_affected())
    }

    async fn fetch(&mut self, sql: &str) -> Result<FetchedRows> {
        let statement = (&mut self.conn).prepare(sql).await?;
        let columns = statement.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = statement
            .query()
            .fetch_all(&mut self.conn)
            .await?
            .iter()
            .map(|row| (0..row.len()).map(|i| decode_mysql(row, i)).collect())
            .collect();
        Ok(FetchedRows { columns, rows })
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.close().await;
    }
}

/// Decode one cell as `T`, mapping SQL NULL to `SqlValue::Null`
fn cell<'r, R, T>(row: &'r R, index: usize, wrap: impl FnOnce(T) -> SqlValue) -> SqlValue
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, _>(index) {
        Ok(Some(value)) => wrap(value),
        Ok(None) => SqlValue::Null,
        Err(err) => SqlValue::Text(format!("<undecodable: {err}>")),
    }
}

fn decode_pg(row: &sqlx::postgres::PgRow, index: usize) -> SqlValue {
    let type_name = row.column(index).type_info().name().to_ascii_uppercase();
    match type_name.as_str() {
        "BOOL" => cell(row, index, SqlValue::Bool),
        "INT2" => cell(row, index, |v: i16| SqlValue::Int(i64::from(v))),
        "INT4" => cell(row, index, |v: i32| SqlValue::Int(i64::from(v))),
        "INT8" => cell(row, index, SqlValue::Int),
        "FLOAT4" => cell(row, index, |v: f32| SqlValue::Float(f64::from(v))),
        "FLOAT8" => cell(row, index, SqlValue::Float),
        "NUMERIC" => cell(row, index, SqlValue::Decimal),
        "TIMESTAMP" => cell(row, index, SqlValue::Timestamp),
        "TIMESTAMPTZ" => cell(row, index, |v: DateTime<Utc>| SqlValue::Timestamp(v.naive_utc())),
        "DATE" => cell(row, index, SqlValue::Date),
        _ => cell(row, index, SqlValue::Text),
    }
}

fn decode_mysql(row: &sqlx::mysql::MySqlRow, index: usize) -> SqlValue {
    let type_name = row.column(index).type_info().name().to_ascii_uppercase();
    match type_name.as_str() {
        "BOOLEAN" => cell(row, index, SqlValue::Bool),
        "TINYINT" => cell(row, index, |v: i8| SqlValue::Int(i64::from(v))),
        "SMALLINT" => cell(row, index, |v: i16| SqlValue::Int(i64::from(v))),
        "INT" | "MEDIUMINT" => cell(row, index, |v: i32| SqlValue::Int(i64::from(v))),
        "BIGINT" => cell(row, index, SqlValue::Int),
        "TINYINT UNSIGNED" => cell(row, index, |v: u8| SqlValue::Int(i64::from(v))),
        "SMALLINT UNSIGNED" => cell(row, index, |v: u16| SqlValue::Int(i64::from(v))),
        "INT UNSIGNED" | "MEDIUMINT UNSIGNED" => cell(row, index, |v: u32| SqlValue::Int(i64::from(v))),
        "BIGINT UNSIGNED" => cell(row, index, SqlValue::UInt),
        "FLOAT" => cell(row, index, |v: f32| SqlValue::Float(f64::from(v))),
        "DOUBLE" => cell(row, index, SqlValue::Float),
        "DECIMAL" => cell(row, index, |v: Decimal| SqlValue::Decimal(v)),
        "DATETIME" => cell(row, index, |v: NaiveDateTime| SqlValue::Timestamp(v)),
        "TIMESTAMP" => cell(row, index, |v: DateTime<Utc>| SqlValue::Timestamp(v.naive_utc())),
        "DATE" => cell(row, index, |v: NaiveDate| SqlValue::Date(v)),
        _ => cell(row, index, SqlValue::Text),
    }
}
