//! Dataset seeding
//!
//! Both variants receive the same logical rows. Row `i` is generated from
//! its index alone, and the timestamp is computed client-side so neither
//! dialect's date arithmetic is involved:
//!
//! | column       | value                          |
//! |--------------|--------------------------------|
//! | `name`       | `item{i}`                      |
//! | `value`      | `i * 1.5`                      |
//! | `created_at` | `2023-01-01 00:00:00 + i hours` |
//!
//! Only the DDL and the timestamp literal syntax differ between dialects.

use crate::environment::BackendEnvironment;
use crate::{Error, Result, Variant};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::time::{Duration, Instant};
use tracing::debug;

/// Table created and populated in both environments
pub const TABLE_NAME: &str = "test_table";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One generated row
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRow {
    /// `item{i}`
    pub name: String,
    /// `i * 1.5`
    pub value: f64,
    /// Base time plus `i` hours
    pub created_at: NaiveDateTime,
}

impl SeedRow {
    /// Deterministically generate row `index`
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    pub fn generate(index: usize) -> Self {
        Self {
            name: format!("item{index}"),
            value: index as f64 * 1.5,
            created_at: base_time() + ChronoDuration::hours(index as i64),
        }
    }

    /// Render as a VALUES tuple for the given dialect
    #[must_use]
    pub fn to_sql_tuple(&self, variant: Variant) -> String {
        let ts = self.created_at.format(TIMESTAMP_FORMAT);
        match variant {
            Variant::Postgres => format!("('{}', {}, TIMESTAMP '{ts}')", self.name, self.value),
            Variant::MariaDb => format!("('{}', {}, '{ts}')", self.name, self.value),
        }
    }
}

/// Timestamp of row 0
#[must_use]
pub fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Outcome of a completed seed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    /// Rows inserted
    pub rows: usize,
    /// INSERT statements executed
    pub batches: usize,
    /// Wall-clock time for the whole load
    pub elapsed: Duration,
}

/// Drops, recreates, and bulk-loads the comparison table
#[derive(Debug, Clone, Copy)]
pub struct DatasetSeeder {
    batch_size: usize,
}

impl Default for DatasetSeeder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BATCH_SIZE)
    }
}

impl DatasetSeeder {
    /// Create a seeder inserting `batch_size` rows per statement (minimum 1)
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Rows per INSERT statement
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// DROP and CREATE statements for a dialect
    #[must_use]
    pub fn schema_statements(variant: Variant) -> [String; 2] {
        let drop = format!("DROP TABLE IF EXISTS {TABLE_NAME}");
        let create = match variant {
            Variant::Postgres => format!(
                "CREATE TABLE {TABLE_NAME} (\
                 id SERIAL PRIMARY KEY, \
                 name VARCHAR(50), \
                 value NUMERIC(10,2), \
                 created_at TIMESTAMP)"
            ),
            Variant::MariaDb => format!(
                "CREATE TABLE {TABLE_NAME} (\
                 id INT AUTO_INCREMENT PRIMARY KEY, \
                 name VARCHAR(50), \
                 value DECIMAL(10,2), \
                 created_at DATETIME)"
            ),
        };
        [drop, create]
    }

    /// Batched INSERT statements covering rows `0..row_count`
    pub fn insert_statements(
        &self,
        variant: Variant,
        row_count: usize,
    ) -> impl Iterator<Item = String> + '_ {
        (0..row_count).step_by(self.batch_size).map(move |start| {
            let end = (start + self.batch_size).min(row_count);
            let values: Vec<String> = (start..end)
                .map(|i| SeedRow::generate(i).to_sql_tuple(variant))
                .collect();
            format!(
                "INSERT INTO {TABLE_NAME} (name, value, created_at) VALUES {}",
                values.join(",")
            )
        })
    }

    /// Recreate the table and insert `row_count` rows into `environment`.
    ///
    /// Batches already inserted are not rolled back on failure; reseeding
    /// starts over from DROP TABLE.
    ///
    /// # Errors
    ///
    /// Returns `Error::Seeding` if connecting or any statement fails
    pub async fn seed(&self, environment: &BackendEnvironment, row_count: usize) -> Result<SeedReport> {
        let variant = environment.variant();
        let seeding = |e: Error| Error::Seeding {
            variant,
            reason: e.to_string(),
        };
        let started = Instant::now();

        let mut conn = environment
            .driver()
            .connect(environment.descriptor())
            .await
            .map_err(seeding)?;

        let outcome = async {
            for statement in Self::schema_statements(variant) {
                conn.execute(&statement).await?;
            }
            let mut batches = 0;
            for statement in self.insert_statements(variant, row_count) {
                conn.execute(&statement).await?;
                batches += 1;
                debug!(%variant, batch = batches, "inserted batch");
            }
            Ok::<usize, Error>(batches)
        }
        .await;

        conn.close().await;
        let batches = outcome.map_err(seeding)?;

        Ok(SeedReport {
            rows: row_count,
            batches,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_row() {
        let row = SeedRow::generate(25);
        assert_eq!(row.name, "item25");
        assert!((row.value - 37.5).abs() < f64::EPSILON);
        assert_eq!(row.created_at.format(TIMESTAMP_FORMAT).to_string(), "2023-01-02 01:00:00");
    }

    #[test]
    fn test_tuple_dialects() {
        let row = SeedRow::generate(1);
        assert_eq!(
            row.to_sql_tuple(Variant::Postgres),
            "('item1', 1.5, TIMESTAMP '2023-01-01 01:00:00')"
        );
        assert_eq!(row.to_sql_tuple(Variant::MariaDb), "('item1', 1.5, '2023-01-01 01:00:00')");
    }

    #[test]
    fn test_insert_statement_batching() {
        let seeder = DatasetSeeder::new(1000);
        let statements: Vec<String> = seeder.insert_statements(Variant::Postgres, 2500).collect();

        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].matches("'item").count(), 1000);
        assert_eq!(statements[2].matches("'item").count(), 500);
        assert!(statements[2].contains("'item2499'"));
    }

    #[test]
    fn test_insert_statements_empty() {
        let seeder = DatasetSeeder::default();
        assert_eq!(seeder.insert_statements(Variant::MariaDb, 0).count(), 0);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        assert_eq!(DatasetSeeder::new(0).batch_size(), 1);
    }

    #[test]
    fn test_schema_statements_differ_only_in_ddl() {
        let [pg_drop, pg_create] = DatasetSeeder::schema_statements(Variant::Postgres);
        let [my_drop, my_create] = DatasetSeeder::schema_statements(Variant::MariaDb);
        assert_eq!(pg_drop, my_drop);
        assert!(pg_create.contains("SERIAL"));
        assert!(my_create.contains("AUTO_INCREMENT"));
    }
}
