use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::identifier::normalize_table_name;
use crate::model::Sample;

use super::Sink;

/// Single SQLite database file, one table per configured `table_name`.
/// Tables are created lazily on first write.
pub struct EmbeddedSqlSink {
    pool: SqlitePool,
    known_tables: Mutex<std::collections::HashSet<String>>,
}

impl EmbeddedSqlSink {
    pub async fn connect(database_path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            known_tables: Mutex::new(std::collections::HashSet::new()),
        })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("connect in-memory sqlite");
        Self {
            pool,
            known_tables: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Rejects anything that isn't already its own normalized form. This
    /// only guards the shape of the identifier going into SQL; the
    /// whitelist-against-known-tables check happens upstream in the query
    /// engine, before a client-supplied table name ever reaches a sink.
    fn safe_table(table: &str) -> Result<&str, SinkError> {
        if table != normalize_table_name(table) {
            return Err(SinkError::UnknownTable(table.to_string()));
        }
        Ok(table)
    }

    async fn ensure_table(&self, table: &str) -> Result<(), SinkError> {
        let table = Self::safe_table(table)?;
        {
            let known = self.known_tables.lock().await;
            if known.contains(table) {
                return Ok(());
            }
        }

        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ( \
                timestamp TEXT PRIMARY KEY, \
                body TEXT NOT NULL, \
                cpu_pct REAL, \
                ram_pct REAL, \
                disk_pct REAL \
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|source| SinkError::Database {
                sink: "embedded_sql",
                source,
            })?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_timestamp\" ON \"{table}\" (timestamp DESC)"
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|source| SinkError::Database {
                sink: "embedded_sql",
                source,
            })?;

        self.known_tables.lock().await.insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl Sink for EmbeddedSqlSink {
    fn name(&self) -> &'static str {
        "embedded_sql"
    }

    async fn initialize(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|source| SinkError::Database {
                sink: "embedded_sql",
                source,
            })
    }

    async fn write(&self, table: &str, sample: &Sample) -> Result<(), SinkError> {
        self.ensure_table(table).await?;
        let table = Self::safe_table(table)?;

        let body = serde_json::to_string(sample).map_err(|err| SinkError::Database {
            sink: "embedded_sql",
            source: sqlx::Error::Protocol(err.to_string()),
        })?;

        let insert = format!(
            "INSERT INTO \"{table}\" (timestamp, body, cpu_pct, ram_pct, disk_pct) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(timestamp) DO NOTHING"
        );
        let disk_pct = sample.disks.first().map(|d| d.used_pct).unwrap_or(0.0);
        sqlx::query(&insert)
            .bind(sample.timestamp.to_rfc3339())
            .bind(body)
            .bind(sample.cpu.usage_percent)
            .bind(sample.ram.used_pct)
            .bind(disk_pct)
            .execute(&self.pool)
            .await
            .map_err(|source| SinkError::Database {
                sink: "embedded_sql",
                source,
            })?;
        Ok(())
    }

    async fn query(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SinkError> {
        let table = Self::safe_table(table)?;
        let select = format!(
            "SELECT body FROM \"{table}\" WHERE timestamp >= ? AND timestamp <= ? ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&select)
            .bind(from.to_rfc3339())
            .bind(to.to_rfc3339())
            .fetch_all(&self.pool)
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("no such table") => {
                return Ok(Vec::new())
            }
            Err(source) => {
                return Err(SinkError::Database {
                    sink: "embedded_sql",
                    source,
                })
            }
        };

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body").map_err(|source| SinkError::Database {
                sink: "embedded_sql",
                source,
            })?;
            if let Ok(sample) = serde_json::from_str::<Sample>(&body) {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    async fn list_tables(&self) -> Result<Vec<String>, SinkError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|source| SinkError::Database {
            sink: "embedded_sql",
            source,
        })?;

        let mut tables: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        tables.sort();
        Ok(tables)
    }
}
