use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, RwLock};

use crate::error::SinkError;
use crate::identifier::normalize_table_name;
use crate::model::Sample;

use super::Sink;

/// Relational sink over Postgres. Probes for the TimescaleDB extension at
/// `initialize()` and, when present, converts each table into a hypertable
/// with a one-day chunk interval so the query engine can request equal-width
/// time buckets.
pub struct RelationalSink {
    pool: PgPool,
    timescale: RwLock<bool>,
    known_tables: Mutex<std::collections::HashSet<String>>,
}

impl RelationalSink {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            timescale: RwLock::new(false),
            known_tables: Mutex::new(std::collections::HashSet::new()),
        })
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

    async fn probe_timescaledb(&self) -> bool {
        sqlx::query("SELECT 1 FROM pg_extension WHERE extname = 'timescaledb'")
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .is_some()
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
                timestamp TIMESTAMPTZ NOT NULL, \
                body JSONB NOT NULL, \
                cpu_pct DOUBLE PRECISION, \
                ram_pct DOUBLE PRECISION, \
                disk_pct DOUBLE PRECISION, \
                PRIMARY KEY (timestamp) \
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|source| SinkError::Database {
                sink: "relational",
                source,
            })?;

        if *self.timescale.read().await {
            let hypertable = format!(
                "SELECT create_hypertable('{table}', 'timestamp', \
                 chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE)"
            );
            // Hypertable conversion fails harmlessly on a table that already
            // has data incompatible with chunking; degrade to a plain table.
            let _ = sqlx::query(&hypertable).execute(&self.pool).await;
        } else {
            let index = format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{table}_timestamp\" ON \"{table}\" (timestamp DESC)"
            );
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .map_err(|source| SinkError::Database {
                    sink: "relational",
                    source,
                })?;
        }

        self.known_tables.lock().await.insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl Sink for RelationalSink {
    fn name(&self) -> &'static str {
        "relational"
    }

    fn supports_bucketing(&self) -> bool {
        // Read without blocking: defaults to false until `initialize()` has
        // run the probe. `try_read` never panics since nothing ever holds
        // the write lock across an await point outside `initialize()`.
        self.timescale.try_read().map(|v| *v).unwrap_or(false)
    }

    async fn initialize(&self) -> Result<(), SinkError> {
        let has_timescale = self.probe_timescaledb().await;
        *self.timescale.write().await = has_timescale;
        Ok(())
    }

    async fn write(&self, table: &str, sample: &Sample) -> Result<(), SinkError> {
        self.ensure_table(table).await?;
        let table = Self::safe_table(table)?;

        let body = serde_json::to_value(sample).map_err(|err| SinkError::Database {
            sink: "relational",
            source: sqlx::Error::Protocol(err.to_string()),
        })?;

        let insert = format!(
            "INSERT INTO \"{table}\" (timestamp, body, cpu_pct, ram_pct, disk_pct) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (timestamp) DO NOTHING"
        );
        let disk_pct = sample.disks.first().map(|d| d.used_pct).unwrap_or(0.0);
        sqlx::query(&insert)
            .bind(sample.timestamp)
            .bind(body)
            .bind(sample.cpu.usage_percent)
            .bind(sample.ram.used_pct)
            .bind(disk_pct)
            .execute(&self.pool)
            .await
            .map_err(|source| SinkError::Database {
                sink: "relational",
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
            "SELECT body FROM \"{table}\" WHERE timestamp >= $1 AND timestamp <= $2 ORDER BY timestamp ASC"
        );
        let rows = sqlx::query(&select)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("does not exist") => {
                return Ok(Vec::new())
            }
            Err(source) => {
                return Err(SinkError::Database {
                    sink: "relational",
                    source,
                })
            }
        };

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let body: serde_json::Value =
                row.try_get("body").map_err(|source| SinkError::Database {
                    sink: "relational",
                    source,
                })?;
            if let Ok(sample) = serde_json::from_value::<Sample>(body) {
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    async fn list_tables(&self) -> Result<Vec<String>, SinkError> {
        let rows = sqlx::query(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|source| SinkError::Database {
            sink: "relational",
            source,
        })?;

        let mut tables: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("tablename").ok())
            .collect();
        tables.sort();
        Ok(tables)
    }
}
