//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix milliseconds. Column values live in one
//! table per scalar type (`timeseries_float`, `timeseries_int`,
//! `timeseries_str`), one row per value keyed by `(column_id, position)`.
//! Get-or-create operations are `INSERT … ON CONFLICT DO NOTHING` followed
//! by a `SELECT` on the natural key, so concurrent creators converge on the
//! same row.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use cycler_harvest_core::models::{
    Column, ColumnAppend, ColumnType, DataLabel, DataType, DataUnit, HarvestError, Harvester,
    MonitoredPath, NewColumnType, NewHarvestError, NewMonitoredPath, NewObservedFile,
    ObservedFile, TimeseriesValues,
};
use cycler_harvest_core::store::Store;

/// Values bound per multi-row insert; three binds per row stays under SQLite's limit.
const INSERT_BATCH_ROWS: usize = 300;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn value_table(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Float => "timeseries_float",
        DataType::Int => "timeseries_int",
        DataType::Str => "timeseries_str",
    }
}

fn harvester_from_row(row: &SqliteRow) -> Result<Harvester> {
    Ok(Harvester {
        id: row.get("id"),
        name: row.get("name"),
        api_key: row.get("api_key"),
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn path_from_row(row: &SqliteRow) -> MonitoredPath {
    let stable_time: i64 = row.get("stable_time");
    MonitoredPath {
        id: row.get("id"),
        harvester_id: row.get("harvester_id"),
        path: row.get("path"),
        pattern: row.get("pattern"),
        stable_time: stable_time.max(0) as u64,
        active: row.get("active"),
    }
}

const FILE_COLUMNS: &str = "id, harvester_id, path, last_observed_size, last_observed_time, state, \
     inferred_format, parser, name, num_rows, first_sample_no, last_sample_no, test_date, extra_metadata";

fn file_from_row(row: &SqliteRow) -> Result<ObservedFile> {
    let size: i64 = row.get("last_observed_size");
    let state: String = row.get("state");
    let test_date: Option<i64> = row.get("test_date");
    let extra: String = row.get("extra_metadata");
    Ok(ObservedFile {
        id: row.get("id"),
        harvester_id: row.get("harvester_id"),
        path: row.get("path"),
        last_observed_size: size.max(0) as u64,
        last_observed_time: from_millis(row.get("last_observed_time"))?,
        state: state.parse()?,
        inferred_format: row.get("inferred_format"),
        parser: row.get("parser"),
        name: row.get("name"),
        num_rows: row.get("num_rows"),
        first_sample_no: row.get("first_sample_no"),
        last_sample_no: row.get("last_sample_no"),
        test_date: test_date.map(from_millis).transpose()?,
        extra_metadata: serde_json::from_str(&extra).unwrap_or(serde_json::json!({})),
    })
}

fn unit_from_row(row: &SqliteRow) -> DataUnit {
    DataUnit {
        id: row.get("id"),
        symbol: row.get("symbol"),
        name: row.get("name"),
        is_default: row.get("is_default"),
    }
}

fn column_type_from_row(row: &SqliteRow) -> ColumnType {
    ColumnType {
        id: row.get("id"),
        name: row.get("name"),
        unit_id: row.get("unit_id"),
        is_default: row.get("is_default"),
        is_required: row.get("is_required"),
        override_name: row.get("override_name"),
    }
}

fn column_from_row(row: &SqliteRow) -> Result<Column> {
    let data_type: String = row.get("data_type");
    Ok(Column {
        id: row.get("id"),
        file_id: row.get("file_id"),
        type_id: row.get("type_id"),
        name: row.get("name"),
        data_type: data_type.parse()?,
    })
}

fn error_from_row(row: &SqliteRow) -> Result<HarvestError> {
    Ok(HarvestError {
        id: row.get("id"),
        harvester_id: row.get("harvester_id"),
        file_id: row.get("file_id"),
        error: row.get("error"),
        timestamp: from_millis(row.get("timestamp"))?,
    })
}

async fn column_data_type(conn: &mut SqliteConnection, column_id: i64) -> Result<DataType> {
    let data_type: Option<String> = sqlx::query_scalar("SELECT data_type FROM columns WHERE id = ?")
        .bind(column_id)
        .fetch_optional(&mut *conn)
        .await?;
    match data_type {
        Some(dt) => dt.parse(),
        None => bail!("column {} does not exist", column_id),
    }
}

async fn stored_length(
    conn: &mut SqliteConnection,
    column_id: i64,
    data_type: DataType,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE column_id = ?",
        value_table(data_type)
    );
    Ok(sqlx::query_scalar(&sql)
        .bind(column_id)
        .fetch_one(&mut *conn)
        .await?)
}

async fn insert_values(
    conn: &mut SqliteConnection,
    column_id: i64,
    start: i64,
    values: &TimeseriesValues,
) -> Result<()> {
    let table = value_table(values.data_type());
    let mut offset = 0usize;
    while offset < values.len() {
        let end = (offset + INSERT_BATCH_ROWS).min(values.len());
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {} (column_id, position, value) ", table));
        builder.push_values(offset..end, |mut b, i| {
            b.push_bind(column_id).push_bind(start + i as i64);
            match values {
                TimeseriesValues::Float(v) => {
                    b.push_bind(if v[i].is_finite() { Some(v[i]) } else { None });
                }
                TimeseriesValues::Int(v) => {
                    b.push_bind(v[i]);
                }
                TimeseriesValues::Str(v) => {
                    b.push_bind(v[i].clone());
                }
            }
        });
        builder.build().execute(&mut *conn).await?;
        offset = end;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn register_harvester(
        &self,
        name: &str,
        api_key: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Harvester> {
        let result =
            sqlx::query("INSERT INTO harvesters (name, api_key, created_at) VALUES (?, ?, ?)")
                .bind(name)
                .bind(api_key)
                .bind(to_millis(created_at))
                .execute(&self.pool)
                .await?;
        Ok(Harvester {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            created_at,
        })
    }

    async fn get_harvester(&self, id: i64) -> Result<Option<Harvester>> {
        let row = sqlx::query("SELECT id, name, api_key, created_at FROM harvesters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(harvester_from_row).transpose()
    }

    async fn add_monitored_path(&self, path: &NewMonitoredPath) -> Result<MonitoredPath> {
        let result = sqlx::query(
            "INSERT INTO monitored_paths (harvester_id, path, pattern, stable_time, active) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(path.harvester_id)
        .bind(&path.path)
        .bind(&path.pattern)
        .bind(path.stable_time as i64)
        .execute(&self.pool)
        .await?;
        Ok(MonitoredPath {
            id: result.last_insert_rowid(),
            harvester_id: path.harvester_id,
            path: path.path.clone(),
            pattern: path.pattern.clone(),
            stable_time: path.stable_time,
            active: true,
        })
    }

    async fn get_monitored_path(&self, id: i64) -> Result<Option<MonitoredPath>> {
        let row = sqlx::query(
            "SELECT id, harvester_id, path, pattern, stable_time, active FROM monitored_paths WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(path_from_row))
    }

    async fn list_monitored_paths(&self, harvester_id: Option<i64>) -> Result<Vec<MonitoredPath>> {
        let rows = sqlx::query(
            "SELECT id, harvester_id, path, pattern, stable_time, active FROM monitored_paths \
             WHERE (? IS NULL OR harvester_id = ?) ORDER BY id",
        )
        .bind(harvester_id)
        .bind(harvester_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(path_from_row).collect())
    }

    async fn find_or_insert_file(&self, file: &NewObservedFile) -> Result<(ObservedFile, bool)> {
        let fresh = file.clone().into_file(0);
        let result = sqlx::query(
            r#"
            INSERT INTO observed_files (harvester_id, path, last_observed_size, last_observed_time, state, extra_metadata)
            VALUES (?, ?, ?, ?, ?, '{}')
            ON CONFLICT(harvester_id, path) DO NOTHING
            "#,
        )
        .bind(fresh.harvester_id)
        .bind(&fresh.path)
        .bind(fresh.last_observed_size as i64)
        .bind(to_millis(fresh.last_observed_time))
        .bind(fresh.state.as_str())
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected() == 1;

        let stored = self
            .find_file(file.harvester_id, &file.path)
            .await?
            .ok_or_else(|| anyhow!("file {} vanished after insert", file.path))?;
        Ok((stored, created))
    }

    async fn find_file(&self, harvester_id: i64, path: &str) -> Result<Option<ObservedFile>> {
        let sql = format!(
            "SELECT {} FROM observed_files WHERE harvester_id = ? AND path = ?",
            FILE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(harvester_id)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn get_file(&self, id: i64) -> Result<Option<ObservedFile>> {
        let sql = format!("SELECT {} FROM observed_files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn update_file(&self, file: &ObservedFile) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE observed_files SET
                last_observed_size = ?, last_observed_time = ?, state = ?,
                inferred_format = ?, parser = ?, name = ?,
                num_rows = ?, first_sample_no = ?, last_sample_no = ?,
                test_date = ?, extra_metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(file.last_observed_size as i64)
        .bind(to_millis(file.last_observed_time))
        .bind(file.state.as_str())
        .bind(&file.inferred_format)
        .bind(&file.parser)
        .bind(&file.name)
        .bind(file.num_rows)
        .bind(file.first_sample_no)
        .bind(file.last_sample_no)
        .bind(file.test_date.map(to_millis))
        .bind(file.extra_metadata.to_string())
        .bind(file.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("file {} does not exist", file.id);
        }
        Ok(())
    }

    async fn list_files(&self, harvester_id: Option<i64>) -> Result<Vec<ObservedFile>> {
        let sql = format!(
            "SELECT {} FROM observed_files WHERE (? IS NULL OR harvester_id = ?) ORDER BY id",
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(harvester_id)
            .bind(harvester_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn lookup_or_insert_unit(
        &self,
        symbol: &str,
        name: &str,
        is_default: bool,
    ) -> Result<DataUnit> {
        sqlx::query(
            "INSERT INTO data_units (symbol, name, is_default) VALUES (?, ?, ?) ON CONFLICT(symbol) DO NOTHING",
        )
        .bind(symbol)
        .bind(name)
        .bind(is_default)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT id, symbol, name, is_default FROM data_units WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(unit_from_row(&row))
    }

    async fn get_unit(&self, id: i64) -> Result<Option<DataUnit>> {
        let row = sqlx::query("SELECT id, symbol, name, is_default FROM data_units WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(unit_from_row))
    }

    async fn list_units(&self) -> Result<Vec<DataUnit>> {
        let rows = sqlx::query("SELECT id, symbol, name, is_default FROM data_units ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(unit_from_row).collect())
    }

    async fn lookup_or_insert_column_type(&self, column_type: &NewColumnType) -> Result<ColumnType> {
        sqlx::query(
            r#"
            INSERT INTO column_types (name, unit_id, is_default, is_required)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name, unit_id) DO NOTHING
            "#,
        )
        .bind(&column_type.name)
        .bind(column_type.unit_id)
        .bind(column_type.is_default)
        .bind(column_type.is_required)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT id, name, unit_id, is_default, is_required, override_name FROM column_types WHERE name = ? AND unit_id = ?",
        )
        .bind(&column_type.name)
        .bind(column_type.unit_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(column_type_from_row(&row))
    }

    async fn get_column_type(&self, id: i64) -> Result<Option<ColumnType>> {
        let row = sqlx::query(
            "SELECT id, name, unit_id, is_default, is_required, override_name FROM column_types WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(column_type_from_row))
    }

    async fn list_column_types(&self) -> Result<Vec<ColumnType>> {
        let rows = sqlx::query(
            "SELECT id, name, unit_id, is_default, is_required, override_name FROM column_types ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(column_type_from_row).collect())
    }

    async fn file_columns(&self, file_id: i64) -> Result<Vec<Column>> {
        let rows = sqlx::query(
            "SELECT id, file_id, type_id, name, data_type FROM columns WHERE file_id = ? ORDER BY id",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(column_from_row).collect()
    }

    async fn append_chunk(&self, file_id: i64, chunk: &[ColumnAppend]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut targets = Vec::with_capacity(chunk.len());
        for append in chunk {
            let row = sqlx::query(
                "SELECT id, file_id, type_id, name, data_type FROM columns WHERE file_id = ? AND type_id = ?",
            )
            .bind(file_id)
            .bind(append.type_id)
            .fetch_optional(&mut *tx)
            .await?;
            match row.as_ref().map(column_from_row).transpose()? {
                Some(column) if column.data_type != append.values.data_type() => bail!(
                    "column '{}' stores {} values, chunk sent {}",
                    column.name,
                    column.data_type,
                    append.values.data_type()
                ),
                existing => targets.push(existing.map(|c| c.id)),
            }
        }

        for (append, target) in chunk.iter().zip(targets) {
            let data_type = append.values.data_type();
            let column_id = match target {
                Some(id) => id,
                None => sqlx::query(
                    "INSERT INTO columns (file_id, type_id, name, data_type) VALUES (?, ?, ?, ?)",
                )
                .bind(file_id)
                .bind(append.type_id)
                .bind(&append.name)
                .bind(data_type.as_str())
                .execute(&mut *tx)
                .await?
                .last_insert_rowid(),
            };
            let start = stored_length(&mut *tx, column_id, data_type).await?;
            insert_values(&mut *tx, column_id, start, &append.values).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn column_values(&self, column_id: i64) -> Result<TimeseriesValues> {
        let mut conn = self.pool.acquire().await?;
        let data_type = column_data_type(&mut *conn, column_id).await?;
        let sql = format!(
            "SELECT value FROM {} WHERE column_id = ? ORDER BY position",
            value_table(data_type)
        );
        let rows = sqlx::query(&sql)
            .bind(column_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(match data_type {
            DataType::Float => TimeseriesValues::Float(
                rows.iter()
                    .map(|r| r.get::<Option<f64>, _>("value").unwrap_or(f64::NAN))
                    .collect(),
            ),
            DataType::Int => TimeseriesValues::Int(rows.iter().map(|r| r.get("value")).collect()),
            DataType::Str => TimeseriesValues::Str(rows.iter().map(|r| r.get("value")).collect()),
        })
    }

    async fn column_length(&self, column_id: i64) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let data_type = column_data_type(&mut *conn, column_id).await?;
        Ok(stored_length(&mut *conn, column_id, data_type).await? as usize)
    }

    async fn last_value(&self, column_id: i64) -> Result<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        let data_type = column_data_type(&mut *conn, column_id).await?;
        let sql = format!(
            "SELECT value FROM {} WHERE column_id = ? ORDER BY position DESC LIMIT 1",
            value_table(data_type)
        );
        let row = sqlx::query(&sql)
            .bind(column_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| match data_type {
            DataType::Float => r
                .get::<Option<f64>, _>("value")
                .map(Value::from)
                .unwrap_or(Value::Null),
            DataType::Int => Value::from(r.get::<i64, _>("value")),
            DataType::Str => Value::from(r.get::<String, _>("value")),
        }))
    }

    async fn clear_file_data(&self, file_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for data_type in [DataType::Float, DataType::Int, DataType::Str] {
            let sql = format!(
                "DELETE FROM {} WHERE column_id IN (SELECT id FROM columns WHERE file_id = ?)",
                value_table(data_type)
            );
            sqlx::query(&sql).bind(file_id).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM columns WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM data_labels WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_data_labels(&self, file_id: i64, labels: &[DataLabel]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for label in labels {
            sqlx::query(
                "INSERT INTO data_labels (file_id, label, range_start, range_end, info) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(file_id)
            .bind(&label.label)
            .bind(label.range[0] as i64)
            .bind(label.range[1] as i64)
            .bind(&label.info)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_data_labels(&self, file_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM data_labels WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn data_labels(&self, file_id: i64) -> Result<Vec<DataLabel>> {
        let rows = sqlx::query(
            "SELECT label, range_start, range_end, info FROM data_labels WHERE file_id = ? ORDER BY id",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let start: i64 = row.get("range_start");
                let end: i64 = row.get("range_end");
                DataLabel {
                    label: row.get("label"),
                    range: [start.max(0) as u64, end.max(0) as u64],
                    info: row.get("info"),
                }
            })
            .collect())
    }

    async fn record_error(&self, error: &NewHarvestError) -> Result<HarvestError> {
        let result = sqlx::query(
            "INSERT INTO harvest_errors (harvester_id, file_id, error, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(error.harvester_id)
        .bind(error.file_id)
        .bind(&error.error)
        .bind(to_millis(error.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(HarvestError {
            id: result.last_insert_rowid(),
            harvester_id: error.harvester_id,
            file_id: error.file_id,
            error: error.error.clone(),
            timestamp: error.timestamp,
        })
    }

    async fn latest_error(&self, file_id: i64) -> Result<Option<HarvestError>> {
        let row = sqlx::query(
            "SELECT id, harvester_id, file_id, error, timestamp FROM harvest_errors WHERE file_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(error_from_row).transpose()
    }
}
