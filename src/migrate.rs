use anyhow::Result;
use sqlx::SqlitePool;

use cycler_harvest_core::store::seed_standard_catalogue;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS harvesters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        api_key TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS monitored_paths (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        harvester_id INTEGER NOT NULL REFERENCES harvesters(id),
        path TEXT NOT NULL,
        pattern TEXT NOT NULL DEFAULT '*',
        stable_time INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        UNIQUE(harvester_id, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS observed_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        harvester_id INTEGER NOT NULL REFERENCES harvesters(id),
        path TEXT NOT NULL,
        last_observed_size INTEGER NOT NULL,
        last_observed_time INTEGER NOT NULL,
        state TEXT NOT NULL,
        inferred_format TEXT,
        parser TEXT,
        name TEXT,
        num_rows INTEGER,
        first_sample_no INTEGER,
        last_sample_no INTEGER,
        test_date INTEGER,
        extra_metadata TEXT NOT NULL DEFAULT '{}',
        UNIQUE(harvester_id, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS data_units (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS column_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        unit_id INTEGER NOT NULL REFERENCES data_units(id),
        is_default INTEGER NOT NULL DEFAULT 0,
        is_required INTEGER NOT NULL DEFAULT 0,
        override_name TEXT,
        UNIQUE(name, unit_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS columns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES observed_files(id),
        type_id INTEGER NOT NULL REFERENCES column_types(id),
        name TEXT NOT NULL,
        data_type TEXT NOT NULL,
        UNIQUE(file_id, type_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeseries_float (
        column_id INTEGER NOT NULL REFERENCES columns(id),
        position INTEGER NOT NULL,
        value REAL,
        PRIMARY KEY (column_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeseries_int (
        column_id INTEGER NOT NULL REFERENCES columns(id),
        position INTEGER NOT NULL,
        value INTEGER NOT NULL,
        PRIMARY KEY (column_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeseries_str (
        column_id INTEGER NOT NULL REFERENCES columns(id),
        position INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (column_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS data_labels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES observed_files(id),
        label TEXT NOT NULL,
        range_start INTEGER NOT NULL,
        range_end INTEGER NOT NULL,
        info TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS harvest_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        harvester_id INTEGER NOT NULL REFERENCES harvesters(id),
        file_id INTEGER REFERENCES observed_files(id),
        error TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_observed_files_state ON observed_files(state)",
    "CREATE INDEX IF NOT EXISTS idx_columns_file_id ON columns(file_id)",
    "CREATE INDEX IF NOT EXISTS idx_data_labels_file_id ON data_labels(file_id)",
    "CREATE INDEX IF NOT EXISTS idx_harvest_errors_file_id ON harvest_errors(file_id, id DESC)",
];

/// Create the schema and seed the standard catalogue on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    seed_standard_catalogue(&SqliteStore::new(pool.clone())).await?;
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
