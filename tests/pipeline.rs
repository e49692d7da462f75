//! End-to-end tests of the harvester pipeline.
//!
//! Most tests drive [`run_cycle`] against [`LocalServer`], a [`ReportSink`]
//! that hands every report straight to the server's report handler over an
//! in-memory store. Its clock advances one second per report, so a file
//! observed twice with a zero stability window becomes STABLE on the second
//! cycle. The last test runs the same flow over HTTP against the axum router
//! backed by SQLite.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use cycler_harvest::client::{ReportSink, ServerClient, ServerRejection};
use cycler_harvest::config::{Config, DbConfig, HarvesterSettings, ServerConfig};
use cycler_harvest::harvester::run_cycle;
use cycler_harvest::readers::biologic;
use cycler_harvest::server::{router, AppState};
use cycler_harvest::sqlite_store::SqliteStore;
use cycler_harvest::{db, migrate};
use cycler_harvest_core::error::ReportError;
use cycler_harvest_core::handler;
use cycler_harvest_core::models::{
    FileState, Harvester, NewMonitoredPath, ObservedFile, TimeseriesValues,
};
use cycler_harvest_core::store::memory::InMemoryStore;
use cycler_harvest_core::store::Store;
use cycler_harvest_core::wire::{
    HarvesterConfig, ImportContent, Report, ReportContent, ReportResponse,
};

// ============ In-process server ============

struct LocalServer {
    store: InMemoryStore,
    harvester: Harvester,
    max_upload_bytes: usize,
    clock: AtomicI64,
    sent_bytes: Mutex<Vec<usize>>,
    data_chunks: AtomicUsize,
    /// Fail the n-th data chunk (1-based) with a transport error, once.
    fail_chunk: Mutex<Option<usize>>,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

impl LocalServer {
    async fn new(dir: &Path, max_upload_bytes: usize) -> Self {
        let store = InMemoryStore::with_standard_catalogue().await.unwrap();
        let harvester = store
            .register_harvester("rig-1", "key", epoch())
            .await
            .unwrap();
        store
            .add_monitored_path(&NewMonitoredPath {
                harvester_id: harvester.id,
                path: dir.to_string_lossy().to_string(),
                pattern: "*".to_string(),
                stable_time: 0,
            })
            .await
            .unwrap();
        Self {
            store,
            harvester,
            max_upload_bytes,
            clock: AtomicI64::new(1),
            sent_bytes: Mutex::new(Vec::new()),
            data_chunks: AtomicUsize::new(0),
            fail_chunk: Mutex::new(None),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        epoch() + chrono::Duration::seconds(self.clock.fetch_add(1, Ordering::SeqCst))
    }

    async fn cycle(&self) -> cycler_harvest::harvester::CycleSummary {
        let config = self.fetch_config().await.unwrap();
        run_cycle(self, &config).await.unwrap()
    }

    async fn file(&self, path: &Path) -> ObservedFile {
        self.store
            .find_file(self.harvester.id, &path.to_string_lossy())
            .await
            .unwrap()
            .unwrap()
    }

    async fn columns(&self, path: &Path) -> BTreeMap<String, TimeseriesValues> {
        let file = self.file(path).await;
        let mut out = BTreeMap::new();
        for column in self.store.file_columns(file.id).await.unwrap() {
            let values = self.store.column_values(column.id).await.unwrap();
            out.insert(column.name, values);
        }
        out
    }
}

fn rejection(err: ReportError) -> anyhow::Error {
    ServerRejection {
        status: err.status_code(),
        code: err.code().to_string(),
        message: err.to_string(),
    }
    .into()
}

fn is_data_chunk(report: &Report) -> bool {
    matches!(
        &report.content,
        Some(ReportContent::Import(ImportContent::InProgress { data, .. })) if !data.is_empty()
    )
}

#[async_trait]
impl ReportSink for LocalServer {
    async fn fetch_config(&self) -> Result<HarvesterConfig> {
        handler::harvester_config(&self.store, &self.harvester, 1, self.max_upload_bytes)
            .await
            .map_err(rejection)
    }

    async fn send(&self, report: &Report) -> Result<ReportResponse> {
        self.sent_bytes
            .lock()
            .unwrap()
            .push(serde_json::to_vec(report)?.len());
        if is_data_chunk(report) {
            let n = self.data_chunks.fetch_add(1, Ordering::SeqCst) + 1;
            let fail_now = {
                let mut fail = self.fail_chunk.lock().unwrap();
                if *fail == Some(n) {
                    *fail = None;
                    true
                } else {
                    false
                }
            };
            if fail_now {
                bail!("connection reset by peer");
            }
        }
        let now = self.now();
        handler::handle_report(&self.store, &self.harvester, report, now)
            .await
            .map_err(rejection)
    }
}

// ============ Fixtures ============

fn csv_rows(range: std::ops::RangeInclusive<usize>) -> String {
    range
        .map(|i| {
            let current = if (i / 10) % 2 == 0 { 0.5 } else { -0.25 };
            format!("{:.1},{:.3},{}\n", i as f64 * 10.0, 3.0 + i as f64 * 0.01, current)
        })
        .collect()
}

fn write_csv(dir: &Path, name: &str, rows: usize) -> PathBuf {
    let path = dir.join(name);
    let mut content = String::from("time (s),voltage (V),current (A)\n");
    content.push_str(&csv_rows(0..=rows - 1));
    fs::write(&path, content).unwrap();
    path
}

/// A Maccor export whose state flips between charge and rest on every row.
fn maccor_pulses(rows: usize) -> String {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    let mut out = String::from(
        "Today's Date\t03/05/2024\tDate of Test:\t03/01/2024 09:30:00\tProcedure:\tpulse.000\n\
Rec#\tCyc#\tStep\tTestTime\tStepTime\tAmp-hr\tWatt-hr\tAmps\tVolts\tState\tES\tDPt Time\n",
    );
    for i in 0..rows {
        let (state, amps) = if i % 2 == 0 { ("C", 0.5) } else { ("R", 0.0) };
        let stamp = start + chrono::Duration::seconds(i as i64 * 10);
        out.push_str(&format!(
            "{}\t1\t{}\t{}\t0\t0\t0\t{}\t{:.2}\t{}\t0\t{}\n",
            i + 1,
            i + 1,
            i * 10,
            amps,
            3.2 + i as f64 * 0.001,
            state,
            stamp.format("%m/%d/%Y %H:%M:%S")
        ));
    }
    out
}

/// Import `initial` rows while the `fail_chunk`-th data chunk is lost, append
/// `appended` rows, and let the file settle and import again.
async fn import_with_lost_chunk(
    initial: usize,
    appended: usize,
    fail_chunk: usize,
) -> BTreeMap<String, TimeseriesValues> {
    let tmp = TempDir::new().unwrap();
    let path = write_csv(tmp.path(), "growing.csv", initial);
    let server = LocalServer::new(tmp.path(), 1200).await;
    *server.fail_chunk.lock().unwrap() = Some(fail_chunk);

    server.cycle().await;
    server.cycle().await;

    let mut handle = OpenOptions::new().append(true).open(&path).unwrap();
    handle
        .write_all(csv_rows(initial..=initial + appended - 1).as_bytes())
        .unwrap();
    drop(handle);

    server.cycle().await;
    assert_eq!(server.cycle().await.imported, 1);
    assert_eq!(server.file(&path).await.state, FileState::Imported);
    server.columns(&path).await
}

async fn import_at_once(rows: usize) -> BTreeMap<String, TimeseriesValues> {
    let tmp = TempDir::new().unwrap();
    let path = write_csv(tmp.path(), "growing.csv", rows);
    let server = LocalServer::new(tmp.path(), 1200).await;
    server.cycle().await;
    assert_eq!(server.cycle().await.imported, 1);
    server.columns(&path).await
}

fn float_values(values: &TimeseriesValues) -> &[f64] {
    match values {
        TimeseriesValues::Float(v) => v,
        other => panic!("expected floats, got {:?}", other.data_type()),
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_file_is_imported_once_stable() {
    let tmp = TempDir::new().unwrap();
    let path = write_csv(tmp.path(), "cell_01.csv", 50);
    let server = LocalServer::new(tmp.path(), 2048).await;

    let first = server.cycle().await;
    assert_eq!(first.observed, 1);
    assert_eq!(first.imported, 0);
    assert_eq!(server.file(&path).await.state, FileState::Unstable);

    let second = server.cycle().await;
    assert_eq!(second.imported, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Imported);
    assert_eq!(file.parser.as_deref(), Some("delimited"));
    assert_eq!(file.num_rows, Some(50));

    let columns = server.columns(&path).await;
    assert!(columns.len() >= 5, "columns: {:?}", columns.keys());
    assert!(columns.values().all(|v| v.len() == 50));
    match &columns["Sample_number"] {
        TimeseriesValues::Int(samples) => {
            assert_eq!(samples.first(), Some(&1));
            assert_eq!(samples.last(), Some(&50));
        }
        other => panic!("sample numbers stored as {:?}", other.data_type()),
    }
    let charge = float_values(&columns["Charge_capacity"]);
    assert_eq!(charge[0], 0.0);

    // An imported file with an unchanged size is left alone.
    let third = server.cycle().await;
    assert_eq!(third.observed, 1);
    assert_eq!(third.imported, 0);
    assert_eq!(server.file(&path).await.state, FileState::Imported);
}

#[tokio::test]
async fn test_every_report_respects_upload_limit() {
    let tmp = TempDir::new().unwrap();
    write_csv(tmp.path(), "long.csv", 400);
    let server = LocalServer::new(tmp.path(), 1200).await;

    server.cycle().await;
    let summary = server.cycle().await;
    assert_eq!(summary.imported, 1);

    assert!(server.data_chunks.load(Ordering::SeqCst) > 1);
    let sizes = server.sent_bytes.lock().unwrap().clone();
    assert!(sizes.iter().all(|&n| n <= 1200), "sizes: {:?}", sizes);
}

#[tokio::test]
async fn test_interrupted_import_resumes_to_same_columns() {
    let tmp = TempDir::new().unwrap();
    let path = write_csv(tmp.path(), "growing.csv", 40);
    let server = LocalServer::new(tmp.path(), 1200).await;
    *server.fail_chunk.lock().unwrap() = Some(2);

    server.cycle().await;
    let failed = server.cycle().await;
    assert_eq!(failed.failed, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::ImportFailed);
    let error = server.store.latest_error(file.id).await.unwrap().unwrap();
    assert!(error.error.contains("connection reset"), "{}", error.error);
    let partial = server.columns(&path).await["Sample_number"].len();
    assert!(partial > 0 && partial < 40, "stored {} rows", partial);

    // The cycler appends more rows; the file grows, settles and resumes.
    let mut handle = OpenOptions::new().append(true).open(&path).unwrap();
    handle.write_all(csv_rows(40..=59).as_bytes()).unwrap();
    drop(handle);

    assert_eq!(server.cycle().await.imported, 0);
    assert_eq!(server.file(&path).await.state, FileState::Growing);
    assert_eq!(server.cycle().await.imported, 1);
    assert_eq!(server.file(&path).await.state, FileState::Imported);
    let resumed = server.columns(&path).await;
    let uninterrupted = import_at_once(60).await;

    assert_eq!(resumed.keys().collect::<Vec<_>>(), uninterrupted.keys().collect::<Vec<_>>());
    for (name, values) in &uninterrupted {
        assert_eq!(values.len(), 60, "{}", name);
        assert_eq!(&resumed[name], values, "column {} differs after resume", name);
    }
}

#[tokio::test]
async fn test_unsupported_file_records_error_without_state_change() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("firmware.bin");
    fs::write(&path, [0u8, 159, 146, 150, 0, 1, 2, 3]).unwrap();
    let server = LocalServer::new(tmp.path(), 2048).await;

    server.cycle().await;
    let summary = server.cycle().await;
    assert_eq!(summary.unsupported, 1);
    assert_eq!(summary.imported, 0);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Stable);
    let error = server.store.latest_error(file.id).await.unwrap().unwrap();
    assert!(error.error.contains("unsupported"), "{}", error.error);
    assert!(server.store.file_columns(file.id).await.unwrap().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_resumed_import_matches_uninterrupted(
        initial in 5usize..80,
        appended in 1usize..40,
        fail_chunk in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let resumed = runtime.block_on(import_with_lost_chunk(initial, appended, fail_chunk));
        let uninterrupted = runtime.block_on(import_at_once(initial + appended));
        prop_assert_eq!(resumed, uninterrupted);
    }
}

#[tokio::test]
async fn test_unsupported_file_is_recorded_once_while_unchanged() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("firmware.bin");
    fs::write(&path, [0u8, 159, 146, 150, 0, 1, 2, 3]).unwrap();
    let server = LocalServer::new(tmp.path(), 2048).await;

    server.cycle().await;
    assert_eq!(server.cycle().await.unsupported, 1);
    let file = server.file(&path).await;
    let first = server.store.latest_error(file.id).await.unwrap().unwrap();

    for _ in 0..4 {
        server.cycle().await;
        let latest = server.store.latest_error(file.id).await.unwrap().unwrap();
        assert_eq!(latest.id, first.id);
    }
    assert_eq!(server.file(&path).await.state, FileState::Stable);
}

#[tokio::test]
async fn test_many_labels_are_sent_in_bounded_batches() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pulses.txt");
    fs::write(&path, maccor_pulses(400)).unwrap();
    let server = LocalServer::new(tmp.path(), 4096).await;

    server.cycle().await;
    let summary = server.cycle().await;
    assert_eq!(summary.imported, 1);

    let sizes = server.sent_bytes.lock().unwrap().clone();
    assert!(sizes.iter().all(|&n| n <= 4096), "sizes: {:?}", sizes);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Imported);
    let labels = server.store.data_labels(file.id).await.unwrap();
    assert_eq!(labels.len(), 400);
    assert!(labels.iter().map(|l| l.range[0]).eq(0..400));
    assert_eq!(labels[0].label, "Charge");
    assert_eq!(labels[1].label, "Rest");
}

#[tokio::test]
async fn test_maccor_export_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("cell_02.txt");
    fs::write(
        &path,
        "Today's Date\t03/05/2024\tDate of Test:\t03/01/2024 09:30:00\tProcedure:\tcc_cv.000\n\
Rec#\tCyc#\tStep\tTestTime\tStepTime\tAmp-hr\tWatt-hr\tAmps\tVolts\tState\tES\tDPt Time\n\
1\t0\t1\t0\t0\t0\t0\t0\t3.2\tR\t0\t03/01/2024 09:30:00\n\
2\t0\t1\t10\t10\t0\t0\t0\t3.2\tR\t0\t03/01/2024 09:30:10\n\
3\t1\t2\t0d 00:00:20.00\t0\t0.001\t0.003\t0.5\t3.4\tC\t0\t03/01/2024 09:30:20\n\
4\t1\t3\t30\t0\t0.002\t0.006\t0.5\t3.3\tD\t0\t03/01/2024 09:30:30\n",
    )
    .unwrap();
    let server = LocalServer::new(tmp.path(), 4096).await;

    server.cycle().await;
    assert_eq!(server.cycle().await.imported, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Imported);
    assert_eq!(file.parser.as_deref(), Some("maccor_txt"));
    assert_eq!(
        file.test_date.map(|d| d.to_rfc3339()).as_deref(),
        Some("2024-03-01T09:30:00+00:00")
    );

    let columns = server.columns(&path).await;
    assert!(columns.values().all(|v| v.len() == 4));
    let amps: Vec<f64> = columns
        .iter()
        .find(|(name, _)| name.as_str() == "Amps")
        .map(|(_, v)| float_values(v).to_vec())
        .expect("Amps column");
    assert_eq!(amps, vec![0.0, 0.0, 0.5, -0.5]);

    let labels = server.store.data_labels(file.id).await.unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels[0].range, [0, 2]);
}

#[tokio::test]
async fn test_ivium_export_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pulse.idf");
    fs::write(
        &path,
        "QR=QR\nTitle=cell_03 pulse\nstarttime=01/03/2024 09:30:00\nMethod=Chronoamperometry\n\
primary_data\n3\n3\n 0.0 1.0E-03 3.2\n 1.0 1.0E-03 3.25\n 2.0 -2.0E-03 3.1\n",
    )
    .unwrap();
    let server = LocalServer::new(tmp.path(), 4096).await;

    server.cycle().await;
    assert_eq!(server.cycle().await.imported, 1);

    let file = server.file(&path).await;
    assert_eq!(file.parser.as_deref(), Some("ivium_idf"));
    assert_eq!(file.name.as_deref(), Some("cell_03 pulse"));
    assert_eq!(file.extra_metadata["Method"], "Chronoamperometry");

    let columns = server.columns(&path).await;
    assert!(columns.values().all(|v| v.len() == 3));
    let volts = columns
        .iter()
        .find(|(name, _)| name.as_str() == "Volts")
        .map(|(_, v)| float_values(v).to_vec())
        .expect("Volts column");
    assert_eq!(volts, vec![3.2, 3.25, 3.1]);
}

/// A version 2 `VMP data` module with flags, time/s, Ewe/V, I/mA and Ns.
fn mpr_bytes(rows: &[(u8, f64, f32, f32, u16)]) -> Vec<u8> {
    fn module(short: &str, version: u32, data: &[u8]) -> Vec<u8> {
        let mut out = b"MODULE".to_vec();
        out.extend(format!("{:<10}", short).as_bytes());
        out.extend(format!("{:<25}", "synthetic").as_bytes());
        out.extend((data.len() as u32).to_le_bytes());
        out.extend(version.to_le_bytes());
        out.extend(b"03/01/24");
        out.extend(data);
        out
    }

    let ids: [u16; 5] = [1, 4, 6, 8, 131];
    let mut data = (rows.len() as u32).to_le_bytes().to_vec();
    data.push(ids.len() as u8);
    for id in ids {
        data.extend(id.to_le_bytes());
    }
    data.resize(405, 0);
    for (flags, t, e, i, ns) in rows {
        data.push(*flags);
        data.extend(t.to_le_bytes());
        data.extend(e.to_le_bytes());
        data.extend(i.to_le_bytes());
        data.extend(ns.to_le_bytes());
    }

    let mut file = biologic::magic().to_vec();
    file.extend(module("VMP Set", 0, b"settings"));
    file.extend(module("VMP data", 2, &data));
    file
}

#[tokio::test]
async fn test_biologic_mpr_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("cell_04.mpr");
    fs::write(
        &path,
        mpr_bytes(&[
            (0x03, 0.0, 3.0, 0.0, 0),
            (0x03, 10.0, 3.0, 0.0, 0),
            (0x21, 10.5, 3.1, 500.0, 1),
            (0x01, 20.0, 3.2, 500.0, 1),
        ]),
    )
    .unwrap();
    let server = LocalServer::new(tmp.path(), 4096).await;

    server.cycle().await;
    assert_eq!(server.cycle().await.imported, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Imported);
    assert_eq!(file.parser.as_deref(), Some("biologic_mpr"));
    assert_eq!(file.name.as_deref(), Some("cell_04"));

    let columns = server.columns(&path).await;
    assert!(columns.values().all(|v| v.len() == 4));
    let current = columns
        .iter()
        .find(|(name, _)| name.as_str() == "Amps")
        .map(|(_, v)| float_values(v).to_vec())
        .expect("Amps column");
    // Stored in the catalogue unit, amperes.
    assert!((current[3] - 0.5).abs() < 1e-12, "{:?}", current);

    let labels = server.store.data_labels(file.id).await.unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[1].range, [2, 4]);
}

// ============ HTTP ============

struct HttpServer {
    store: Arc<SqliteStore>,
    settings: HarvesterSettings,
    client: ServerClient,
    harvester_id: i64,
}

/// Serve the axum router over SQLite on a free port and register a
/// harvester watching `watched`.
async fn http_server(db_dir: &Path, watched: &Path, max_upload_bytes: usize) -> HttpServer {
    let config = Config {
        db: DbConfig {
            path: db_dir.join("harvest.sqlite"),
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            max_upload_bytes,
            sleep_time: 1,
            default_stable_time: 0,
        },
    };
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let app = router(AppState {
        store: store.clone(),
        sleep_time: 1,
        max_upload_bytes,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let registered = ServerClient::register(
        &url,
        "rig-http",
        0,
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    store
        .add_monitored_path(&NewMonitoredPath {
            harvester_id: registered.id,
            path: watched.to_string_lossy().to_string(),
            pattern: "*.csv".to_string(),
            stable_time: 0,
        })
        .await
        .unwrap();

    let mut settings = HarvesterSettings::unregistered(&url, &registered.name);
    settings.harvester_id = registered.id;
    settings.api_key = registered.api_key.clone();
    let client = ServerClient::new(&settings).unwrap();
    HttpServer {
        store,
        settings,
        client,
        harvester_id: registered.id,
    }
}

impl HttpServer {
    async fn file(&self, path: &Path) -> ObservedFile {
        self.store
            .find_file(self.harvester_id, &path.to_string_lossy())
            .await
            .unwrap()
            .unwrap()
    }

    /// Observe, wait out the (zero) stability window, then import.
    async fn two_cycles(&self, config: &HarvesterConfig) -> cycler_harvest::harvester::CycleSummary {
        run_cycle(&self.client, config).await.unwrap();
        // Stability is measured on the server clock, in milliseconds.
        tokio::time::sleep(Duration::from_millis(50)).await;
        run_cycle(&self.client, config).await.unwrap()
    }
}

#[tokio::test]
async fn test_harvester_cycle_over_http() {
    let tmp = TempDir::new().unwrap();
    let watched = tmp.path().join("cycler");
    fs::create_dir_all(&watched).unwrap();
    let path = write_csv(&watched, "cell_05.csv", 30);
    let server = http_server(tmp.path(), &watched, 2048).await;

    let harvester_config = server.client.fetch_config().await.unwrap();
    assert_eq!(harvester_config.monitored_paths.len(), 1);
    assert!(harvester_config.column_type_id("Volts").is_some());

    let summary = server.two_cycles(&harvester_config).await;
    assert_eq!(summary.imported, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::Imported);
    let detail = handler::file_detail(server.store.as_ref(), file.id).await.unwrap();
    assert!(detail.columns.iter().all(|c| c.length == 30));
    assert!(detail.last_error.is_none());

    // A wrong API key is turned away.
    let mut wrong = server.settings.clone();
    wrong.api_key = "not-the-key".to_string();
    let err = ServerClient::new(&wrong)
        .unwrap()
        .fetch_config()
        .await
        .unwrap_err();
    let rejection = err.downcast_ref::<ServerRejection>().unwrap();
    assert_eq!(rejection.status, 401);
}

#[tokio::test]
async fn test_chunk_refused_before_ingestion_marks_file_failed() {
    let tmp = TempDir::new().unwrap();
    let watched = tmp.path().join("cycler");
    fs::create_dir_all(&watched).unwrap();
    let path = write_csv(&watched, "cell_06.csv", 1000);
    let server = http_server(tmp.path(), &watched, 2048).await;

    // A harvester working from a stale, larger limit sends chunks the
    // server's body limit refuses before the report handler runs.
    let mut harvester_config = server.client.fetch_config().await.unwrap();
    harvester_config.max_upload_bytes = 100_000;

    let summary = server.two_cycles(&harvester_config).await;
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.failed, 1);

    let file = server.file(&path).await;
    assert_eq!(file.state, FileState::ImportFailed);
    let error = server.store.latest_error(file.id).await.unwrap();
    assert!(error.is_some(), "no error recorded for the refused upload");
}
