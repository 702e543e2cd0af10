/// End-to-end export runs: config file on disk, a fake Loki over HTTP, local
/// storage and the JSON state file.
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use loki_export::cli::run::{run_export, RunError};
use loki_export::encode::{decompress, elf};
use loki_export::engine::ExporterStatus;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const DAY_START_NS: i64 = 1_582_416_000_000_000_000; // 2020-02-23T00:00:00Z
const DAY_NS: i64 = 86_400_000_000_000;

struct FakeLoki {
    /// (timestamp ns, line)
    records: Vec<(i64, String)>,
    queries: AtomicUsize,
}

impl FakeLoki {
    fn uniform_day(count: i64) -> Self {
        let step = DAY_NS / count;
        Self {
            records: (0..count)
                .map(|i| (DAY_START_NS + i * step, format!("request {} served", i)))
                .collect(),
            queries: AtomicUsize::new(0),
        }
    }
}

async fn query_range(
    State(loki): State<Arc<FakeLoki>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    loki.queries.fetch_add(1, Ordering::SeqCst);
    let param = |name: &str| params.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    let (start, end, limit) = (param("start"), param("end"), param("limit") as usize);

    let values: Vec<Value> = loki
        .records
        .iter()
        .filter(|(ts, _)| *ts >= start && *ts < end)
        .take(limit)
        .map(|(ts, line)| json!([ts.to_string(), line]))
        .collect();

    Json(json!({
        "status": "success",
        "data": {
            "resultType": "streams",
            "result": [{"stream": {"job": "varlogs"}, "values": values}]
        }
    }))
}

async fn spawn_loki(loki: Arc<FakeLoki>) -> String {
    let app = Router::new()
        .route("/loki/api/v1/query_range", get(query_range))
        .with_state(loki);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn write_config(dir: &Path, endpoint: &str, max_records: usize) -> PathBuf {
    let yaml = format!(
        r#"
loki:
  endpoint: {endpoint}
  retry:
    max_attempts: 2
    initial_backoff: 1ms
    max_backoff: 5ms

export:
  max_records_per_query: {max_records}
  max_days_per_run: 1

state:
  path: {state}

storage:
  local:
    path: {archive}

exporters:
  - query: '{{job="varlogs"}}'
    initial_start: 2020-02-23 00:00:00
    format: elf
"#,
        endpoint = endpoint,
        max_records = max_records,
        state = dir.join("state/state.json").display(),
        archive = dir.join("archive").display(),
    );

    let path = dir.join("config.yml");
    fs::write(&path, yaml).unwrap();
    path
}

fn archive_files(dir: &Path) -> Vec<PathBuf> {
    let month = dir.join("archive/job_varlogs/2020/02");
    let mut files: Vec<PathBuf> = match fs::read_dir(&month) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

fn read_state(dir: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(dir.join("state/state.json")).unwrap()).unwrap()
}

#[tokio::test]
async fn test_export_run_writes_archives_and_state() {
    let temp_dir = TempDir::new().unwrap();
    let loki = Arc::new(FakeLoki::uniform_day(30));
    let endpoint = spawn_loki(loki.clone()).await;
    let config_path = write_config(temp_dir.path(), &endpoint, 10);

    let summary = run_export(&config_path).await.unwrap();
    let outcome = summary.outcome(r#"{job="varlogs"}"#).unwrap();
    // One day per run, the rest of the years since 2020 is still backlog
    assert_eq!(outcome.status, ExporterStatus::Behind);
    assert_eq!(outcome.records_exported, 30);
    assert_eq!(outcome.windows_committed, 4);

    let files = archive_files(temp_dir.path());
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "job_varlogs-20200223T000000Z_20200223T060000Z.log.gz",
            "job_varlogs-20200223T060000Z_20200223T120000Z.log.gz",
            "job_varlogs-20200223T120000Z_20200223T180000Z.log.gz",
            "job_varlogs-20200223T180000Z_20200224T000000Z.log.gz",
        ]
    );

    let mut lines = Vec::new();
    for file in &files {
        let text = decompress(&fs::read(file).unwrap()).unwrap();
        lines.extend(elf::decode(&text).unwrap().into_iter().map(|r| r.line));
    }
    let expected: Vec<String> = loki.records.iter().map(|(_, line)| line.clone()).collect();
    assert_eq!(lines, expected);

    assert_eq!(
        read_state(temp_dir.path()),
        json!({r#"{job="varlogs"}"#: "2020-02-24T00:00:00Z"})
    );
}

#[tokio::test]
async fn test_next_run_advances_over_empty_day() {
    let temp_dir = TempDir::new().unwrap();
    let loki = Arc::new(FakeLoki::uniform_day(5));
    let endpoint = spawn_loki(loki.clone()).await;
    let config_path = write_config(temp_dir.path(), &endpoint, 100);

    run_export(&config_path).await.unwrap();
    assert_eq!(archive_files(temp_dir.path()).len(), 1);

    let summary = run_export(&config_path).await.unwrap();
    assert_eq!(summary.records_exported(), 0);
    assert_eq!(archive_files(temp_dir.path()).len(), 1);
    assert_eq!(
        read_state(temp_dir.path()),
        json!({r#"{job="varlogs"}"#: "2020-02-25T00:00:00Z"})
    );
}

#[tokio::test]
async fn test_unreachable_loki_fails_run_and_keeps_state() {
    let temp_dir = TempDir::new().unwrap();
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config_path = write_config(temp_dir.path(), &format!("http://127.0.0.1:{}", port), 10);

    match run_export(&config_path).await {
        Err(RunError::Incomplete { failed, partial }) => {
            assert_eq!(failed, 1);
            assert_eq!(partial, 0);
        }
        other => panic!("expected incomplete run, got {:?}", other.map(|_| ())),
    }

    assert!(archive_files(temp_dir.path()).is_empty());
    assert!(!temp_dir.path().join("state/state.json").exists());
}

#[tokio::test]
async fn test_state_file_keyed_by_slug_is_honoured() {
    let temp_dir = TempDir::new().unwrap();
    let loki = Arc::new(FakeLoki::uniform_day(5));
    let endpoint = spawn_loki(loki.clone()).await;
    let config_path = write_config(temp_dir.path(), &endpoint, 100);

    // Slug key and nanosecond epoch for 2020-02-24T00:00:00Z
    fs::create_dir_all(temp_dir.path().join("state")).unwrap();
    fs::write(
        temp_dir.path().join("state/state.json"),
        format!(r#"{{"job_varlogs": "{}"}}"#, DAY_START_NS + DAY_NS),
    )
    .unwrap();

    run_export(&config_path).await.unwrap();

    // 2020-02-23 was exported before, so nothing is written again
    assert!(archive_files(temp_dir.path()).is_empty());
    let state = read_state(temp_dir.path());
    assert_eq!(state[r#"{job="varlogs"}"#], json!("2020-02-25T00:00:00Z"));
}
