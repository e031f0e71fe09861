use async_trait::async_trait;
use geosql::api::{
    GeoSqlService, LoadSpatialDatasetRequest, LoadSpatialDatasetResponse, ProposeSqlRequest, ProposeSqlResponse,
    RunSqlRequest, RunSqlResponse, RunSqlSmartRequest, RunSqlSmartResponse,
};
use geosql::execution::{ExecuteOptions, ExecutionEngine, SqliteEngine};
use geosql::execution_loop::{AttemptErrorKind, AttemptStatus};
use geosql::llm::CompletionProvider;
use geosql::{AppConfig, GeoSqlError, MaterializationMode, SourceType, Srid, ToolRequest, ToolResponse};
use polars::prelude::*;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Replies from a queue; the last reply repeats once the queue is drained.
struct StubProvider {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl StubProvider {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for StubProvider {
    async fn complete(&self, prompt: &str, _context: &str) -> geosql::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut replies = self.replies.lock().unwrap();
        let reply = if replies.len() > 1 { replies.pop_front() } else { replies.front().cloned() };
        reply.ok_or_else(|| GeoSqlError::Llm("stub has no replies".to_string()))
    }
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("geosql-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Nine buildings: detailedUsage A x3, B x5, null x1.
fn write_buildings(dir: &Path) -> PathBuf {
    let usages = [
        json!("A"), json!("B"), json!("B"), json!("A"), json!("B"),
        json!(null), json!("B"), json!("A"), json!("B"),
    ];
    let features: Vec<Value> = usages
        .iter()
        .enumerate()
        .map(|(i, usage)| {
            json!({
                "type": "Feature",
                "properties": {
                    "id": i as i64 + 1,
                    "detailedUsage": usage,
                    "class": if i % 2 == 0 { "house" } else { "shop" }
                },
                "geometry": {"type": "Point", "coordinates": [135.0 + i as f64 * 0.1, 34.5]}
            })
        })
        .collect();
    let path = dir.join("buildings.geojson");
    let doc = json!({"type": "FeatureCollection", "features": features});
    std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
    path
}

fn write_single_point(dir: &Path) -> PathBuf {
    let path = dir.join("station.geojson");
    let doc = json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {"name": "Namba"},
            "geometry": {"type": "Point", "coordinates": [135.5, 34.7]}
        }]
    });
    std::fs::write(&path, doc.to_string()).unwrap();
    path
}

fn load_request(path: &Path, db: &Path, relation: &str, mode: MaterializationMode) -> LoadSpatialDatasetRequest {
    LoadSpatialDatasetRequest {
        source_type: SourceType::FileGeospatial,
        path: path.display().to_string(),
        db_path: Some(db.display().to_string()),
        relation: Some(relation.to_string()),
        mode: Some(mode),
        srid: None,
        add_bbox_columns: false,
        source_relation: None,
    }
}

fn run_request(db: &Path, relation: &str, prompt: &str, max_rows: usize) -> RunSqlSmartRequest {
    RunSqlSmartRequest {
        db_path: Some(db.display().to_string()),
        relation: relation.to_string(),
        user_prompt: prompt.to_string(),
        max_rows: Some(max_rows),
        retries: None,
        as_geojson: false,
        spatial_filter: None,
        timeout_ms: None,
        abort_on_repeat_error: false,
    }
}

fn service(provider: Arc<StubProvider>) -> GeoSqlService {
    GeoSqlService::new(Arc::new(AppConfig::default()), provider)
}

#[tokio::test]
async fn test_count_by_category_scenario() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let provider = StubProvider::new(&[
        "```sql\nSELECT detailedUsage, COUNT(*) AS count FROM buildings GROUP BY detailedUsage ORDER BY count DESC\n```",
    ]);
    let service = service(provider);

    let loaded = service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::Table))
        .await;
    assert!(matches!(loaded, LoadSpatialDatasetResponse::Loaded { rows: 9, .. }), "{:?}", loaded);

    let response = service
        .run_sql_smart(run_request(&db, "buildings", "count by detailedUsage ordered by count descending", 10))
        .await;
    match response {
        RunSqlSmartResponse::Answered { result, sql_history, notes } => {
            assert_eq!(result.columns, vec!["detailedUsage", "count"]);
            assert_eq!(
                result.rows,
                vec![vec![json!("B"), json!(5)], vec![json!("A"), json!(3)], vec![Value::Null, json!(1)]]
            );
            assert!(!result.truncated);
            assert_eq!(sql_history.len(), 1);
            assert!(sql_history[0].sql.ends_with("LIMIT 10"));
            assert_eq!(notes, "succeeded on first attempt");
        }
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejection_feeds_back_and_self_corrects() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let provider = StubProvider::new(&[
        "SELECT * FROM buildings; DROP TABLE buildings;",
        "SELECT class, COUNT(*) FROM buildings GROUP BY class LIMIT 10",
    ]);
    let service = service(Arc::clone(&provider));
    service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::View))
        .await;

    let response = service.run_sql_smart(run_request(&db, "buildings", "count by class", 10)).await;
    let value = serde_json::to_value(&response).unwrap();
    let history = value["sql_history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["status"], json!("error"));
    assert_eq!(history[0]["error_kind"], json!("validation"));
    assert_eq!(history[0]["sql"], json!("SELECT * FROM buildings; DROP TABLE buildings;"));
    assert_eq!(history[1]["status"], json!("ok"));
    assert_eq!(history[1]["error"], Value::Null);
    assert_eq!(value["result"]["rows"].as_array().unwrap().len(), 2);

    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("PREVIOUS ATTEMPT FAILED"));
    assert!(prompts[1].contains("PREVIOUS ATTEMPT FAILED"));
    assert!(prompts[1].contains("DROP TABLE buildings"));
}

#[tokio::test]
async fn test_unknown_column_is_retried_until_budget_is_spent() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let provider = StubProvider::new(&["SELECT usage, COUNT(*) AS n FROM buildings GROUP BY usage"]);
    let service = service(Arc::clone(&provider));
    service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::Table))
        .await;

    let mut request = run_request(&db, "buildings", "count by usage", 10);
    request.retries = Some(1);
    let response = service.run_sql_smart(request).await;
    match response {
        RunSqlSmartResponse::Failed { error, sql_history } => {
            assert_eq!(sql_history.len(), 2);
            assert!(sql_history.iter().all(|a| a.status == AttemptStatus::Error));
            assert!(sql_history.iter().all(|a| a.error_kind == Some(AttemptErrorKind::Execution)));
            assert!(error.contains("Retries exhausted after 2 attempts"), "{}", error);
            assert!(error.contains("no such column"), "{}", error);
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // the correction prompt points at the closest real column
    let prompts = provider.prompts();
    assert!(prompts[1].contains("detailedUsage"));
}

#[tokio::test]
async fn test_missing_relation_fails_before_the_loop() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    write_buildings(&dir);
    let provider = StubProvider::new(&["SELECT 1"]);
    let service = service(Arc::clone(&provider));

    let response = service.run_sql_smart(run_request(&db, "nowhere", "anything", 10)).await;
    match response {
        RunSqlSmartResponse::Failed { sql_history, .. } => assert!(sql_history.is_empty()),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(provider.prompts().is_empty());
}

#[tokio::test]
async fn test_truncated_when_cap_is_reached() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let provider = StubProvider::new(&["SELECT id FROM buildings ORDER BY id"]);
    let service = service(provider);
    service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::Table))
        .await;

    let response = service.run_sql_smart(run_request(&db, "buildings", "list ids", 4)).await;
    match response {
        RunSqlSmartResponse::Answered { result, .. } => {
            assert_eq!(result.rows.len(), 4);
            assert!(result.truncated);
            assert_eq!(result.rows[0], vec![json!(1)]);
        }
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bbox_columns_for_single_point() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_single_point(&dir);
    let service = service(StubProvider::new(&["SELECT 1"]));

    let mut request = load_request(&source, &db, "stations", MaterializationMode::Table);
    request.add_bbox_columns = true;
    request.srid = Some(Srid::WGS84);
    let loaded = service.load_spatial_dataset(request).await;
    assert!(matches!(loaded, LoadSpatialDatasetResponse::Loaded { rows: 1, .. }), "{:?}", loaded);

    let engine = SqliteEngine::new(db);
    let result = engine
        .run_query("SELECT min_lon, max_lon, min_lat, max_lat FROM stations", &ExecuteOptions::default())
        .await
        .unwrap();
    let values: Vec<f64> = result.rows[0].iter().map(|v| v.as_f64().unwrap()).collect();
    assert!((values[0] - 135.5).abs() < 1e-9);
    assert!((values[1] - 135.5).abs() < 1e-9);
    assert!((values[2] - 34.7).abs() < 1e-9);
    assert!((values[3] - 34.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_bbox_with_other_srid_is_a_load_error() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_single_point(&dir);
    let service = service(StubProvider::new(&["SELECT 1"]));

    let mut request = load_request(&source, &db, "stations", MaterializationMode::Table);
    request.add_bbox_columns = true;
    request.srid = Some(Srid(6697));
    match service.load_spatial_dataset(request).await {
        LoadSpatialDatasetResponse::Failed { error } => assert!(error.starts_with("Load error"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_load_is_idempotent_in_both_modes() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let service = service(StubProvider::new(&["SELECT 1"]));

    for mode in [MaterializationMode::View, MaterializationMode::Table, MaterializationMode::View] {
        let first = service
            .load_spatial_dataset(load_request(&source, &db, "buildings", mode))
            .await;
        let second = service
            .load_spatial_dataset(load_request(&source, &db, "buildings", mode))
            .await;
        assert_eq!(first, second);
        match first {
            LoadSpatialDatasetResponse::Loaded { rows, kind, .. } => {
                assert_eq!(rows, 9);
                assert_eq!(kind, mode);
            }
            other => panic!("expected load, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_parquet_source_through_tagged_envelope() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let parquet_path = dir.join("shops.parquet");
    let mut shops = df![
        "name" => ["bakery", "florist", "grocer"],
        "floors" => [1i64, 2, 1]
    ]
    .unwrap();
    let mut file = std::fs::File::create(&parquet_path).unwrap();
    ParquetWriter::new(&mut file).finish(&mut shops).unwrap();

    let service = service(StubProvider::new(&["SELECT floors, COUNT(*) AS n FROM shops GROUP BY floors ORDER BY floors"]));
    let load: ToolRequest = serde_json::from_value(json!({
        "tool": "load_spatial_dataset",
        "source_type": "file-tabular",
        "path": parquet_path.display().to_string(),
        "db_path": db.display().to_string(),
        "relation": "shops",
        "mode": "table"
    }))
    .unwrap();
    let loaded = serde_json::to_value(service.dispatch(load).await).unwrap();
    assert_eq!(loaded["rows"], json!(3));
    assert_eq!(loaded["kind"], json!("table"));

    let run: ToolRequest = serde_json::from_value(json!({
        "tool": "run_sql_smart",
        "db_path": db.display().to_string(),
        "relation": "shops",
        "user_prompt": "how many shops per floor count"
    }))
    .unwrap();
    match service.dispatch(run).await {
        ToolResponse::RunSqlSmart(RunSqlSmartResponse::Answered { result, .. }) => {
            assert_eq!(result.rows, vec![vec![json!(1), json!(2)], vec![json!(2), json!(1)]]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_embedded_database_source_is_copied() {
    let dir = scratch_dir();
    let source_db = dir.join("survey.db");
    {
        let conn = rusqlite::Connection::open(&source_db).unwrap();
        conn.execute_batch(
            "CREATE TABLE parcels (id INTEGER, zone TEXT, geometry TEXT);
             INSERT INTO parcels VALUES (1, 'R1', '{\"type\":\"Point\",\"coordinates\":[139.7,35.6]}');
             INSERT INTO parcels VALUES (2, 'C2', '{\"type\":\"Point\",\"coordinates\":[139.8,35.7]}');",
        )
        .unwrap();
    }

    let db = dir.join("geo.db");
    let service = service(StubProvider::new(&["SELECT zone FROM parcels ORDER BY id"]));
    let request = LoadSpatialDatasetRequest {
        source_type: SourceType::EmbeddedAnalyticalDb,
        path: source_db.display().to_string(),
        db_path: Some(db.display().to_string()),
        relation: Some("parcels".to_string()),
        mode: Some(MaterializationMode::View),
        srid: Some(Srid::WGS84),
        add_bbox_columns: true,
        source_relation: None,
    };
    let loaded = service.load_spatial_dataset(request).await;
    assert!(matches!(loaded, LoadSpatialDatasetResponse::Loaded { rows: 2, .. }), "{:?}", loaded);

    let engine = SqliteEngine::new(db.clone());
    let result = engine
        .run_query("SELECT zone, min_lon FROM parcels ORDER BY id", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!("R1"));
    assert!((result.rows[1][1].as_f64().unwrap() - 139.8).abs() < 1e-9);

    let response = service.run_sql_smart(run_request(&db, "parcels", "list zones", 10)).await;
    assert!(response.is_success());
}

fn station_filter(srid: u32) -> geosql::SpatialFilter {
    serde_json::from_value(json!({
        "type": "bbox",
        "min_lon": 135.4,
        "min_lat": 34.6,
        "max_lon": 135.6,
        "max_lat": 34.8,
        "srid": srid
    }))
    .unwrap()
}

#[tokio::test]
async fn test_spatial_filter_must_match_bbox_srid() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_single_point(&dir);
    let provider = StubProvider::new(&[
        "SELECT name FROM stations WHERE max_lon >= 135.4 AND min_lon <= 135.6 AND max_lat >= 34.6 AND min_lat <= 34.8",
    ]);
    let service = service(Arc::clone(&provider));

    let mut load = load_request(&source, &db, "stations", MaterializationMode::View);
    load.add_bbox_columns = true;
    load.srid = Some(Srid::WGS84);
    assert!(matches!(
        service.load_spatial_dataset(load).await,
        LoadSpatialDatasetResponse::Loaded { rows: 1, .. }
    ));

    let mut mismatched = run_request(&db, "stations", "stations in the area", 10);
    mismatched.spatial_filter = Some(station_filter(6697));
    match service.run_sql_smart(mismatched).await {
        RunSqlSmartResponse::Failed { error, sql_history } => {
            assert!(sql_history.is_empty());
            assert!(error.contains("EPSG:6697") && error.contains("EPSG:4326"), "{}", error);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(provider.prompts().is_empty());

    let mut matching = run_request(&db, "stations", "stations in the area", 10);
    matching.spatial_filter = Some(station_filter(4326));
    match service.run_sql_smart(matching).await {
        RunSqlSmartResponse::Answered { result, .. } => assert_eq!(result.rows, vec![vec![json!("Namba")]]),
        other => panic!("expected an answer, got {:?}", other),
    }
    let prompts = provider.prompts();
    assert!(prompts[0].contains("Coordinates are stored in EPSG:4326"), "{}", prompts[0]);
}

#[tokio::test]
async fn test_propose_sql_validates_without_executing() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let provider = StubProvider::new(&[
        "```sql\nSELECT class, COUNT(*) AS n FROM buildings GROUP BY class\n```",
        "```sql\nDELETE FROM buildings\n```",
    ]);
    let service = service(provider);
    service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::Table))
        .await;

    let request = ProposeSqlRequest {
        db_path: Some(db.display().to_string()),
        relation: "buildings".to_string(),
        user_prompt: "count by class".to_string(),
        max_rows: Some(20),
        spatial_filter: None,
    };
    match service.propose_sql(request.clone()).await {
        ProposeSqlResponse::Proposed { sql, .. } => {
            assert!(sql.starts_with("SELECT class"), "{}", sql);
            assert!(sql.ends_with("LIMIT 20"), "{}", sql);
        }
        other => panic!("expected a proposal, got {:?}", other),
    }

    match service.propose_sql(request).await {
        ProposeSqlResponse::Failed { error, sql } => {
            assert!(error.starts_with("Validation error"), "{}", error);
            assert_eq!(sql.as_deref(), Some("DELETE FROM buildings"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    // nothing was executed
    let engine = SqliteEngine::new(db);
    let count = engine
        .run_query("SELECT COUNT(*) FROM buildings", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(count.rows, vec![vec![json!(9)]]);
}

#[tokio::test]
async fn test_run_sql_goes_through_the_gate() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let source = write_buildings(&dir);
    let service = service(StubProvider::new(&["SELECT 1"]));
    service
        .load_spatial_dataset(load_request(&source, &db, "buildings", MaterializationMode::View))
        .await;

    let run = |sql: &str| RunSqlRequest {
        db_path: Some(db.display().to_string()),
        sql: sql.to_string(),
        max_rows: Some(3),
        as_geojson: false,
        timeout_ms: None,
    };

    match service.run_sql(run("SELECT id FROM buildings ORDER BY id")).await {
        RunSqlResponse::Answered { sql, result } => {
            assert!(sql.ends_with("LIMIT 3"), "{}", sql);
            assert_eq!(result.rows, vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
            assert!(result.truncated);
        }
        other => panic!("expected an answer, got {:?}", other),
    }

    match service.run_sql(run("SELECT file FROM pragma_database_list()")).await {
        RunSqlResponse::Failed { error, .. } => assert!(error.contains("pragma_database_list"), "{}", error),
        other => panic!("expected a rejection, got {:?}", other),
    }

    match service.run_sql(run("SELECT heigth FROM buildings")).await {
        RunSqlResponse::Failed { error, sql } => {
            assert!(error.starts_with("Execution error"), "{}", error);
            assert!(sql.unwrap().ends_with("LIMIT 3"));
        }
        other => panic!("expected an execution error, got {:?}", other),
    }

    let tagged: ToolRequest = serde_json::from_value(json!({
        "tool": "run_sql",
        "db_path": db.display().to_string(),
        "sql": "SELECT COUNT(*) AS n FROM buildings"
    }))
    .unwrap();
    let value = serde_json::to_value(service.dispatch(tagged).await).unwrap();
    assert_eq!(value["result"]["rows"], json!([[9]]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_see_old_or_new_relation_during_reload() {
    let dir = scratch_dir();
    let db = dir.join("geo.db");
    let nine = write_buildings(&dir);
    let one = write_single_point(&dir);
    let service = service(StubProvider::new(&["SELECT 1"]));
    let first = service
        .load_spatial_dataset(load_request(&nine, &db, "places", MaterializationMode::Table))
        .await;
    assert!(matches!(first, LoadSpatialDatasetResponse::Loaded { rows: 9, .. }));

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        let engine = SqliteEngine::new(db.clone());
        tokio::spawn(async move {
            let mut counts = Vec::new();
            while !done.load(Ordering::SeqCst) || counts.len() < 20 {
                let result = engine
                    .run_query("SELECT COUNT(*) FROM places", &ExecuteOptions::default())
                    .await
                    .map_err(|e| e.to_string())?;
                counts.push(result.rows[0][0].clone());
            }
            Ok::<_, String>(counts)
        })
    };

    let modes = [MaterializationMode::View, MaterializationMode::Table];
    for round in 0..8 {
        let source = if round % 2 == 0 { &one } else { &nine };
        let loaded = service
            .load_spatial_dataset(load_request(source, &db, "places", modes[round % 2]))
            .await;
        assert!(matches!(loaded, LoadSpatialDatasetResponse::Loaded { .. }), "{:?}", loaded);
    }
    done.store(true, Ordering::SeqCst);

    let counts = reader.await.unwrap().unwrap();
    assert!(counts.len() >= 20);
    for count in counts {
        assert!(count == json!(9) || count == json!(1), "partial relation seen: {}", count);
    }
}
