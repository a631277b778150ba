//! End-to-end pipeline runs against a local HTTP server.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use pulsewatch::db::models::CreateMonitor;
use pulsewatch::db::{monitor_service, result_service};
use pulsewatch::pipeline::{run_check, run_pipeline};
use pulsewatch::stages::{StageSpec, Status};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn json_server(body: &'static str) -> String {
    serve(Router::new().route(
        "/",
        get(move || async move {
            ([(axum::http::header::CONTENT_TYPE, "application/json")], body)
        }),
    ))
    .await
}

fn temp_pool() -> (tempfile::TempDir, pulsewatch::db::DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.duckdb");
    let pool = pulsewatch::db::open_pool(path.to_str().unwrap()).unwrap();
    (dir, pool)
}

#[tokio::test]
async fn minimal_http_monitor_is_up() {
    let url = serve(Router::new().route("/", get(|| async { "ok" }))).await;
    let outcome = run_pipeline(&url, &[StageSpec::new("http")], false).await;

    assert_eq!(outcome.status, Status::Up);
    assert_eq!(outcome.message, "http: 200");
    let http = outcome.details.get("http").unwrap();
    assert_eq!(http.get("status_code"), Some(&json!(200)));
}

#[tokio::test]
async fn chained_json_assertion_is_up() {
    let url = json_server(r#"{"count": 42}"#).await;
    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("jq")
            .with_option("expr", ".count")
            .with_option("store_as", "c"),
        StageSpec::new("threshold")
            .with_option("value", "$c")
            .with_option("min", 10)
            .with_option("max", 100),
    ];
    let outcome = run_pipeline(&url, &pipeline, false).await;

    assert_eq!(outcome.status, Status::Up);
    for name in ["http", "jq", "threshold"] {
        assert!(outcome.details.contains_key(name), "missing {name}");
        assert!(outcome.message.contains(&format!("{name}: ")));
    }
    let values = outcome.details.get("_values").unwrap();
    assert_eq!(values.get("c"), Some(&json!(42)));
}

#[tokio::test]
async fn failed_assertion_short_circuits() {
    let url = json_server(r#"{"count": 42}"#).await;
    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("jq")
            .with_option("expr", ".count")
            .with_option("store_as", "c"),
        StageSpec::new("threshold")
            .with_option("value", "$c")
            .with_option("min", 100),
        StageSpec::new("contains").with_option("pattern", "count"),
    ];
    let outcome = run_pipeline(&url, &pipeline, false).await;

    assert_eq!(outcome.status, Status::Down);
    assert!(
        outcome.message.ends_with("threshold: out_of_range"),
        "{}",
        outcome.message
    );
    // The stage after the failure never ran.
    assert!(!outcome.details.contains_key("contains"));
    assert!(!outcome.message.contains("contains:"));
}

#[tokio::test]
async fn transport_failure_is_down_with_details() {
    // Nothing listens on port 1.
    let outcome = run_pipeline("http://127.0.0.1:1", &[StageSpec::new("http")], false).await;

    assert_eq!(outcome.status, Status::Down);
    assert_eq!(outcome.message, "http: transport_error");
    let http = outcome.details.get("http").unwrap();
    assert!(http.get("error").is_some());
}

#[tokio::test]
async fn error_status_degrades_but_does_not_short_circuit() {
    let url = serve(Router::new().route(
        "/",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "it broke") }),
    ))
    .await;
    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("contains").with_option("pattern", "broke"),
    ];
    let outcome = run_pipeline(&url, &pipeline, false).await;

    // 5xx is degraded, the contains stage still runs and passes; worst-of
    // keeps the aggregate degraded.
    assert_eq!(outcome.status, Status::Degraded);
    assert!(outcome.details.contains_key("contains"));
    assert!(outcome.message.starts_with("http: 500"));
}

#[tokio::test]
async fn redirect_chain_is_recorded() {
    let url = serve(Router::new().route(
        "/",
        get(|| async {
            (
                StatusCode::FOUND,
                [(axum::http::header::LOCATION, "/final")],
            )
                .into_response()
        }),
    ).route("/final", get(|| async { "landed" })))
    .await;
    let outcome = run_pipeline(&url, &[StageSpec::new("http")], false).await;

    assert_eq!(outcome.status, Status::Up);
    let http = outcome.details.get("http").unwrap();
    let redirects = http.get("redirects").unwrap().as_array().unwrap();
    assert_eq!(redirects.len(), 1);
    assert_eq!(redirects[0].get("status"), Some(&json!(302)));
    assert!(http
        .get("final_url")
        .and_then(|v| v.as_str())
        .unwrap()
        .ends_with("/final"));
}

#[tokio::test]
async fn header_extraction_from_live_response() {
    let url = json_server(r#"{"ok": true}"#).await;
    let pipeline = vec![
        StageSpec::new("http"),
        StageSpec::new("header")
            .with_option("pattern", "Content-Type")
            .with_option("store_as", "ct"),
    ];
    let outcome = run_pipeline(&url, &pipeline, false).await;

    assert_eq!(outcome.status, Status::Up);
    let values = outcome.details.get("_values").unwrap();
    assert_eq!(values.get("ct"), Some(&json!("application/json")));
}

#[tokio::test]
async fn run_check_persists_result_and_mirror() {
    let url = serve(Router::new().route("/", get(|| async { "ok" }))).await;
    let (_dir, pool) = temp_pool();
    let monitor = monitor_service::create_monitor(
        pool.clone(),
        CreateMonitor {
            name: "g".to_string(),
            url: url.clone(),
            pipeline: vec![StageSpec::new("http")],
            interval: 30,
            schedule: None,
            enabled: true,
            tags: Vec::new(),
        },
    )
    .await
    .unwrap();

    let record = run_check(pool.clone(), &monitor, 3, false).await.unwrap();
    assert_eq!(record.status, Status::Up);
    assert!(record.elapsed_ms > 0.0);

    let stored = result_service::list_results(pool.clone(), &monitor.id, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, record.id);

    let mirrored = monitor_service::get_monitor(pool, &monitor.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.last_status, Some(Status::Up));
    assert!(mirrored.last_check.is_some());
}
