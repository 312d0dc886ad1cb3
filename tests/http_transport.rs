use std::net::TcpListener;
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Wait for HTTP server to become ready by polling health endpoint
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let client = reqwest::Client::new();
    let health_url = format!("http://127.0.0.1:{}/health", port);
    let start = std::time::Instant::now();

    while start.elapsed().as_secs() < timeout_secs {
        if let Ok(response) = client.get(&health_url).send().await {
            if response.status().is_success() {
                return true;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Start the built server binary in stream mode
fn start_server(port: u16, db_path: &str, extra: &[&str]) -> Child {
    let port = port.to_string();
    let mut args = vec!["-s", "-p", port.as_str(), "--db-path", db_path];
    args.extend_from_slice(extra);
    Command::new(env!("CARGO_BIN_EXE_graph-memory-mcp-rs"))
        .args(&args)
        .spawn()
        .expect("Failed to start server")
}

fn stop_server(mut server: Child) {
    server.kill().expect("Failed to kill server");
    let _ = server.wait();
}

#[tokio::test]
async fn test_http_server_health_check() {
    let port = find_available_port();
    let db_dir = TempDir::new().expect("Failed to create tempdir");
    let db_path = db_dir.path().join("test.db");
    let server = start_server(port, db_path.to_str().unwrap(), &[]);

    assert!(
        wait_for_server(port, 30).await,
        "Server failed to start within timeout"
    );

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body = response.text().await.expect("Failed to read response");
    assert_eq!(body, "OK");

    stop_server(server);
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_mcp_initialize_over_http() {
    let port = find_available_port();
    let db_dir = TempDir::new().expect("Failed to create tempdir");
    let db_path = db_dir.path().join("test.db");
    let server = start_server(port, db_path.to_str().unwrap(), &["--search-mode", "ranked"]);

    assert!(
        wait_for_server(port, 30).await,
        "Server failed to start within timeout"
    );

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/mcp", port))
        .header("Accept", "application/json, text/event-stream")
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "http-test", "version": "0.0.0" }
            }
        }))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body = response.text().await.expect("Failed to read response");
    assert!(body.contains("graph-memory-mcp-rs"), "unexpected body: {body}");

    stop_server(server);
}

#[tokio::test]
async fn test_custom_port_and_bind_without_fts() {
    let port = find_available_port();
    let db_dir = TempDir::new().expect("Failed to create tempdir");
    let db_path = db_dir.path().join("test.db");
    let server = start_server(
        port,
        db_path.to_str().unwrap(),
        &["-b", "127.0.0.1", "--no-fts"],
    );

    assert!(
        wait_for_server(port, 30).await,
        "Server failed to start within timeout"
    );

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    stop_server(server);
}

#[tokio::test]
async fn test_server_with_logging() {
    let port = find_available_port();
    let db_dir = TempDir::new().expect("Failed to create tempdir");
    let db_path = db_dir.path().join("test.db");
    let log_file = db_dir.path().join(format!("test-memory-{}.log", port));

    let server = start_server(
        port,
        db_path.to_str().unwrap(),
        &["-l", log_file.to_str().unwrap()],
    );

    assert!(
        wait_for_server(port, 30).await,
        "Server failed to start within timeout"
    );

    // Give logger time to flush
    sleep(Duration::from_millis(500)).await;
    stop_server(server);

    let contents = std::fs::read_to_string(&log_file).expect("Log file was not created");
    assert!(contents.contains("knowledge graph ready"), "log was: {contents}");
}

#[test]
fn test_rejects_database_without_db_extension() {
    let db_dir = TempDir::new().expect("Failed to create tempdir");
    let bad_path = db_dir.path().join("graph.sqlite");

    let status = Command::new(env!("CARGO_BIN_EXE_graph-memory-mcp-rs"))
        .args(["-s", "-p", "0", "--db-path", bad_path.to_str().unwrap()])
        .status()
        .expect("Failed to run server");

    assert!(!status.success());
    assert!(!bad_path.exists());
}
