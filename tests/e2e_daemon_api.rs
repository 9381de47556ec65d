//! Boots the real daemon binary against a scratch data directory and drives
//! the scheduled-task API over HTTP. No container runtime is touched: these
//! scenarios stop at definition CRUD, validation, and observability.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

struct DaemonHarness {
    child: Child,
    api_base: String,
    _data_dir: tempfile::TempDir,
}

impl DaemonHarness {
    async fn spawn() -> TestResult<Self> {
        let api_port = find_free_port()?;
        let data_dir = tempfile::tempdir()?;
        let log_path = data_dir.path().join("daemon.log");
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_err = log_file.try_clone()?;

        let bin = PathBuf::from(env!("CARGO_BIN_EXE_drydock"));
        let child = Command::new(bin)
            .arg("daemon-run")
            .arg("--api-host")
            .arg("127.0.0.1")
            .arg("--api-port")
            .arg(api_port.to_string())
            .env("DRYDOCK_DATA_DIR", data_dir.path())
            .env("DRYDOCK_INTERNAL_TOKEN", "e2e-token")
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()?;

        let harness = Self {
            child,
            api_base: format!("http://127.0.0.1:{api_port}/api"),
            _data_dir: data_dir,
        };
        harness.wait_until_ready().await?;
        Ok(harness)
    }

    async fn wait_until_ready(&self) -> TestResult<()> {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            let response = client
                .get(format!("{}/sandboxes", self.api_base))
                .header("x-drydock-internal-token", "e2e-token")
                .send()
                .await;
            if let Ok(response) = response {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err("daemon did not become ready within 10s".into())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> TestResult<serde_json::Value> {
        let client = reqwest::Client::new();
        let mut builder = client
            .request(method, format!("{}{}", self.api_base, path))
            .header("x-drydock-internal-token", "e2e-token");
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await?;
        Ok(response.json().await?)
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[tokio::test]
async fn scheduled_task_crud_over_http() -> TestResult<()> {
    let daemon = DaemonHarness::spawn().await?;

    // Invalid cron is rejected synchronously and nothing is persisted.
    let rejected = daemon
        .request(
            reqwest::Method::POST,
            "/tasks",
            Some(serde_json::json!({
                "name": "bad",
                "cron": "every other day",
                "prompt": "hi"
            })),
        )
        .await?;
    assert_eq!(rejected["success"], false);

    // A valid definition lands with a computed future fire time.
    let created = daemon
        .request(
            reqwest::Method::POST,
            "/tasks",
            Some(serde_json::json!({
                "name": "nightly-digest",
                "cron": "0 3 * * *",
                "timezone": "Asia/Shanghai",
                "prompt": "Summarize yesterday's activity",
                "reuse_session": true
            })),
        )
        .await?;
    assert_eq!(created["success"], true, "create failed: {created}");
    let task_id = created["task"]["id"].as_str().unwrap().to_string();
    assert!(created["task"]["session_id"].as_str().is_some());

    let listed = daemon.request(reqwest::Method::GET, "/tasks", None).await?;
    assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);

    // Update the cadence; the fire time is recomputed.
    let old_fire = created["task"]["next_fire_at"].as_str().unwrap().to_string();
    let updated = daemon
        .request(
            reqwest::Method::PATCH,
            &format!("/tasks/{task_id}"),
            Some(serde_json::json!({ "cron": "30 6 * * 1" })),
        )
        .await?;
    assert_eq!(updated["success"], true);
    assert_ne!(updated["task"]["next_fire_at"].as_str().unwrap(), old_fire);

    // Nothing is due yet, so a manual tick dispatches nothing.
    let tick = daemon
        .request(reqwest::Method::POST, "/dispatch/tick", None)
        .await?;
    assert_eq!(tick["success"], true);
    assert_eq!(tick["dispatched"], 0);

    // Soft delete removes it from the API surface.
    let deleted = daemon
        .request(reqwest::Method::DELETE, &format!("/tasks/{task_id}"), None)
        .await?;
    assert_eq!(deleted["success"], true);
    let listed = daemon.request(reqwest::Method::GET, "/tasks", None).await?;
    assert!(listed["tasks"].as_array().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
async fn pool_stats_and_permission_answers_respond() -> TestResult<()> {
    let daemon = DaemonHarness::spawn().await?;

    let stats = daemon
        .request(reqwest::Method::GET, "/sandboxes", None)
        .await?;
    assert_eq!(stats["success"], true);
    assert_eq!(stats["total_active"], 0);

    // Answering a nonexistent permission request fails without a 500.
    let answer = daemon
        .request(
            reqwest::Method::POST,
            &format!("/requests/{}/answer", uuid::Uuid::new_v4()),
            Some(serde_json::json!({ "answers": {"approved": "true"} })),
        )
        .await?;
    assert_eq!(answer["success"], false);

    Ok(())
}
