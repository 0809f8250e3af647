//! Integration tests for the agent to collector pipeline
//!
//! These tests run a real collector on a loopback port and point an
//! orchestrator at a fake Docker containers directory.

use logferry::collector::{CollectorServer, ServerConfig};
use logferry::logs::{AgentConfig, DockerConfigResolver, LogOrchestrator, OffsetStore};
use logferry::metrics::AgentMetrics;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const CONTAINER_ID: &str = "0a1b2c3d4e5f";

struct Pipeline {
    temp_dir: TempDir,
    collector_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn start() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let server = CollectorServer::bind(ServerConfig {
            log_path: temp_dir.path().join("collected"),
            listen: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let collector_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));

        Self {
            temp_dir,
            collector_addr,
            cancel,
        }
    }

    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            containers_dir: self.temp_dir.path().join("containers"),
            offsets_dir: self.temp_dir.path().join("offsets"),
            server: self.collector_addr.to_string(),
            buffer_size: 6,
            retry_backoff_ms: 50,
            poll_interval_ms: 10,
            ..AgentConfig::default()
        }
    }

    fn orchestrator(&self) -> LogOrchestrator {
        let config = self.agent_config();
        let store = OffsetStore::new(&config.offsets_dir).unwrap();
        let metrics = Arc::new(AgentMetrics::unregistered().unwrap());
        LogOrchestrator::new(config, store, Arc::new(DockerConfigResolver::new(true)), metrics)
    }

    fn add_container(&self, id: &str, name: &str, docker_type: &str) -> PathBuf {
        let dir = self.temp_dir.path().join("containers").join(id);
        fs::create_dir_all(&dir).unwrap();
        let config = serde_json::json!({
            "ID": id,
            "Name": format!("/{}", name),
            "Config": { "Labels": { "io.kubernetes.docker.type": docker_type } }
        });
        fs::write(dir.join("config.v2.json"), config.to_string()).unwrap();
        let log = dir.join(format!("{}-json.log", id));
        fs::write(&log, "").unwrap();
        log
    }

    fn collected(&self, identity: &str) -> PathBuf {
        self.temp_dir.path().join("collected").join(format!("{}.log", identity))
    }
}

fn append_docker_line(log: &Path, message: &str) {
    let line = serde_json::json!({
        "log": format!("{}\n", message),
        "stream": "stdout",
        "time": "2024-01-01T00:00:00.000000000Z"
    });
    let mut file = OpenOptions::new().append(true).open(log).unwrap();
    writeln!(file, "{}", line).unwrap();
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_lines_are_forwarded_and_offset_committed() {
    let pipeline = Pipeline::start().await;
    let log = pipeline.add_container(CONTAINER_ID, "k8s_web_web-0", "container");
    pipeline.add_container("ffffffffffff", "k8s_POD_web-0", "podsandbox");
    append_docker_line(&log, "one");
    append_docker_line(&log, "two");

    let orchestrator = pipeline.orchestrator();
    orchestrator.refresh().await.unwrap();
    assert_eq!(orchestrator.tracked_count().await, 1);

    let collected = pipeline.collected("k8s_web_web-0");
    wait_until("collected log", || {
        fs::read_to_string(&collected).unwrap_or_default() == "one\ntwo\n"
    })
    .await;

    let store = OffsetStore::new(pipeline.temp_dir.path().join("offsets")).unwrap();
    let log_len = fs::metadata(&log).unwrap().len();
    wait_until("committed offset", || store.get(&log).ok() == Some(log_len)).await;

    assert!(!pipeline.collected("k8s_POD_web-0").exists());

    orchestrator.shutdown().await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offset() {
    let pipeline = Pipeline::start().await;
    let log = pipeline.add_container(CONTAINER_ID, "k8s_api_api-0", "container");
    append_docker_line(&log, "one");
    append_docker_line(&log, "two");

    let collected = pipeline.collected("k8s_api_api-0");
    let store = OffsetStore::new(pipeline.temp_dir.path().join("offsets")).unwrap();

    let first = pipeline.orchestrator();
    first.refresh().await.unwrap();
    let log_len = fs::metadata(&log).unwrap().len();
    wait_until("committed offset", || store.get(&log).ok() == Some(log_len)).await;
    first.shutdown().await;

    append_docker_line(&log, "three");

    let second = pipeline.orchestrator();
    second.refresh().await.unwrap();
    wait_until("resumed log", || {
        fs::read_to_string(&collected).unwrap_or_default() == "one\ntwo\nthree\n"
    })
    .await;

    second.shutdown().await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_removed_container_drops_offset() {
    let pipeline = Pipeline::start().await;
    let log = pipeline.add_container(CONTAINER_ID, "k8s_job_job-0", "container");
    append_docker_line(&log, "done");
    append_docker_line(&log, "exit");

    let store = OffsetStore::new(pipeline.temp_dir.path().join("offsets")).unwrap();
    let orchestrator = pipeline.orchestrator();
    orchestrator.refresh().await.unwrap();
    let log_len = fs::metadata(&log).unwrap().len();
    wait_until("committed offset", || store.get(&log).ok() == Some(log_len)).await;

    fs::remove_dir_all(log.parent().unwrap()).unwrap();
    orchestrator.refresh().await.unwrap();

    assert_eq!(orchestrator.tracked_count().await, 0);
    assert!(store.get(&log).is_err());

    orchestrator.shutdown().await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_cli_requires_server_address() {
    let temp_dir = TempDir::new().unwrap();
    let binary_path = env!("CARGO_BIN_EXE_logferry");

    let output = Command::new(binary_path)
        .arg("agent")
        .arg("--offsets-dir")
        .arg(temp_dir.path())
        .output()
        .await
        .expect("Failed to run logferry agent");

    assert!(!output.status.success());
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        combined.contains("--server argument isn't set"),
        "unexpected output: {}",
        combined
    );
}

#[tokio::test]
async fn test_cli_server_help() {
    let binary_path = env!("CARGO_BIN_EXE_logferry");

    let output = Command::new(binary_path)
        .arg("server")
        .arg("--help")
        .output()
        .await
        .expect("Failed to run logferry server --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--log-path"));
    assert!(stdout.contains("--max-age"));
}
