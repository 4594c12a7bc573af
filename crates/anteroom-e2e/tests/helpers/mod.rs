#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

pub const ADMIN_KEY: &str = "e2e-admin-key";

/// A running `anteroom-server` instance for e2e testing.
///
/// Spawns the server binary on a random port against the locally running
/// store and event bus (see the docker hints on each test). The process is
/// killed when this struct is dropped.
pub struct TestServer {
    child: Option<Child>,
    base_url: String,
}

impl TestServer {
    pub fn start() -> Self {
        let port = free_port();
        let base_url = format!("http://127.0.0.1:{port}");

        let binary = server_binary();
        assert!(
            binary.exists(),
            "anteroom-server binary not found at {binary:?}. Run `cargo build` first."
        );

        let child = Command::new(&binary)
            .env("ANTEROOM_PORT", port.to_string())
            .env("ANTEROOM_FINGERPRINT_SALT", "e2e-salt")
            .env("ANTEROOM_ADMIN_KEY", ADMIN_KEY)
            .env("ANTEROOM_CLEANUP_INTERVAL_S", "1")
            .env("RUST_LOG", "info")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("start anteroom-server");

        // Poll TCP until the server is reachable.
        let addr = format!("127.0.0.1:{port}");
        let start = std::time::Instant::now();
        let mut connected = false;
        while start.elapsed() < Duration::from_secs(10) {
            if std::net::TcpStream::connect(&addr).is_ok() {
                connected = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(
            connected,
            "anteroom-server did not become reachable at {addr} within 10s \
             (is Redis running on 127.0.0.1:6379?)"
        );

        Self {
            child: Some(child),
            base_url,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Create a queue via the admin API; names are randomized per test run so
/// state in the shared store never collides.
pub async fn create_queue(
    client: &reqwest::Client,
    server: &TestServer,
    admission_rate: f64,
) -> String {
    let name = format!("e2e-{}", uuid::Uuid::now_v7().simple());
    let response = client
        .post(server.url("/api/v1/admin/queues"))
        .header("x-admin-key", ADMIN_KEY)
        .json(&serde_json::json!({
            "name": name,
            "target_url": "https://origin.example/checkout",
            "admission_rate": admission_rate,
        }))
        .send()
        .await
        .expect("create queue");
    assert_eq!(response.status(), 201, "queue create failed");
    name
}

/// Find a free TCP port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to free port");
    listener.local_addr().unwrap().port()
}

/// Resolve the path to the anteroom-server binary in the workspace target
/// directory.
fn server_binary() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates/
    path.pop(); // workspace root
    path.push("target");
    path.push("debug");
    path.push("anteroom-server");
    path
}
