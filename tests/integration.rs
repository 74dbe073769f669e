//! End-to-end tests driving a live server over real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tallyd::config::Config;
use tallyd::metrics::Metrics;
use tallyd::processor::RequestProcessor;
use tallyd::router::build_router;
use tallyd::server::{BlockingServer, MultiplexServer, Server};

struct TestServer {
    server: Arc<MultiplexServer>,
    addr: String,
    metrics: Arc<Metrics>,
    processor: Arc<RequestProcessor>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
    }
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        worker_threads: 4,
        ..Config::default()
    }
}

fn start_server(mutate: impl FnOnce(&mut Config)) -> TestServer {
    let mut config = test_config();
    mutate(&mut config);
    let metrics = Arc::new(Metrics::new());
    let processor = Arc::new(RequestProcessor::new());
    let router = Arc::new(build_router(Arc::clone(&metrics), Arc::clone(&processor)));
    let server = Arc::new(MultiplexServer::new(
        config,
        Arc::clone(&metrics),
        Arc::clone(&processor),
        router,
    ));
    server.start().expect("server should start");
    let addr = server.address();
    TestServer {
        server,
        addr,
        metrics,
        processor,
    }
}

/// A raw HTTP client that keeps one connection open and parses responses by
/// Content-Length, so pipelined and keep-alive flows can be asserted on.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write failed");
    }

    fn request(&mut self, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
        self.send_raw(raw_request(method, path, body).as_bytes());
        self.read_response()
    }

    fn read_response(&mut self) -> (u16, String) {
        loop {
            if let Some((status, body, consumed)) = try_parse_response(&self.buf) {
                self.buf.drain(..consumed);
                return (status, body);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read failed");
            assert!(n > 0, "connection closed before a full response arrived");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// True when the server has closed the connection.
    fn reads_eof(&mut self) -> bool {
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return false;
                }
                Err(_) => return true,
            }
        }
    }
}

fn raw_request(method: &str, path: &str, body: Option<&str>) -> String {
    match body {
        Some(b) => format!(
            "{} {} HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            b.len(),
            b
        ),
        None => format!("{} {} HTTP/1.1\r\nHost: test\r\n\r\n", method, path),
    }
}

fn try_parse_response(buf: &[u8]) -> Option<(u16, String, usize)> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..header_end]).ok()?;
    let status: u16 = head.split_whitespace().nth(1)?.parse().ok()?;
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let total = header_end + 4 + content_length;
    if buf.len() < total {
        return None;
    }
    let body = String::from_utf8_lossy(&buf[header_end + 4..total]).to_string();
    Some((status, body, total))
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).expect("response body should be JSON")
}

// ---- Scenarios ----

#[test]
fn s1_health() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    let (status, body) = client.request("GET", "/health", None);
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"status":"healthy","success":true}"#);
}

#[test]
fn s2_process_ok_updates_sums() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    let (status, body) = client.request(
        "POST",
        "/process",
        Some(r#"{"id":123,"name":"Test User","phone":"+1234567890","number":42}"#),
    );
    assert_eq!(status, 200);
    let doc = json(&body);
    assert_eq!(doc["number"], 43);
    assert_eq!(doc["success"], true);
    assert_eq!(doc["name"], "Test User");
    assert_eq!(ts.processor.total_sum(), 42);
    assert_eq!(ts.processor.client_sum("user_123"), 42);

    let (status, body) = client.request("GET", "/numbers/sum", None);
    assert_eq!(status, 200);
    assert_eq!(json(&body)["total_numbers_sum"], 42);
}

#[test]
fn s3_process_missing_field_fails() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    let failed_before = ts.metrics.requests_failed();
    let (status, body) = client.request(
        "POST",
        "/process",
        Some(r#"{"id":1,"name":"x","phone":"y"}"#),
    );
    assert_eq!(status, 400);
    let doc = json(&body);
    assert_eq!(doc["success"], false);
    assert!(doc["error"].as_str().unwrap().contains("number"));
    assert_eq!(ts.processor.total_sum(), 0);
    assert_eq!(ts.metrics.requests_failed(), failed_before + 1);
}

#[test]
fn s4_unknown_route_is_404() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    let (status, body) = client.request("GET", "/does-not-exist", None);
    assert_eq!(status, 404);
    assert_eq!(body, r#"{"error":"Endpoint not found","success":false}"#);
}

#[test]
fn s5_sum_all_after_process() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    client.request(
        "POST",
        "/process",
        Some(r#"{"id":123,"name":"Test User","phone":"+1234567890","number":42}"#),
    );
    let (status, body) = client.request("GET", "/numbers/sum-all", None);
    assert_eq!(status, 200);
    let doc = json(&body);
    assert_eq!(doc["success"], true);
    assert_eq!(doc["clients"]["user_123"], 42);
    assert_eq!(doc["total"], 42);
}

#[test]
fn s6_pipelined_requests_answer_in_order() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    let first = raw_request(
        "POST",
        "/process",
        Some(r#"{"id":1,"name":"a","phone":"p","number":1}"#),
    );
    let second = raw_request(
        "POST",
        "/process",
        Some(r#"{"id":2,"name":"b","phone":"p","number":2}"#),
    );
    client.send_raw(format!("{}{}", first, second).as_bytes());

    let (status1, body1) = client.read_response();
    let (status2, body2) = client.read_response();
    assert_eq!(status1, 200);
    assert_eq!(status2, 200);
    assert_eq!(json(&body1)["number"], 2);
    assert_eq!(json(&body1)["id"], 1);
    assert_eq!(json(&body2)["number"], 3);
    assert_eq!(json(&body2)["id"], 2);
}

#[test]
fn keep_alive_reuses_one_connection() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    for i in 0..10 {
        let body = format!(r#"{{"id":7,"name":"n","phone":"p","number":{}}}"#, i);
        let (status, _) = client.request("POST", "/process", Some(&body));
        assert_eq!(status, 200);
    }
    assert_eq!(ts.processor.client_sum("user_7"), (0..10).sum::<i64>());
    assert_eq!(ts.metrics.connections_total(), 1);
    assert_eq!(ts.metrics.active_connections(), 1);
}

#[test]
fn connection_counters_balance() {
    let ts = start_server(|_| {});
    {
        let mut client = Client::connect(&ts.addr);
        let (status, _) = client.request("GET", "/health", None);
        assert_eq!(status, 200);
    }
    // The dropped client sends FIN; the event loop should notice promptly
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while ts.metrics.active_connections() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(ts.metrics.connections_total(), 1);
    assert_eq!(ts.metrics.active_connections(), 0);
}

#[test]
fn metrics_render_is_idempotent_without_activity() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    client.request("GET", "/health", None);

    let (_, first) = client.request("GET", "/metrics", None);
    let (_, second) = client.request("GET", "/metrics", None);
    let counters = |s: &str| -> Vec<String> {
        s.lines()
            .filter(|l| {
                (l.starts_with("tallyd_requests_")
                    || l.starts_with("tallyd_bytes_")
                    || l.starts_with("tallyd_connections_total"))
                    && !l.contains("per_second")
            })
            .map(|l| l.to_string())
            .collect()
    };
    let first_counters = counters(&first);
    assert!(!first_counters.is_empty());
    assert_eq!(first_counters, counters(&second));
    assert!(first.contains("# TYPE tallyd_requests_total counter"));
}

#[test]
fn malformed_request_gets_400_and_connection_survives() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    client.send_raw(b"NOT-AN-HTTP-REQUEST\r\n\r\n");
    let (status, body) = client.read_response();
    assert_eq!(status, 400);
    assert_eq!(json(&body)["success"], false);

    // The connection is still usable afterwards
    let (status, _) = client.request("GET", "/health", None);
    assert_eq!(status, 200);
}

#[test]
fn oversized_request_closes_connection_without_response() {
    let ts = start_server(|cfg| {
        cfg.max_read_buffer_bytes = 256;
    });
    let mut client = Client::connect(&ts.addr);
    let huge = "x".repeat(1000);
    client.send_raw(raw_request("POST", "/process", Some(&huge)).as_bytes());
    assert!(client.reads_eof(), "server should close the connection");
    assert!(client.buf.is_empty(), "no partial response expected");
}

#[test]
fn idle_connection_is_reaped() {
    let ts = start_server(|cfg| {
        cfg.idle_timeout_secs = 1;
        cfg.reap_interval_secs = 1;
    });
    let mut client = Client::connect(&ts.addr);
    let (status, _) = client.request("GET", "/health", None);
    assert_eq!(status, 200);

    std::thread::sleep(Duration::from_millis(2500));
    assert!(client.reads_eof(), "idle connection should have been closed");
    assert_eq!(ts.metrics.active_connections(), 0);
}

#[test]
fn write_interest_toggling_disabled_still_serves() {
    let ts = start_server(|cfg| {
        cfg.toggle_write_interest = false;
    });
    let mut client = Client::connect(&ts.addr);
    let (status, body) = client.request("GET", "/health", None);
    assert_eq!(status, 200);
    assert_eq!(json(&body)["success"], true);
}

#[test]
fn graceful_stop_closes_connections() {
    let ts = start_server(|_| {});
    let mut client = Client::connect(&ts.addr);
    client.request("GET", "/health", None);
    ts.server.stop();
    assert!(!ts.server.is_running());
    assert!(client.reads_eof());
}

#[test]
fn blocking_server_serves_same_contract() {
    let mut config = test_config();
    config.server_type = tallyd::config::ServerKind::Blocking;
    let metrics = Arc::new(Metrics::new());
    let processor = Arc::new(RequestProcessor::new());
    let router = Arc::new(build_router(Arc::clone(&metrics), Arc::clone(&processor)));
    let server = BlockingServer::new(config, Arc::clone(&metrics), router);
    server.start().expect("blocking server should start");

    let mut client = Client::connect(&server.address());
    let (status, body) = client.request("GET", "/health", None);
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"status":"healthy","success":true}"#);

    let (status, body) = client.request(
        "POST",
        "/process",
        Some(r#"{"id":9,"name":"n","phone":"p","number":5}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(json(&body)["number"], 6);
    assert_eq!(processor.total_sum(), 5);

    server.stop();
}
