//! Mock crossing service
//!
//! Serves `GET /crossings` for local testing of the monitor.
//!
//! Behavior:
//! 1. Listens on configurable port (default 8080)
//! 2. Responds with the crossings from `--file`, or a built-in sample set
//! 3. Every `--rate-limit-every` N-th request gets a 429, with a
//!    `Retry-After` header when `--retry-after` is given
//! 4. `--fail-every` N-th request gets a 503 with an error body
//!
//! Usage:
//!   cargo run --bin mock-crossings -- --port 8080 --rate-limit-every 5 --retry-after 20
//!
//! Point the monitor at it with `[service] base_url = "http://localhost:8080"`.

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock-crossings")]
#[command(about = "Mock crossing status service for local simulation")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// JSON file holding the `{"crossings": [...]}` envelope to serve
    #[arg(short, long)]
    file: Option<String>,

    /// Answer every N-th request with 429 (0 disables)
    #[arg(long, default_value = "0")]
    rate_limit_every: u64,

    /// Retry-After seconds sent with 429 responses (omitted when not set)
    #[arg(long)]
    retry_after: Option<u64>,

    /// Answer every N-th request with 503 (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: u64,
}

/// Crossings around Delray Beach, FL
const SAMPLE_CROSSINGS: &str = r#"{
  "crossings": [
    {
      "id": "rail-atlantic",
      "name": "Atlantic Ave",
      "type": "RAIL",
      "status": "OPEN",
      "lastUpdated": "2025-04-20T12:00:00Z",
      "location": {"latitude": 26.4615, "longitude": -80.0728}
    },
    {
      "id": "rail-linton",
      "name": "Linton Blvd",
      "type": "RAIL",
      "status": "WARNING",
      "lastUpdated": 1745150400,
      "location": {"latitude": 26.4381, "longitude": -80.0756},
      "estimatedDelay": 3
    },
    {
      "id": "bridge-george-bush",
      "name": "George Bush Blvd Bridge",
      "type": "DRAW_BRIDGE",
      "status": "CLOSED",
      "lastUpdated": "2025-04-20T11:58:30",
      "location": {"latitude": 26.4707, "longitude": -80.0634},
      "estimatedDelay": 6,
      "nextUpdate": "2025-04-20T12:15:00Z"
    }
  ],
  "lastUpdated": "2025-04-20T12:00:05Z"
}"#;

struct MockState {
    body: String,
    requests: AtomicU64,
    rate_limit_every: u64,
    retry_after: Option<u64>,
    fail_every: u64,
}

fn every(n: u64, count: u64) -> bool {
    n > 0 && count % n == 0
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if (req.method(), req.uri().path()) != (&Method::GET, "/crossings") {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail"));
    }

    let count = state.requests.fetch_add(1, Ordering::Relaxed) + 1;

    if every(state.rate_limit_every, count) {
        println!("[MOCK] #{} -> 429 (retry-after {:?})", count, state.retry_after);
        let mut builder = Response::builder().status(StatusCode::TOO_MANY_REQUESTS);
        if let Some(secs) = state.retry_after {
            builder = builder.header("Retry-After", secs.to_string());
        }
        return Ok(builder
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail"));
    }

    if every(state.fail_every, count) {
        println!("[MOCK] #{} -> 503", count);
        return Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(
                r#"{"error":"maintenance","message":"Crossing feed temporarily unavailable"}"#,
            )))
            .expect("static response should not fail"));
    }

    println!("[MOCK] #{} -> 200", count);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(state.body.clone())))
        .expect("static response should not fail"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let body = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => SAMPLE_CROSSINGS.to_string(),
    };
    // Catch malformed fixture files at start-up rather than in the monitor
    crossing_monitor::io::crossing_api::decode_crossings(body.as_bytes())?;

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║              Mock Crossing Service                       ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║ Port:            {:>5}                                   ║", args.port);
    println!("║ Source:          {:<38} ║", args.file.as_deref().unwrap_or("built-in sample"));
    println!("║ 429 every:       {:>5}                                   ║", args.rate_limit_every);
    println!("║ 503 every:       {:>5}                                   ║", args.fail_every);
    println!("╚══════════════════════════════════════════════════════════╝");

    let state = Arc::new(MockState {
        body,
        requests: AtomicU64::new(0),
        rate_limit_every: args.rate_limit_every,
        retry_after: args.retry_after,
        fail_every: args.fail_every,
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    loop {
        let (stream, _peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("[MOCK] HTTP error: {}", e);
            }
        });
    }
}
