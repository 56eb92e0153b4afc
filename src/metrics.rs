//! Prometheus-compatible metrics endpoint
//!
//! Exposes presence server counters in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Metrics registry for the presence server
#[derive(Debug)]
pub struct Metrics {
    // Connections
    pub connections_active: AtomicU64,
    pub connections_admitted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub clients_evicted: AtomicU64,

    // Protocol
    pub frames_received: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Parties
    pub parties_created: AtomicU64,
    pub parties_deleted: AtomicU64,
    pub party_joins: AtomicU64,
    pub party_leaves: AtomicU64,

    // Persistence
    pub profile_flush_failures: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_admitted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            clients_evicted: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            parties_created: AtomicU64::new(0),
            parties_deleted: AtomicU64::new(0),
            party_joins: AtomicU64::new(0),
            party_leaves: AtomicU64::new(0),
            profile_flush_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("presence_connections_active", "Registered client records", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("presence_connections_admitted_total", "Connections admitted", "counter",
            self.connections_admitted.load(Ordering::Relaxed));
        metric!("presence_connections_rejected_total", "Connections refused at admission", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("presence_clients_evicted_total", "Clients evicted for backpressure or duplicate identity", "counter",
            self.clients_evicted.load(Ordering::Relaxed));

        metric!("presence_frames_received_total", "Frames read from clients", "counter",
            self.frames_received.load(Ordering::Relaxed));
        metric!("presence_messages_dispatched_total", "Sub-messages handled successfully", "counter",
            self.messages_dispatched.load(Ordering::Relaxed));
        metric!("presence_protocol_errors_total", "Dropped frames and failed sub-messages", "counter",
            self.protocol_errors.load(Ordering::Relaxed));
        metric!("presence_messages_sent_total", "Frames written to clients", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("presence_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("presence_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));

        metric!("presence_parties_created_total", "Parties created", "counter",
            self.parties_created.load(Ordering::Relaxed));
        metric!("presence_parties_deleted_total", "Parties disbanded or emptied", "counter",
            self.parties_deleted.load(Ordering::Relaxed));
        metric!("presence_party_joins_total", "Party joins", "counter",
            self.party_joins.load(Ordering::Relaxed));
        metric!("presence_party_leaves_total", "Party leaves and kicks", "counter",
            self.party_leaves.load(Ordering::Relaxed));

        metric!("presence_profile_flush_failures_total", "Display state writes that failed on disconnect", "counter",
            self.profile_flush_failures.load(Ordering::Relaxed));
        metric!("presence_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "connections": {{
    "active": {},
    "admitted": {},
    "rejected": {},
    "evicted": {}
  }},
  "protocol": {{
    "frames_received": {},
    "messages_dispatched": {},
    "errors": {},
    "messages_sent": {},
    "bytes_sent": {},
    "bytes_received": {}
  }},
  "parties": {{
    "created": {},
    "deleted": {},
    "joins": {},
    "leaves": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.connections_active.load(Ordering::Relaxed),
            self.connections_admitted.load(Ordering::Relaxed),
            self.connections_rejected.load(Ordering::Relaxed),
            self.clients_evicted.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.messages_dispatched.load(Ordering::Relaxed),
            self.protocol_errors.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.parties_created.load(Ordering::Relaxed),
            self.parties_deleted.load(Ordering::Relaxed),
            self.party_joins.load(Ordering::Relaxed),
            self.party_leaves.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = render_response(&metrics, &request);

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn render_response(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json")
        || request.starts_with("GET /json")
    {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string();
    };

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
