//! Prometheus-compatible metrics endpoint
//!
//! Counters and gauges are plain atomics updated from the connection tasks
//! and the scheduler. `GET /metrics` renders them in the Prometheus text
//! format; `GET /status` returns region occupancy and the online characters
//! as JSON.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::world::World;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the server
#[derive(Debug)]
pub struct Metrics {
    // Population
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub characters_online: AtomicU64,
    pub npcs_alive: AtomicU64,
    pub regions_loaded: AtomicU64,

    // Traffic
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub packets_rate_limited: AtomicU64,
    pub kicks: AtomicU64,

    // Scheduler tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            characters_online: AtomicU64::new(0),
            npcs_alive: AtomicU64::new(0),
            regions_loaded: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            packets_rate_limited: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Saturating decrement for gauges
    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Record one scheduler step and refresh the percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let at = |q: f32| sorted[((sorted.len() as f32 * q) as usize).min(sorted.len() - 1)];
            self.tick_time_p95_us.store(at(0.95), Ordering::Relaxed);
            self.tick_time_p99_us.store(at(0.99), Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                let _ = write!(
                    output,
                    "# HELP {0} {1}\n# TYPE {0} {2}\n{0} {3}\n",
                    $name, $help, $type, $value
                );
            };
        }
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);

        metric!("realm_connections_active", "Open client connections", "gauge",
            get(&self.connections_active));
        metric!("realm_connections_total", "Connections accepted since start", "counter",
            get(&self.connections_total));
        metric!("realm_connections_rejected_total", "Connections refused by admission control", "counter",
            get(&self.connections_rejected));
        metric!("realm_characters_online", "Characters in the world", "gauge",
            get(&self.characters_online));
        metric!("realm_npcs_alive", "Live NPCs", "gauge", get(&self.npcs_alive));
        metric!("realm_regions_loaded", "Loaded regions", "gauge", get(&self.regions_loaded));

        metric!("realm_packets_received_total", "Client packets decoded", "counter",
            get(&self.packets_in));
        metric!("realm_packets_sent_total", "Server packets written", "counter",
            get(&self.packets_out));
        metric!("realm_bytes_received_total", "Bytes read from clients", "counter",
            get(&self.bytes_in));
        metric!("realm_bytes_sent_total", "Bytes written to clients", "counter",
            get(&self.bytes_out));
        metric!("realm_protocol_errors_total", "Connections closed on a protocol error", "counter",
            get(&self.protocol_errors));
        metric!("realm_packets_rate_limited_total", "Packets dropped by rate limiting", "counter",
            get(&self.packets_rate_limited));
        metric!("realm_kicks_total", "Connections closed by the server", "counter",
            get(&self.kicks));

        metric!("realm_tick_time_microseconds", "Last scheduler step", "gauge",
            get(&self.tick_time_us));
        metric!("realm_tick_time_p95_microseconds", "95th percentile scheduler step", "gauge",
            get(&self.tick_time_p95_us));
        metric!("realm_tick_time_p99_microseconds", "99th percentile scheduler step", "gauge",
            get(&self.tick_time_p99_us));
        metric!("realm_tick_time_max_microseconds", "Slowest recent scheduler step", "gauge",
            get(&self.tick_time_max_us));
        metric!("realm_tick_count", "Scheduler steps run", "counter", get(&self.tick_count));
        metric!("realm_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-region occupancy gauges, appended to the registry output
pub fn region_gauges(world: &World) -> String {
    let mut output = String::from(
        "# HELP realm_region_characters Characters per region\n# TYPE realm_region_characters gauge\n",
    );
    let occupancy = world.region_occupancy();
    for r in &occupancy {
        let _ = writeln!(output, "realm_region_characters{{region=\"{}\"}} {}", r.id, r.characters);
    }
    output.push_str("# HELP realm_region_npcs NPCs per region\n# TYPE realm_region_npcs gauge\n");
    for r in &occupancy {
        let _ = writeln!(output, "realm_region_npcs{{region=\"{}\"}} {}", r.id, r.npcs);
    }
    output
}

fn status_json(world: &World) -> String {
    let body = serde_json::json!({
        "regions": world.region_occupancy(),
        "online": world.online_characters(),
    });
    body.to_string()
}

fn respond(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

fn route(request: &str, metrics: &Metrics, world: &World) -> String {
    if request.starts_with("GET /metrics") {
        let mut body = metrics.to_prometheus();
        body.push_str(&region_gauges(world));
        respond("200 OK", "text/plain; version=0.0.4", &body)
    } else if request.starts_with("GET /status") {
        respond("200 OK", "application/json", &status_json(world))
    } else if request.starts_with("GET /health") {
        respond("200 OK", "text/plain", "OK")
    } else {
        respond("404 Not Found", "text/plain", "")
    }
}

/// Serve the metrics and status endpoints until the task is aborted
pub async fn start_metrics_server(
    metrics: Arc<Metrics>,
    world: Arc<World>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();
        let world = world.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&request, &metrics, &world);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Failed to read from metrics socket {}: {}", peer, e),
            }
        });
    }
}
