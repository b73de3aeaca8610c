// In-process counters, rendered in the Prometheus text format at `/metrics`.
//
// Hot paths call the free functions, which are no-ops until `main` installs
// the process-wide instance.

use std::{
    collections::BTreeMap,
    fmt::Write,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

/// Counters keyed by their rendered label set, e.g. `kind="join-room"`.
#[derive(Default)]
struct CounterFamily(Mutex<BTreeMap<String, u64>>);

impl CounterFamily {
    fn add(&self, labels: String, delta: u64) {
        let mut values = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let value = values.entry(labels).or_insert(0);
        *value = value.saturating_add(delta);
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        write_header(out, name, "counter", help);
        let values = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (labels, value) in values.iter() {
            let _ = writeln!(out, "{name}{{{labels}}} {value}");
        }
    }
}

#[derive(Default)]
pub struct RelayMetrics {
    http_requests: CounterFamily,
    http_errors: CounterFamily,
    http_latency_ms: CounterFamily,
    ws_messages: CounterFamily,
    ws_errors: CounterFamily,
    pub(crate) presence_broadcasts_total: AtomicU64,
    pub(crate) evicted_connections_total: AtomicU64,
    pub(crate) active_connections: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn with_global(record: impl FnOnce(&RelayMetrics)) {
    if let Some(metrics) = GLOBAL_METRICS.get() {
        record(metrics);
    }
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    with_global(|metrics| metrics.record_http_request(method, path, status_code, latency_ms));
}

pub fn record_ws_message(kind: &str, is_error: bool) {
    with_global(|metrics| metrics.record_ws_message(kind, is_error));
}

pub fn increment_presence_broadcasts() {
    with_global(|metrics| {
        metrics.presence_broadcasts_total.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn increment_evicted_connections() {
    with_global(|metrics| {
        metrics.evicted_connections_total.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn connection_opened() {
    with_global(|metrics| {
        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn connection_closed() {
    with_global(|metrics| {
        metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    });
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let labels = format!(
            "method=\"{}\",endpoint=\"{}\"",
            escape(&method.to_ascii_uppercase()),
            escape(&route_template(path))
        );
        if status_code >= 400 {
            self.http_errors.add(labels.clone(), 1);
        }
        self.http_latency_ms.add(labels.clone(), latency_ms);
        self.http_requests.add(labels, 1);
    }

    /// `kind` is a frame type or a refusal label such as `oversized`.
    pub fn record_ws_message(&self, kind: &str, is_error: bool) {
        let kind = kind.trim().to_ascii_lowercase();
        let labels = format!("kind=\"{}\"", escape(if kind.is_empty() { "unknown" } else { &kind }));
        if is_error {
            self.ws_errors.add(labels.clone(), 1);
        }
        self.ws_messages.add(labels, 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        self.http_requests.render(&mut out, "relay_request_rate_total", "Total HTTP requests by endpoint.");
        self.http_errors.render(
            &mut out,
            "relay_request_errors_total",
            "Total HTTP error responses by endpoint.",
        );
        self.http_latency_ms.render(
            &mut out,
            "relay_request_duration_ms_sum",
            "Sum of HTTP request latency in milliseconds by endpoint.",
        );
        self.ws_messages.render(
            &mut out,
            "relay_ws_messages_total",
            "Inbound presence frames by kind.",
        );
        self.ws_errors.render(
            &mut out,
            "relay_ws_errors_total",
            "Inbound presence frames answered with room-error, by kind.",
        );

        write_scalar(
            &mut out,
            "relay_presence_broadcasts_total",
            "counter",
            "Total online-users broadcasts.",
            self.presence_broadcasts_total.load(Ordering::Relaxed),
        );
        write_scalar(
            &mut out,
            "relay_evicted_connections_total",
            "counter",
            "Connections dropped for a full or closed outbound queue.",
            self.evicted_connections_total.load(Ordering::Relaxed),
        );
        write_scalar(
            &mut out,
            "relay_active_connections",
            "gauge",
            "Open presence websocket connections.",
            self.active_connections.load(Ordering::Relaxed).max(0),
        );
        out
    }
}

fn write_header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn write_scalar(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    write_header(out, name, kind, help);
    let _ = writeln!(out, "{name} {value}");
}

/// Collapses numeric path segments so organisation ids do not explode the
/// label space.
fn route_template(path: &str) -> String {
    let mut template = String::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        template.push('/');
        if segment.bytes().all(|byte| byte.is_ascii_digit()) {
            template.push_str("{number}");
        } else {
            template.push_str(segment);
        }
    }
    if template.is_empty() {
        template.push('/');
    }
    template
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
