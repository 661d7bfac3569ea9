use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use crate::api::ADMIN_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Why a session was dropped from a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutEviction {
    QueueFull,
    QueueClosed,
    WriteFailed,
}

impl FanoutEviction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::QueueClosed => "queue_closed",
            Self::WriteFailed => "write_failed",
        }
    }
}

/// Why the liveness monitor closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEviction {
    TimedOut,
    ProbeFailed,
}

impl LivenessEviction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::ProbeFailed => "probe_failed",
        }
    }
}

pub struct RelayMetrics {
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    fragments_ingested_total: AtomicU64,
    fragment_bytes_total: AtomicU64,
    fanout_evictions_total: Mutex<HashMap<&'static str, u64>>,
    liveness_evictions_total: Mutex<HashMap<&'static str, u64>>,
    persist_failures_total: AtomicU64,
    hydration_failures_total: AtomicU64,
    rooms_reaped_total: AtomicU64,
    rooms_active: AtomicU64,
    sessions_active: AtomicU64,
}

const FANOUT_EVICTIONS: [FanoutEviction; 3] =
    [FanoutEviction::QueueFull, FanoutEviction::QueueClosed, FanoutEviction::WriteFailed];
const LIVENESS_EVICTIONS: [LivenessEviction; 2] =
    [LivenessEviction::TimedOut, LivenessEviction::ProbeFailed];
/// Label shared by every document path; document ids are unbounded.
const DOCUMENT_ENDPOINT: &str = "/{doc}";
const ADMIN_ENDPOINTS: [&str; 4] = ["/healthz", "/readyz", "/metrics", "/rooms"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let fanout_evictions_total: HashMap<&'static str, u64> =
            FANOUT_EVICTIONS.iter().map(|reason| (reason.as_str(), 0)).collect();
        let liveness_evictions_total: HashMap<&'static str, u64> =
            LIVENESS_EVICTIONS.iter().map(|reason| (reason.as_str(), 0)).collect();

        Self {
            request_rate_total: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            fragments_ingested_total: AtomicU64::new(0),
            fragment_bytes_total: AtomicU64::new(0),
            fanout_evictions_total: Mutex::new(fanout_evictions_total),
            liveness_evictions_total: Mutex::new(liveness_evictions_total),
            persist_failures_total: AtomicU64::new(0),
            hydration_failures_total: AtomicU64::new(0),
            rooms_reaped_total: AtomicU64::new(0),
            rooms_active: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_opened.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_fragment_ingested(bytes: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_fragment_ingested(bytes);
    }
}

pub fn record_fanout_eviction(reason: FanoutEviction) {
    if let Some(metrics) = global_metrics() {
        metrics.record_fanout_eviction(reason);
    }
}

pub fn record_liveness_eviction(reason: LivenessEviction) {
    if let Some(metrics) = global_metrics() {
        metrics.record_liveness_eviction(reason);
    }
}

pub fn record_persist_failure() {
    if let Some(metrics) = global_metrics() {
        metrics.persist_failures_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_hydration_failure() {
    if let Some(metrics) = global_metrics() {
        metrics.hydration_failures_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_rooms_reaped(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_reaped_total.fetch_add(count as u64, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_fragment_ingested(&self, bytes: usize) {
        self.fragments_ingested_total.fetch_add(1, Ordering::SeqCst);
        self.fragment_bytes_total.fetch_add(bytes as u64, Ordering::SeqCst);
    }

    pub fn record_fanout_eviction(&self, reason: FanoutEviction) {
        increment_label_counter(&self.fanout_evictions_total, reason.as_str());
    }

    pub fn record_liveness_eviction(&self, reason: LivenessEviction) {
        increment_label_counter(&self.liveness_evictions_total, reason.as_str());
    }

    /// Gauges sampled from the room registry right before rendering.
    pub fn set_room_gauges(&self, rooms: usize, sessions: usize) {
        self.rooms_active.store(rooms as u64, Ordering::SeqCst);
        self.sessions_active.store(sessions as u64, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_opened
            .load(Ordering::SeqCst)
            .saturating_sub(self.connections_closed.load(Ordering::SeqCst))
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        append_scalar(
            &mut output,
            "relay_connections_total",
            "Total websocket connections admitted.",
            "counter",
            self.connections_opened.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_connections_active",
            "Websocket connections currently open.",
            "gauge",
            self.connections_active(),
        );
        append_scalar(
            &mut output,
            "relay_fragments_ingested_total",
            "Update fragments accepted into a room.",
            "counter",
            self.fragments_ingested_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_fragment_bytes_total",
            "Payload bytes of accepted update fragments.",
            "counter",
            self.fragment_bytes_total.load(Ordering::SeqCst),
        );

        output.push_str(
            "# HELP relay_fanout_evictions_total Sessions dropped during fan-out by reason.\n",
        );
        output.push_str("# TYPE relay_fanout_evictions_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_fanout_evictions_total",
            &self.fanout_evictions_total,
        );

        output.push_str(
            "# HELP relay_liveness_evictions_total Sessions closed by the liveness monitor by reason.\n",
        );
        output.push_str("# TYPE relay_liveness_evictions_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_liveness_evictions_total",
            &self.liveness_evictions_total,
        );

        append_scalar(
            &mut output,
            "relay_persist_failures_total",
            "Fragments the history store failed to persist.",
            "counter",
            self.persist_failures_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_hydration_failures_total",
            "Rooms created without history because the store read failed.",
            "counter",
            self.hydration_failures_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_rooms_reaped_total",
            "Idle rooms reclaimed by the reaper.",
            "counter",
            self.rooms_reaped_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_rooms_active",
            "Rooms currently loaded.",
            "gauge",
            self.rooms_active.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_sessions_active",
            "Sessions currently admitted into a room.",
            "gauge",
            self.sessions_active.load(Ordering::SeqCst),
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let Some(admin_path) = path
        .strip_prefix(ADMIN_PREFIX)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    else {
        return DOCUMENT_ENDPOINT.to_string();
    };

    if ADMIN_ENDPOINTS.contains(&admin_path) {
        path.to_string()
    } else if admin_path.starts_with("/rooms/") {
        format!("{ADMIN_PREFIX}/rooms/{{doc_id}}")
    } else {
        format!("{ADMIN_PREFIX}/{{unknown}}")
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<&'static str, u64>>, label: &'static str) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label).or_insert(0);
    *value = value.saturating_add(1);
}

fn append_scalar(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<&'static str, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (reason, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{reason=\"{}\"}} {value}\n",
            escape_label_value(reason),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
