//! Connection driver metrics.

use std::fmt::Write;

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Connections handed to a driver"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Connections currently being driven"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "http1_requests", description = "HTTP/1.1 requests parsed")]
pub static HTTP1_REQUESTS: Counter = Counter::new();

#[metric(
    name = "http1_rejected",
    description = "HTTP/1.1 requests answered with a 4xx/5xx without dispatch"
)]
pub static HTTP1_REJECTED: Counter = Counter::new();

#[metric(name = "http2_streams", description = "HTTP/2 requests dispatched")]
pub static HTTP2_STREAMS: Counter = Counter::new();

#[metric(
    name = "http2_stream_resets",
    description = "HTTP/2 streams reset by either side"
)]
pub static HTTP2_STREAM_RESETS: Counter = Counter::new();

#[metric(
    name = "bodies_too_large",
    description = "Requests refused because the body exceeded the configured limit"
)]
pub static BODIES_TOO_LARGE: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Connection-fatal protocol errors")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Bytes read from clients")]
pub static BYTES_RECEIVED: Counter = Counter::new();

/// Keeps [`CONNECTIONS_ACTIVE`] accurate for the life of a connection.
pub struct ActiveConnection(());

impl ActiveConnection {
    pub fn new() -> Self {
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();
        Self(())
    }
}

impl Default for ActiveConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        CONNECTIONS_ACTIVE.decrement();
    }
}

/// Render every registered counter and gauge as `name value` lines.
pub fn render() -> String {
    let mut output = String::with_capacity(1024);

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if name.is_empty() {
            continue;
        }

        match metric.value() {
            Some(metriken::Value::Counter(v)) => {
                let _ = writeln!(output, "{} {}", name, v);
            }
            Some(metriken::Value::Gauge(v)) => {
                let _ = writeln!(output, "{} {}", name, v);
            }
            _ => {}
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connection_guard() {
        let before = CONNECTIONS_ACCEPTED.value();
        {
            let _guard = ActiveConnection::new();
            assert!(CONNECTIONS_ACTIVE.value() >= 1);
        }
        assert!(CONNECTIONS_ACCEPTED.value() > before);
    }

    #[test]
    fn test_render_lists_metrics() {
        HTTP1_REQUESTS.increment();
        let output = render();
        assert!(output.contains("http1_requests "));
        assert!(output.contains("connections_active "));
    }
}
