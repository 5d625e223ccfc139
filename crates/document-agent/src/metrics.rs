use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static COMMAND_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static PROVIDER_CALLS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static CHUNKS_INDEXED: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("commands_total", "Orchestrator commands by name and outcome"),
        &["cmd", "status"],
    ) {
        let counter = COMMAND_COUNTER.get_or_init(|| counter);
        REGISTRY.register(Box::new(counter.clone())).ok();
    }

    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("provider_calls_total", "Outbound embedding, generation and crawl calls"),
        &["kind"],
    ) {
        let counter = PROVIDER_CALLS.get_or_init(|| counter);
        REGISTRY.register(Box::new(counter.clone())).ok();
    }

    if let Ok(gauge) = IntGauge::new("active_connections", "Open session connections") {
        let gauge = ACTIVE_CONNECTIONS.get_or_init(|| gauge);
        REGISTRY.register(Box::new(gauge.clone())).ok();
    }

    if let Ok(counter) = IntCounter::new("chunks_indexed_total", "Document chunks embedded and stored") {
        let counter = CHUNKS_INDEXED.get_or_init(|| counter);
        REGISTRY.register(Box::new(counter.clone())).ok();
    }
}

pub fn inc_command(cmd: &str, status: &str) {
    if let Some(counter) = COMMAND_COUNTER.get() {
        counter.with_label_values(&[cmd, status]).inc();
    }
}

pub fn inc_provider_call(kind: &str) {
    if let Some(counter) = PROVIDER_CALLS.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn inc_connections() {
    if let Some(gauge) = ACTIVE_CONNECTIONS.get() {
        gauge.inc();
    }
}

pub fn dec_connections() {
    if let Some(gauge) = ACTIVE_CONNECTIONS.get() {
        gauge.dec();
    }
}

pub fn add_chunks_indexed(count: usize) {
    if let Some(counter) = CHUNKS_INDEXED.get() {
        counter.inc_by(count as u64);
    }
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(feature = "cli")]
pub async fn get_metrics() -> impl axum::response::IntoResponse {
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        init_metrics();
        init_metrics();
        inc_command("project.new", "ok");
        inc_provider_call("embed");
        add_chunks_indexed(3);

        let text = render();
        assert!(text.contains("commands_total"));
        assert!(text.contains("provider_calls_total"));
        assert!(text.contains("chunks_indexed_total"));
    }
}
