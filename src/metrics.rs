//! Prometheus metrics and the scrape endpoint.
//!
//! Kernel-side counters are cumulative per-CPU sums; the stats sampler
//! writes their totals into gauges. Userspace counters are incremented where
//! the work happens.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Kernel event statistics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Bytes written to the ring buffer, by event type.
    pub static ref EVENT_BYTES: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_event_bytes",
        "Bytes of events written to the ring buffer",
        &["event_type"]
    ).expect("failed to register EVENT_BYTES metric");

    pub static ref EVENT_COUNT: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_event_count",
        "Events written to the ring buffer",
        &["event_type"]
    ).expect("failed to register EVENT_COUNT metric");

    /// Events the kernel failed to reserve ring buffer space for.
    pub static ref EVENT_LOST: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_event_lost",
        "Events lost because the ring buffer was full",
        &["event_type"]
    ).expect("failed to register EVENT_LOST metric");

    /// Approver and discarder activity, by event type and counter.
    pub static ref FILTER_STATS: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_filter",
        "In-kernel filtering decisions",
        &["event_type", "counter"]
    ).expect("failed to register FILTER_STATS metric");

    pub static ref SYSCALL_CACHE_STATS: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_syscall_cache",
        "Syscall cache activity",
        &["event_type", "counter"]
    ).expect("failed to register SYSCALL_CACHE_STATS metric");

    /// Dentry resolver and eRPC failures, by reason.
    pub static ref RESOLVER_ERRORS: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_resolver_errors",
        "Dentry resolver failures",
        &["reason"]
    ).expect("failed to register RESOLVER_ERRORS metric");

    pub static ref ERPC_KERNEL_ERRORS: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_erpc_errors",
        "eRPC requests the kernel could not serve",
        &["reason"]
    ).expect("failed to register ERPC_KERNEL_ERRORS metric");

    pub static ref NET_STATS: IntGaugeVec = register_int_gauge_vec!(
        "secwatch_kernel_network",
        "Classifier activity",
        &["counter"]
    ).expect("failed to register NET_STATS metric");

    /// Bytes pending in the ring buffer at the last sample.
    pub static ref RINGBUF_USAGE: IntGauge = register_int_gauge!(
        "secwatch_ringbuf_usage_bytes",
        "Ring buffer bytes not yet consumed"
    ).expect("failed to register RINGBUF_USAGE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref PROBES_ATTACHED: IntGauge = register_int_gauge!(
        "secwatch_probes_attached",
        "Probes attached to the running kernel"
    ).expect("failed to register PROBES_ATTACHED metric");

    pub static ref PROBES_SKIPPED: IntGauge = register_int_gauge!(
        "secwatch_probes_skipped",
        "Probes whose targets are missing from the running kernel"
    ).expect("failed to register PROBES_SKIPPED metric");

    pub static ref EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "secwatch_events_received_total",
        "Events decoded by the agent",
        &["event_type"]
    ).expect("failed to register EVENTS_RECEIVED metric");

    pub static ref DECODE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "secwatch_decode_errors_total",
        "Ring buffer records the agent could not decode",
        &["reason"]
    ).expect("failed to register DECODE_ERRORS metric");

    /// Userspace path resolutions that failed, by reason.
    pub static ref ERPC_ERRORS: IntCounterVec = register_int_counter_vec!(
        "secwatch_erpc_errors_total",
        "eRPC requests that failed in the agent",
        &["reason"]
    ).expect("failed to register ERPC_ERRORS metric");

    pub static ref PATH_CACHE_HITS: IntCounter = register_int_counter!(
        "secwatch_path_cache_hits_total",
        "Path lookups served from the agent cache"
    ).expect("failed to register PATH_CACHE_HITS metric");

    pub static ref PATH_CACHE_MISSES: IntCounter = register_int_counter!(
        "secwatch_path_cache_misses_total",
        "Path lookups that went to the kernel"
    ).expect("failed to register PATH_CACHE_MISSES metric");
}

/// Registers the gauges with zero values so a scrape before the first
/// sample still lists them.
pub fn init() {
    PROBES_ATTACHED.set(0);
    PROBES_SKIPPED.set(0);
    RINGBUF_USAGE.set(0);
}

/// Current registry contents in the text exposition format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .header("content-type", TextEncoder::new().format_type())
            .body(Full::new(Bytes::from(encode()))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n"))),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serves `/metrics` on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(handle))
                .await
            {
                debug!(%peer, error = %e, "metrics connection closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_registry_lists_agent_metrics() {
        init();
        PROBES_ATTACHED.set(3);
        EVENTS_RECEIVED.with_label_values(&["open"]).inc();
        let text = encode();
        assert!(text.contains("secwatch_probes_attached 3"));
        assert!(text.contains("secwatch_events_received_total{event_type=\"open\"}"));
    }
}
