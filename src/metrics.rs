// src/metrics.rs

// NOTE: when the observability feature is disabled these helpers compile to
// nothing; callers never gate their call sites.

/// One scheduler tick started.
pub fn increment_tick(scheduler: &'static str) {
    #[cfg(feature = "observability")]
    metrics::counter!("lendwatch_ticks_total", 1, "scheduler" => scheduler);
    #[cfg(not(feature = "observability"))]
    let _ = scheduler;
}

/// One outbound RPC attempt.
pub fn increment_rpc_call(chain: &'static str, method: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("lendwatch_rpc_calls_total", 1, "chain" => chain, "method" => method.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = (chain, method);
}

/// A chain skipped for a tick after its fetch failed.
pub fn increment_chain_failure(chain: &'static str) {
    #[cfg(feature = "observability")]
    metrics::counter!("lendwatch_chain_failures_total", 1, "chain" => chain);
    #[cfg(not(feature = "observability"))]
    let _ = chain;
}

/// One delivery attempt resolved, by final status.
pub fn increment_delivery(kind: &'static str, status: &'static str) {
    #[cfg(feature = "observability")]
    metrics::counter!("lendwatch_deliveries_total", 1, "kind" => kind, "status" => status);
    #[cfg(not(feature = "observability"))]
    let _ = (kind, status);
}

/// Installs the Prometheus exporter when observability is compiled in.
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    Ok(())
}
