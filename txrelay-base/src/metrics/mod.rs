pub use server::Server;

mod server;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

const NAMESPACE: &str = "relayd";

/// Metrics for the relay daemon.
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Transactions accepted into the queue
    pub transactions_admitted: IntCounter,
    /// Requests refused by the session controller, by `reason`
    pub transactions_rejected: IntCounterVec,
    /// Successful submissions to the node
    pub transactions_dispatched: IntCounter,
    /// Submissions the node refused
    pub dispatch_failures: IntCounter,
    /// Replacements created with a higher fee
    pub transactions_retried: IntCounter,
    /// Finalizations by `outcome` (`final`, `obsolete`)
    pub transactions_finalized: IntCounterVec,
    /// Next height per cursor `mode`
    pub sync_height: IntGaugeVec,
    /// Wall time of the last dispatch pass
    pub dispatch_pass_duration_ms: IntGauge,
}

impl RelayMetrics {
    /// Register every relay metric in `registry`.
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(NAMESPACE);

        let transactions_admitted = register_int_counter_with_registry!(
            opts("transactions_admitted", "Transactions accepted into the queue"),
            registry
        )?;
        let transactions_rejected = register_int_counter_vec_with_registry!(
            opts("transactions_rejected", "Client requests refused"),
            &["reason"],
            registry
        )?;
        let transactions_dispatched = register_int_counter_with_registry!(
            opts("transactions_dispatched", "Submissions accepted by the node"),
            registry
        )?;
        let dispatch_failures = register_int_counter_with_registry!(
            opts("dispatch_failures", "Submissions refused by the node"),
            registry
        )?;
        let transactions_retried = register_int_counter_with_registry!(
            opts("transactions_retried", "Replacements signed with a higher fee"),
            registry
        )?;
        let transactions_finalized = register_int_counter_vec_with_registry!(
            opts("transactions_finalized", "Transactions seen on chain"),
            &["outcome"],
            registry
        )?;
        let sync_height = register_int_gauge_vec_with_registry!(
            opts("sync_height", "Next block height per cursor mode"),
            &["mode"],
            registry
        )?;
        let dispatch_pass_duration_ms = register_int_gauge_with_registry!(
            opts(
                "dispatch_pass_duration_ms",
                "Wall time of the last dispatch pass"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            transactions_admitted,
            transactions_rejected,
            transactions_dispatched,
            dispatch_failures,
            transactions_retried,
            transactions_finalized,
            sync_height,
            dispatch_pass_duration_ms,
        })
    }

    /// Metrics registered in a private registry, for tests and tools that
    /// never serve them.
    pub fn dummy() -> prometheus::Result<Self> {
        Self::new(Registry::new())
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }
}
