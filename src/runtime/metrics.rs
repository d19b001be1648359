//! Prometheus series for the worker, kept in a private registry.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

pub struct WorkerMetrics {
    registry: Registry,
    pub syncs_total: IntCounter,
    pub errors_total: IntCounter,
    pub in_progress: IntGauge,
    uptime_seconds: Gauge,
}

impl WorkerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let syncs_total = IntCounter::new("practice_sync_syncs_total", "Completed sync passes.")?;
        let errors_total = IntCounter::new(
            "practice_sync_errors_total",
            "Entity errors recorded across all passes.",
        )?;
        let in_progress =
            IntGauge::new("practice_sync_in_progress", "1 while a sync pass is running.")?;
        let uptime_seconds =
            Gauge::new("practice_sync_uptime_seconds", "Seconds since the worker started.")?;

        registry.register(Box::new(syncs_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(in_progress.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            syncs_total,
            errors_total,
            in_progress,
            uptime_seconds,
        })
    }

    /// Encode every registered series in the text exposition format.
    pub fn render(&self, uptime_secs: f64) -> prometheus::Result<String> {
        self.uptime_seconds.set(uptime_secs);
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl std::fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("syncs_total", &self.syncs_total.get())
            .field("errors_total", &self.errors_total.get())
            .field("in_progress", &self.in_progress.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_every_series() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.syncs_total.inc();
        metrics.errors_total.inc_by(3);

        let text = metrics.render(12.5).unwrap();
        assert!(text.contains("# TYPE practice_sync_syncs_total counter"));
        assert!(text.contains("practice_sync_syncs_total 1\n"));
        assert!(text.contains("practice_sync_errors_total 3\n"));
        assert!(text.contains("practice_sync_in_progress 0\n"));
        assert!(text.contains("practice_sync_uptime_seconds 12.5\n"));
    }

    #[test]
    fn test_separate_instances_do_not_collide() {
        let first = WorkerMetrics::new().unwrap();
        let second = WorkerMetrics::new().unwrap();
        first.syncs_total.inc();

        assert_eq!(second.syncs_total.get(), 0);
    }
}
