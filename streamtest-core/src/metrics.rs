//! Prometheus metrics for continuous runs, exposed by the embedding process.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::alert::{AlertTransition, DispatchAction, DispatchStatus};
use crate::error::ErrorKind;

const DURATION_BUCKETS: &[f64] = &[
    5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

#[derive(Clone)]
pub struct TesterMetrics {
    registry: Registry,
    cycles: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
    healthy: IntGaugeVec,
    alerts: IntCounterVec,
}

impl std::fmt::Debug for TesterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesterMetrics").finish_non_exhaustive()
    }
}

impl TesterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let cycles = IntCounterVec::new(
            Opts::new("streamtest_cycles_total", "Completed test cycles"),
            &["tester"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("streamtest_cycle_failures_total", "Failed test cycles by error kind"),
            &["tester", "kind"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("streamtest_cycle_duration_seconds", "Test cycle duration")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["tester"],
        )?;
        let healthy = IntGaugeVec::new(
            Opts::new("streamtest_healthy", "1 while the last cycle succeeded"),
            &["tester"],
        )?;
        let alerts = IntCounterVec::new(
            Opts::new("streamtest_alerts_sent_total", "Delivered alert transitions"),
            &["transport", "transition"],
        )?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(healthy.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        Ok(Self {
            registry,
            cycles,
            failures,
            duration,
            healthy,
            alerts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cycle(&self, tester: &str, elapsed: Duration, failure: Option<ErrorKind>) {
        self.cycles.with_label_values(&[tester]).inc();
        self.duration
            .with_label_values(&[tester])
            .observe(elapsed.as_secs_f64());
        match failure {
            Some(kind) => {
                self.failures
                    .with_label_values(&[tester, kind.as_str()])
                    .inc();
                self.healthy.with_label_values(&[tester]).set(0);
            }
            None => self.healthy.with_label_values(&[tester]).set(1),
        }
    }

    /// Counts transports that accepted the alert.
    pub fn record_alerts(&self, transition: AlertTransition, actions: &[DispatchAction]) {
        for action in actions {
            if matches!(action.status, DispatchStatus::Executed { .. }) {
                self.alerts
                    .with_label_values(&[action.transport.as_str(), transition.as_str()])
                    .inc();
            }
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_and_failures_are_rendered() {
        let metrics = TesterMetrics::new().unwrap();
        metrics.record_cycle("vod", Duration::from_secs(42), None);
        metrics.record_cycle("vod", Duration::from_secs(90), Some(ErrorKind::Verification));
        let text = metrics.render().unwrap();
        assert!(text.contains("streamtest_cycles_total{tester=\"vod\"} 2"));
        assert!(text.contains(
            "streamtest_cycle_failures_total{kind=\"verification\",tester=\"vod\"} 1"
        ));
        assert!(text.contains("streamtest_healthy{tester=\"vod\"} 0"));
        assert!(text.contains("streamtest_cycle_duration_seconds_count{tester=\"vod\"} 2"));
    }

    #[test]
    fn only_delivered_alerts_are_counted() {
        let metrics = TesterMetrics::new().unwrap();
        let actions = vec![
            DispatchAction {
                transport: "log".into(),
                status: DispatchStatus::Executed { detail: None },
            },
            DispatchAction {
                transport: "discord".into(),
                status: DispatchStatus::Failed {
                    reason: "timed out".into(),
                },
            },
        ];
        metrics.record_alerts(AlertTransition::Failing, &actions);
        let text = metrics.render().unwrap();
        assert!(text.contains(
            "streamtest_alerts_sent_total{transition=\"failing\",transport=\"log\"} 1"
        ));
        assert!(!text.contains("transport=\"discord\""));
    }
}
