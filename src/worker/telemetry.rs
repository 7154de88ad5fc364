//! Periodic heartbeat and metrics emission
//!
//! Two independent loops run on the intervals the controller returned in
//! `register.ack`. Both stop when the session's token is cancelled or the
//! outbound queue is gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::executor::CommandExecutor;
use crate::metrics::SharedMetricsCollector;
use crate::protocol::{Message, Payload};

/// Intervals handed out by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryIntervals {
    pub heartbeat: Duration,
    pub metrics: Duration,
}

impl TelemetryIntervals {
    /// Milliseconds from `register.ack`; zero falls back to the defaults
    pub fn from_millis(heartbeat_ms: u64, metrics_ms: u64) -> Self {
        let or_default =
            |ms: u64, default: u64| Duration::from_millis(if ms == 0 { default } else { ms });
        Self {
            heartbeat: or_default(heartbeat_ms, 30_000),
            metrics: or_default(metrics_ms, 60_000),
        }
    }
}

pub struct TelemetryProducer {
    node_id: String,
    collector: SharedMetricsCollector,
    executor: Arc<dyn CommandExecutor>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl TelemetryProducer {
    pub fn new(
        node_id: impl Into<String>,
        collector: SharedMetricsCollector,
        executor: Arc<dyn CommandExecutor>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            collector,
            executor,
            outbound,
        }
    }

    /// Start both loops; they end when `cancel` fires
    pub fn spawn(
        self,
        intervals: TelemetryIntervals,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(
            "Starting telemetry: heartbeat={}ms, metrics={}ms",
            intervals.heartbeat.as_millis(),
            intervals.metrics.as_millis()
        );
        let producer = Arc::new(self);

        let heartbeat = {
            let producer = Arc::clone(&producer);
            tokio::spawn(run_loop(
                "heartbeat",
                intervals.heartbeat,
                cancel.clone(),
                move || {
                    let producer = Arc::clone(&producer);
                    async move { producer.send_heartbeat().await }
                },
            ))
        };

        let metrics = tokio::spawn(run_loop("metrics", intervals.metrics, cancel, move || {
            let producer = Arc::clone(&producer);
            async move { producer.send_metrics().await }
        }));

        vec![heartbeat, metrics]
    }

    /// Returns false once the session is gone
    async fn send_heartbeat(&self) -> bool {
        let active = self
            .executor
            .deployments()
            .iter()
            .filter(|d| d.running)
            .count() as u32;
        let heartbeat = self.collector.write().await.heartbeat(&self.node_id, active);
        trace!(
            "Heartbeat: cpu={:.1}% ram={:.1}% active={}",
            heartbeat.cpu_usage,
            heartbeat.ram_usage,
            active
        );
        self.outbound
            .send(Message::new(Payload::TelemetryHeartbeat(heartbeat)))
            .is_ok()
    }

    async fn send_metrics(&self) -> bool {
        let metrics = self.collector.write().await.metrics(&self.node_id);
        self.outbound
            .send(Message::new(Payload::TelemetryMetrics(metrics)))
            .is_ok()
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut emit: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{} loop cancelled", name);
                break;
            }
            _ = ticker.tick() => {
                if !emit().await {
                    debug!("{} loop stopping, session closed", name);
                    break;
                }
            }
        }
    }
}
