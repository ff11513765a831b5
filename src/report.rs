//! Status events published to the report topic.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use thiserror::Error;

use crate::bus::{BusError, MessageBus};
use crate::systemd::SystemdNotifier;

/// Lifecycle events visible to bus subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    CountdownInitiated,
    CountdownAborted,
    ShutdownInitiated,
    ShutdownCompleted,
    /// Only emitted when failure reporting is enabled.
    ShutdownFailed,
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEvent::CountdownInitiated => "SHUTDOWN_COUNTDOWN_INITIATED",
            StatusEvent::CountdownAborted => "SHUTDOWN_COUNTDOWN_ABORTED",
            StatusEvent::ShutdownInitiated => "SHUTDOWN_INITIATED",
            StatusEvent::ShutdownCompleted => "SHUTDOWN_COMPLETED",
            StatusEvent::ShutdownFailed => "SHUTDOWN_FAILED",
        }
    }
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Timed out after {0:?} publishing status event")]
    Timeout(Duration),
}

/// Publishes [`StatusEvent`]s with exactly-once delivery.
///
/// Each publish is bounded by `send_timeout` so a stalled broker connection
/// cannot wedge the caller. Failures are logged here; callers may ignore the
/// returned error.
pub struct StatusReporter {
    bus: Arc<dyn MessageBus>,
    topic: String,
    send_timeout: Duration,
    systemd: SystemdNotifier,
}

impl StatusReporter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: String,
        send_timeout: Duration,
        systemd: SystemdNotifier,
    ) -> Self {
        Self {
            bus,
            topic,
            send_timeout,
            systemd,
        }
    }

    pub async fn report(&self, event: StatusEvent) -> Result<(), ReportError> {
        tracing::info!(%event, topic = %self.topic, "Reporting status");
        self.systemd.notify_status(event.as_str());

        let publish = self
            .bus
            .publish(&self.topic, event.as_str().as_bytes(), QoS::ExactlyOnce);
        match tokio::time::timeout(self.send_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(%event, error = %e, "Failed to publish status event");
                Err(e.into())
            }
            Err(_) => {
                tracing::error!(
                    %event,
                    "Publishing status event timed out after {}ms",
                    self.send_timeout.as_millis()
                );
                Err(ReportError::Timeout(self.send_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingBus;

    fn reporter(bus: Arc<RecordingBus>) -> StatusReporter {
        StatusReporter::new(
            bus,
            "bluewalk/shutdown/report".to_string(),
            Duration::from_secs(5),
            SystemdNotifier::new(false),
        )
    }

    #[test]
    fn test_event_wire_names() {
        assert_eq!(
            StatusEvent::CountdownInitiated.to_string(),
            "SHUTDOWN_COUNTDOWN_INITIATED"
        );
        assert_eq!(
            StatusEvent::CountdownAborted.to_string(),
            "SHUTDOWN_COUNTDOWN_ABORTED"
        );
        assert_eq!(StatusEvent::ShutdownInitiated.to_string(), "SHUTDOWN_INITIATED");
        assert_eq!(StatusEvent::ShutdownCompleted.to_string(), "SHUTDOWN_COMPLETED");
        assert_eq!(StatusEvent::ShutdownFailed.to_string(), "SHUTDOWN_FAILED");
    }

    #[tokio::test]
    async fn test_report_publishes_exactly_once_to_report_topic() {
        let bus = Arc::new(RecordingBus::default());
        reporter(bus.clone())
            .report(StatusEvent::ShutdownInitiated)
            .await
            .unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "bluewalk/shutdown/report");
        assert_eq!(published[0].payload, "SHUTDOWN_INITIATED");
        assert_eq!(published[0].qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_report_surfaces_bus_error() {
        let bus = Arc::new(RecordingBus::failing());
        let result = reporter(bus.clone())
            .report(StatusEvent::CountdownInitiated)
            .await;
        assert!(matches!(result, Err(ReportError::Bus(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_times_out_on_stalled_bus() {
        let bus = Arc::new(RecordingBus::stalled());
        let result = reporter(bus).report(StatusEvent::CountdownAborted).await;
        assert!(matches!(result, Err(ReportError::Timeout(d)) if d == Duration::from_secs(5)));
    }
}
