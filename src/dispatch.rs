//! Turns inbound bus messages into countdown signals.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::InboundMessage;
use crate::countdown::Controller;

pub struct Dispatcher {
    shutdown_topic: String,
    go_payload: String,
    controller: Arc<Controller>,
}

impl Dispatcher {
    pub fn new(shutdown_topic: String, go_payload: &str, controller: Arc<Controller>) -> Self {
        Self {
            shutdown_topic,
            go_payload: go_payload.to_lowercase(),
            controller,
        }
    }

    /// `None` for topics we don't handle; otherwise whether the countdown
    /// should be running. Anything but the go payload means stop.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Option<bool> {
        if topic != self.shutdown_topic {
            return None;
        }
        let payload = String::from_utf8_lossy(payload);
        Some(payload.to_lowercase() == self.go_payload)
    }

    pub async fn dispatch(&self, msg: &InboundMessage) {
        match self.decode(&msg.topic, &msg.payload) {
            Some(active) => {
                tracing::debug!(
                    topic = %msg.topic,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    active,
                    "Trigger received"
                );
                self.controller.on_signal(active).await;
            }
            None => tracing::debug!(topic = %msg.topic, "Ignoring message on unrelated topic"),
        }
    }

    /// Handle messages one at a time until the queue closes or `token` is
    /// cancelled.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<InboundMessage>,
        token: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };
            self.dispatch(&msg).await;
        }
        tracing::debug!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ShutdownOutcome, ShutdownRunner};
    use crate::report::StatusReporter;
    use crate::systemd::SystemdNotifier;
    use crate::testutil::RecordingBus;
    use async_trait::async_trait;
    use std::time::Duration;

    const TOPIC: &str = "bluewalk/shutdown";

    struct NeverRunner;

    #[async_trait]
    impl ShutdownRunner for NeverRunner {
        async fn execute(&self) -> ShutdownOutcome {
            panic!("executor must not run in dispatcher tests");
        }
    }

    fn dispatcher() -> (Arc<RecordingBus>, Arc<Controller>, Dispatcher) {
        let bus = Arc::new(RecordingBus::default());
        let reporter = Arc::new(StatusReporter::new(
            bus.clone(),
            "bluewalk/shutdown/report".to_string(),
            Duration::from_secs(5),
            SystemdNotifier::new(false),
        ));
        let controller = Controller::new(Duration::from_secs(300), reporter, Arc::new(NeverRunner));
        let dispatcher = Dispatcher::new(TOPIC.to_string(), "yes", controller.clone());
        (bus, controller, dispatcher)
    }

    fn msg(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_decode_go_payload_case_insensitive() {
        let (_, _, d) = dispatcher();
        assert_eq!(d.decode(TOPIC, b"yes"), Some(true));
        assert_eq!(d.decode(TOPIC, b"YES"), Some(true));
        assert_eq!(d.decode(TOPIC, b"Yes"), Some(true));
    }

    #[test]
    fn test_decode_other_payloads_disarm() {
        let (_, _, d) = dispatcher();
        assert_eq!(d.decode(TOPIC, b"no"), Some(false));
        assert_eq!(d.decode(TOPIC, b""), Some(false));
        assert_eq!(d.decode(TOPIC, b" yes"), Some(false));
        assert_eq!(d.decode(TOPIC, &[0xff, 0xfe]), Some(false));
    }

    #[test]
    fn test_decode_unrelated_topic_ignored() {
        let (_, _, d) = dispatcher();
        assert_eq!(d.decode("bluewalk/other", b"yes"), None);
        assert_eq!(d.decode("bluewalk/shutdown/report", b"yes"), None);
    }

    #[test]
    fn test_configured_go_payload_is_case_folded() {
        let (_, controller, _) = dispatcher();
        let d = Dispatcher::new(TOPIC.to_string(), "GO", controller);
        assert_eq!(d.decode(TOPIC, b"go"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drives_controller_in_order() {
        let (bus, controller, d) = dispatcher();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(msg(TOPIC, "YES")).unwrap();
        tx.send(msg("bluewalk/other", "no")).unwrap();
        tx.send(msg(TOPIC, "yes")).unwrap();
        tx.send(msg(TOPIC, "no")).unwrap();
        tx.send(msg(TOPIC, "")).unwrap();
        drop(tx);

        d.run(rx, CancellationToken::new()).await;

        assert!(!controller.is_armed().await);
        assert_eq!(
            bus.events(),
            vec!["SHUTDOWN_COUNTDOWN_INITIATED", "SHUTDOWN_COUNTDOWN_ABORTED"]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_, _, d) = dispatcher();
        let (_tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        token.cancel();
        d.run(rx, token).await;
    }
}
