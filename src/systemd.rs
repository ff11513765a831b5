//! sd_notify integration for running under a `Type=notify` unit.
//!
//! Every method is a no-op when disabled or off Linux, so callers never need
//! `#[cfg]` of their own.

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`: the bus loop and dispatcher are running.
    pub(crate) fn notify_ready(&self) {
        if self.enabled {
            self.send(NotifyKind::Ready);
        }
    }

    /// `STOPPING=1`: a termination signal was received.
    pub(crate) fn notify_stopping(&self) {
        if self.enabled {
            self.send(NotifyKind::Stopping);
        }
    }

    /// `STATUS=<msg>`, shown by `systemctl status`.
    pub(crate) fn notify_status(&self, msg: &str) {
        if self.enabled {
            self.send(NotifyKind::Status(msg));
        }
    }

    #[cfg(target_os = "linux")]
    fn send(&self, kind: NotifyKind<'_>) {
        let state = match kind {
            NotifyKind::Ready => sd_notify::NotifyState::Ready,
            NotifyKind::Stopping => sd_notify::NotifyState::Stopping,
            NotifyKind::Status(msg) => sd_notify::NotifyState::Status(msg),
        };
        if let Err(e) = sd_notify::notify(false, &[state]) {
            tracing::debug!(error = %e, ?kind, "sd_notify failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send(&self, _kind: NotifyKind<'_>) {}
}

#[derive(Debug, Clone, Copy)]
enum NotifyKind<'a> {
    Ready,
    Stopping,
    Status(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notifier_is_noop() {
        let n = SystemdNotifier::new(false);
        n.notify_ready();
        n.notify_status("SHUTDOWN_COUNTDOWN_INITIATED");
        n.notify_stopping();
    }

    #[test]
    fn test_enabled_notifier_without_socket_does_not_panic() {
        // Without NOTIFY_SOCKET this only logs at debug
        let n = SystemdNotifier::new(true);
        n.notify_ready();
        n.notify_status("SHUTDOWN_COUNTDOWN_INITIATED");
        n.notify_stopping();
    }
}
