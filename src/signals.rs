use tokio::sync::{broadcast, watch};

/// Coarse host lifecycle, ordered from least to most alive.
///
/// `Started` is enough for reconnect-triggered revalidation; polling without
/// `refresh_when_hidden` requires `Active` (foregrounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostLifecycle {
    Detached,
    Started,
    Active,
}

/// Abstract signal sources injected into the engine.
///
/// The engine never detects focus, connectivity or lifecycle itself; the
/// embedding application owns the detection mechanism and forwards events
/// here. Setters deduplicate, so a `changed()` wakeup on the online or
/// lifecycle channel always means a real transition.
pub struct Signals {
    focus: broadcast::Sender<()>,
    online: watch::Sender<bool>,
    lifecycle: watch::Sender<HostLifecycle>,
}

impl Signals {
    /// New signal sources, initially online and active.
    pub fn new() -> Self {
        let (focus, _) = broadcast::channel(16);
        let (online, _) = watch::channel(true);
        let (lifecycle, _) = watch::channel(HostLifecycle::Active);
        Signals {
            focus,
            online,
            lifecycle,
        }
    }

    /// The application regained focus.
    pub fn focus_regained(&self) {
        let _ = self.focus.send(());
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
    }

    pub fn set_lifecycle(&self, lifecycle: HostLifecycle) {
        self.lifecycle.send_if_modified(|current| {
            if *current != lifecycle {
                *current = lifecycle;
                true
            } else {
                false
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn lifecycle(&self) -> HostLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn focus_events(&self) -> broadcast::Receiver<()> {
        self.focus.subscribe()
    }

    pub fn online_changes(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn lifecycle_changes(&self) -> watch::Receiver<HostLifecycle> {
        self.lifecycle.subscribe()
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_ordering() {
        assert!(HostLifecycle::Detached < HostLifecycle::Started);
        assert!(HostLifecycle::Started < HostLifecycle::Active);
    }

    #[tokio::test]
    async fn test_online_setter_dedups() {
        let signals = Signals::new();
        let mut changes = signals.online_changes();

        signals.set_online(true); // already online, must not notify
        assert!(!changes.has_changed().unwrap());

        signals.set_online(false);
        assert!(changes.has_changed().unwrap());
        changes.mark_unchanged();
        assert!(!signals.is_online());
    }
}
