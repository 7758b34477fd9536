use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

/// A container lifecycle event as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    /// Runtime action, e.g. `start` or `die`.
    pub action: String,
    /// Nanoseconds since the unix epoch, zero if the runtime did not say.
    pub time_nanos: i64,
}

/// Optional consumer of runtime events.
///
/// Forwarding never blocks the event listener: when the consumer lags behind, events are dropped
/// with a warning.
#[derive(Debug, Clone, Default)]
pub struct EventObserver {
    tx: Arc<Mutex<Option<mpsc::Sender<ContainerEvent>>>>,
}

impl EventObserver {
    /// Replaces the registered consumer.
    pub fn register(&self, tx: mpsc::Sender<ContainerEvent>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub fn unregister(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_registered(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn notify(&self, event: ContainerEvent) {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = tx.as_ref() else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::warn!(
                "event observer is full, dropping `{}` event of container {}",
                event.action,
                event.id
            ),
            Err(TrySendError::Closed(_)) => {
                log::info!("event observer closed, unregistering");
                tx.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> ContainerEvent {
        ContainerEvent {
            id: id.to_owned(),
            action: "start".to_owned(),
            time_nanos: 0,
        }
    }

    #[test]
    fn test_notify_without_observer() {
        let observer = EventObserver::default();
        observer.notify(event("a"));
        assert!(!observer.is_registered());
    }

    #[test]
    fn test_notify_drops_when_full() {
        let observer = EventObserver::default();
        let (tx, mut rx) = mpsc::channel(1);
        observer.register(tx);
        observer.notify(event("a"));
        observer.notify(event("b"));
        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_observer_is_unregistered() {
        let observer = EventObserver::default();
        let (tx, rx) = mpsc::channel(1);
        observer.register(tx);
        drop(rx);
        observer.notify(event("a"));
        assert!(!observer.is_registered());
    }
}
