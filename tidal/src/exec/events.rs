//! Lifecycle notifications for tool invocations.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

use super::progress::ProgressEvent;
use crate::error::ErrorKind;

/// Kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Error,
    Terminated,
}

/// A lifecycle notification of one invocation.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started {
        command_line: Vec<String>,
    },
    Progress(ProgressEvent),
    Completed {
        command_line: Vec<String>,
        exit_code: i32,
    },
    Error {
        command_line: Vec<String>,
        kind: ErrorKind,
        message: String,
    },
    /// The process was killed after exceeding its deadline.
    Terminated {
        command_line: Vec<String>,
        timeout_secs: f64,
    },
}

impl ExecutionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::Progress(_) => EventKind::Progress,
            Self::Completed { .. } => EventKind::Completed,
            Self::Error { .. } => EventKind::Error,
            Self::Terminated { .. } => EventKind::Terminated,
        }
    }
}

/// A registered listener. Returned errors are logged and swallowed.
pub type Listener = Arc<dyn Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Registry of listeners keyed by event kind.
///
/// Listener failures, including panics, never reach the invocation that
/// emitted the event.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: &ExecutionEvent) {
        let kind = event.kind();
        // Clone out so listeners may register further listeners.
        let listeners = match self.listeners.read().get(&kind) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener for {} event failed: {:#}", kind, e),
                Err(_) => warn!("Listener for {} event panicked", kind),
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<_, _> = listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started() -> ExecutionEvent {
        ExecutionEvent::Started {
            command_line: vec!["ffmpeg".into(), "-version".into()],
        }
    }

    #[test]
    fn test_listeners_receive_only_their_kind() {
        let bus = EventBus::new();
        let started_count = Arc::new(AtomicUsize::new(0));
        let completed_count = Arc::new(AtomicUsize::new(0));

        let c = started_count.clone();
        bus.on(EventKind::Started, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = completed_count.clone();
        bus.on(EventKind::Completed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&started());
        bus.emit(&started());

        assert_eq!(started_count.load(Ordering::SeqCst), 2);
        assert_eq!(completed_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::Started, |_| anyhow::bail!("listener error"));
        bus.on(EventKind::Started, |_| panic!("listener panic"));
        let c = delivered.clone();
        bus.on(EventKind::Started, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&started());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Started), 3);
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Terminated.to_string(), "terminated");
        let event = ExecutionEvent::Progress(ProgressEvent::default());
        assert_eq!(event.kind(), EventKind::Progress);
    }
}
