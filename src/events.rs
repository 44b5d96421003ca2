//! Lifecycle events emitted by sync connectors and the resolver.
//!
//! The [`EventBus`] is owned by the resolver instance that created it; there
//! is no process-wide dispatch. Handlers registered on the bus live as long as
//! the bus itself.
use std::sync::Mutex;

/// Lifecycle signal surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProviderEvent {
    /// The sync source delivered its first (or first after an error) valid
    /// flag set and evaluations reflect live configuration.
    Ready,
    /// A connector-level failure. The store keeps serving the last good
    /// snapshot while the connector retries.
    Error(String),
    /// The sync stream was interrupted; configuration may be out of date.
    Stale,
    /// A new flag set was stored. Carries the keys that were added, removed,
    /// or changed relative to the previous snapshot.
    ConfigurationChanged(Vec<String>),
}

type Handler = Box<dyn Fn(&ProviderEvent) + Send + Sync>;

/// Per-instance registry of lifecycle event handlers.
///
/// Connectors emit into the bus from their background threads, so handlers
/// must be `Send + Sync` and should return quickly.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    /// Create a bus with no handlers.
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Register a handler. Handlers are invoked in registration order for
    /// every subsequent [`emit`](EventBus::emit).
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .lock()
            .expect("thread holding event handler lock should not panic");
        handlers.push(Box::new(handler));
    }

    /// Deliver `event` to every registered handler.
    pub fn emit(&self, event: ProviderEvent) {
        log::trace!(target: "flagd", "emitting event: {event:?}");
        let handlers = self
            .handlers
            .lock()
            .expect("thread holding event handler lock should not panic");
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}
