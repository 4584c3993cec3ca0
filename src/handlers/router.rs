use super::traits::EventHandler;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Central router for dispatching push events to their handlers.
///
/// Several handlers may subscribe to the same event name; they run in
/// registration order.
pub struct EventRouter {
    handlers: HashMap<&'static str, Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    /// Create a new empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for every event name it declares.
    ///
    /// # Panics
    /// Panics if the same handler instance is already registered for one of
    /// its events, to catch double registration during initialization.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        for &event in handler.events() {
            let entry = self.handlers.entry(event).or_default();
            if entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                panic!("Handler for event '{}' already registered", event);
            }
            entry.push(handler.clone());
        }
    }

    /// Dispatch an event to every handler registered for it.
    ///
    /// # Returns
    /// Returns `true` if at least one handler processed the event.
    pub async fn dispatch(&self, event: &str, arguments: &Value) -> bool {
        let Some(handlers) = self.handlers.get(event) else {
            return false;
        };
        let mut handled = false;
        for handler in handlers {
            handled |= handler.handle(event, arguments).await;
        }
        handled
    }

    /// Get the number of subscribed event names (useful for testing).
    pub fn event_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
