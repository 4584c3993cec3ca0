use async_trait::async_trait;
use serde_json::Value;

/// Trait for handling push events received from the signaling hub.
///
/// Each handler declares the event names it is responsible for (e.g.
/// "IncomingCall", "ReceiveOffer"). Handlers are invoked sequentially in
/// arrival order, once per received event, without de-duplication.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the event names this handler is responsible for.
    fn events(&self) -> &[&'static str];

    /// Asynchronously handle one event.
    ///
    /// Returns `true` if the event was handled, `false` if it should be
    /// logged as unhandled.
    async fn handle(&self, event: &str, arguments: &Value) -> bool;
}

/// Adapts a plain closure into a handler for a single event name.
pub struct FnEventHandler<F> {
    events: [&'static str; 1],
    callback: F,
}

impl<F> FnEventHandler<F>
where
    F: Fn(&Value) + Send + Sync,
{
    pub fn new(event: &'static str, callback: F) -> Self {
        Self {
            events: [event],
            callback,
        }
    }
}

#[async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&Value) + Send + Sync,
{
    fn events(&self) -> &[&'static str] {
        &self.events
    }

    async fn handle(&self, _event: &str, arguments: &Value) -> bool {
        (self.callback)(arguments);
        true
    }
}
