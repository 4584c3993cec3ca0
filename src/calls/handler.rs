//! Routes call push events from the signaling hub into the engine.

use super::engine::CallEngine;
use super::signaling::CallSignal;
use crate::handlers::traits::EventHandler;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

/// Handler for every call-scoped push event.
pub struct CallSignalHandler {
    engine: CallEngine,
}

impl CallSignalHandler {
    pub fn new(engine: CallEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for CallSignalHandler {
    fn events(&self) -> &[&'static str] {
        &CallSignal::EVENT_NAMES
    }

    async fn handle(&self, event: &str, arguments: &Value) -> bool {
        let signal = match CallSignal::from_event(event, arguments) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(target: "Call/Handler", "Failed to parse {event}: {e}");
                return false;
            }
        };
        debug!(target: "Call/Handler", "Received {event} for {:?}", signal.call_id());
        self.engine.deliver_signal(signal);
        true
    }
}
