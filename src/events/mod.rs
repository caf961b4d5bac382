//! Operator-visible lifecycle events.
//!
//! Each supervisor owns its own [`EventBus`]. Handlers see every event as it
//! is published, and the bus keeps a short history for the control API.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_HISTORY: usize = 100;

const APP_TITLE: &str = "lmvisor";

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ServerStarted { address: String, models: usize },
    ModelLoading { model: String, port: u16, instance: u64 },
    ModelReady { model: String, port: u16, instance: u64 },
    ModelDegraded { model: String, port: u16, instance: u64, waited_secs: u64 },
    ModelStopped { model: String, port: u16, instance: u64 },
    ModelCrashed { model: String, port: u16, instance: u64, code: Option<i32> },
    LoadFailed { model: String, port: u16, error: String },
    AutoLoadNotFound { name: String },
    Fatal { message: String },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ServerStarted { .. } => "server_started",
            Event::ModelLoading { .. } => "model_loading",
            Event::ModelReady { .. } => "model_ready",
            Event::ModelDegraded { .. } => "model_degraded",
            Event::ModelStopped { .. } => "model_stopped",
            Event::ModelCrashed { .. } => "model_crashed",
            Event::LoadFailed { .. } => "load_failed",
            Event::AutoLoadNotFound { .. } => "auto_load_not_found",
            Event::Fatal { .. } => "fatal",
        }
    }

    pub fn title(&self) -> String {
        match self {
            Event::ServerStarted { .. } => format!("{} Server Started", APP_TITLE),
            Event::ModelLoading { .. } => "Model Loading".to_string(),
            Event::ModelReady { .. } => "Model Loaded Successfully".to_string(),
            Event::ModelDegraded { .. } => "Model Not Ready".to_string(),
            Event::ModelStopped { .. } => "Model Unloaded".to_string(),
            Event::ModelCrashed { .. } => "Model Stopped".to_string(),
            Event::LoadFailed { .. } => "Model Load Failed".to_string(),
            Event::AutoLoadNotFound { .. } => "Auto-load model not found".to_string(),
            Event::Fatal { .. } => format!("{} Server Error", APP_TITLE),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Event::ServerStarted { address, models } => {
                format!("Found {} models, control API on {}", models, address)
            }
            Event::ModelLoading { model, port, .. } => {
                format!("Model '{}' is loading\nPort: {}", model, port)
            }
            Event::ModelReady { model, port, .. } => {
                format!("Model '{}' loaded successfully\nPort: {}", model, port)
            }
            Event::ModelDegraded { model, port, waited_secs, .. } => format!(
                "Model '{}' did not report ready within {}s\nPort: {}",
                model, waited_secs, port
            ),
            Event::ModelStopped { model, port, .. } => {
                format!("Model '{}' was unloaded\nPort: {}", model, port)
            }
            Event::ModelCrashed { model, port, code, .. } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                format!("Model '{}' has stopped running\nPort: {}\nExit: {}", model, port, code)
            }
            Event::LoadFailed { model, port, error } => {
                format!("Model '{}' failed to load\nPort: {}\nError: {}", model, port, error)
            }
            Event::AutoLoadNotFound { name } => format!(
                "Model specified in config not found: {}\nThis model will not be loaded",
                name
            ),
            Event::Fatal { message } => message.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::ModelCrashed { .. } | Event::LoadFailed { .. } | Event::Fatal { .. }
        )
    }
}

/// A published event as kept in the bus history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    pub kind: &'static str,
    pub title: String,
    pub message: String,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            time: Utc::now(),
            kind: event.kind(),
            title: event.title(),
            message: event.message(),
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
    fn name(&self) -> &str;
}

pub type HandlerId = usize;

pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, Arc<dyn EventHandler>>>,
    next_id: RwLock<HandlerId>,
    history: RwLock<VecDeque<EventRecord>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let mut id = self.next_id.write();
        *id += 1;
        let handler_id = *id;
        drop(id);

        tracing::debug!("Subscribed event handler '{}'", handler.name());
        self.handlers.write().insert(handler_id, Arc::new(handler));
        handler_id
    }

    pub fn unsubscribe(&self, handler_id: HandlerId) {
        self.handlers.write().remove(&handler_id);
    }

    pub fn publish(&self, event: Event) {
        {
            let mut history = self.history.write();
            if self.capacity > 0 {
                if history.len() == self.capacity {
                    history.pop_front();
                }
                history.push_back(EventRecord::from(&event));
            }
        }

        // handlers run outside the map lock so they may publish or subscribe
        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler.handle(&event);
        }
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        self.history.read().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
        self.history.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        if event.is_error() {
            tracing::warn!(kind = event.kind(), "Event: {:?}", event);
        } else {
            tracing::info!(kind = event.kind(), "Event: {:?}", event);
        }
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Operator notification, switched on and off by the `notifications` setting.
///
/// Desktop toasts are not wired up; notifications go to the log under the
/// `lmvisor::notify` target so they can be filtered separately.
pub struct NotificationHandler {
    enabled: Arc<AtomicBool>,
}

impl NotificationHandler {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self { enabled }
    }
}

impl EventHandler for NotificationHandler {
    fn handle(&self, event: &Event) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        match event {
            // too chatty for a notification
            Event::ModelLoading { .. } => {}
            _ => tracing::info!(
                target: "lmvisor::notify",
                title = %event.title(),
                "{}",
                event.message().replace('\n', " | ")
            ),
        }
    }

    fn name(&self) -> &str {
        "notification"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: &Event) {
            self.0.lock().push(event.kind());
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    #[test]
    fn test_handlers_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(Recorder(seen.clone()));

        bus.publish(Event::AutoLoadNotFound { name: "x".to_string() });
        bus.unsubscribe(id);
        bus.publish(Event::Fatal { message: "boom".to_string() });

        assert_eq!(*seen.lock(), vec!["auto_load_not_found"]);
        assert_eq!(bus.history().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_capacity(2);
        for name in ["a", "b", "c"] {
            bus.publish(Event::AutoLoadNotFound { name: name.to_string() });
        }

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].message.contains(": b"));
        assert!(history[1].message.contains(": c"));
    }

    #[test]
    fn test_messages() {
        let ready = Event::ModelReady {
            model: "qwen".to_string(),
            port: 8080,
            instance: 1,
        };
        assert_eq!(ready.title(), "Model Loaded Successfully");
        assert_eq!(ready.message(), "Model 'qwen' loaded successfully\nPort: 8080");

        let crashed = Event::ModelCrashed {
            model: "qwen".to_string(),
            port: 8080,
            instance: 1,
            code: None,
        };
        assert!(crashed.is_error());
        assert!(crashed.message().ends_with("Exit: signal"));
    }
}
