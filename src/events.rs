//! Typed publish/subscribe for engine events.
//!
//! Events flow through a fixed pipeline: filter predicates (any veto drops
//! the event) -> ordered middleware (each may transform or suppress) ->
//! listener fan-out (sequential by default, parallel when configured).
//! Listener failures are isolated per listener unless strict mode is set.
//! A bounded history ring buffer supports replay and debugging, and
//! `wait_for` resolves on the first matching event within a timeout.

use crate::error::{ErrorCode, Result, WatermarkError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// The nine event categories the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Instance lifecycle: created, updated, destroyed, paused, resumed
    Lifecycle,
    Render,
    Security,
    Animation,
    Responsive,
    Visibility,
    Performance,
    Error,
    Custom,
}

/// A single engine event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WatermarkEvent {
    pub event_type: EventType,
    /// Specific event name, e.g. "instance:created".
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// JSON payload carried alongside the event.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl WatermarkEvent {
    pub fn new(event_type: EventType, name: impl Into<String>) -> Self {
        Self {
            event_type,
            name: name.into(),
            instance_id: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Identifier returned by `on`/`once`, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Listener = Arc<dyn Fn(&WatermarkEvent) -> Result<()> + Send + Sync>;
type FilterFn = Arc<dyn Fn(&WatermarkEvent) -> bool + Send + Sync>;
type Middleware = Arc<dyn Fn(WatermarkEvent) -> Option<WatermarkEvent> + Send + Sync>;

struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

/// Delivery configuration for the event manager.
#[derive(Debug, Clone)]
pub struct EventManagerConfig {
    /// Ring-buffer capacity for event history.
    pub history_capacity: usize,
    /// Deliver to listeners concurrently instead of in registration order.
    pub parallel_delivery: bool,
    /// Stop delivery and surface the first listener error.
    pub strict: bool,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 128,
            parallel_delivery: false,
            strict: false,
        }
    }
}

/// Typed pub/sub with middleware, filters, history and `wait_for`.
pub struct EventManager {
    listeners: RwLock<HashMap<EventType, Vec<Registration>>>,
    filters: RwLock<Vec<FilterFn>>,
    middleware: RwLock<Vec<Middleware>>,
    history: Mutex<VecDeque<WatermarkEvent>>,
    broadcast_tx: broadcast::Sender<WatermarkEvent>,
    config: EventManagerConfig,
}

impl EventManager {
    pub fn new(config: EventManagerConfig) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            broadcast_tx: broadcast::channel(256).0,
            config,
        }
    }

    /// Register a listener for an event type.
    pub fn on<F>(&self, event_type: EventType, listener: F) -> ListenerId
    where
        F: Fn(&WatermarkEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.register(event_type, listener, false)
    }

    /// Register a listener removed automatically after its first delivery.
    pub fn once<F>(&self, event_type: EventType, listener: F) -> ListenerId
    where
        F: Fn(&WatermarkEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.register(event_type, listener, true)
    }

    fn register<F>(&self, event_type: EventType, listener: F, once: bool) -> ListenerId
    where
        F: Fn(&WatermarkEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        self.listeners
            .write()
            .entry(event_type)
            .or_default()
            .push(Registration {
                id,
                listener: Arc::new(listener),
                once,
            });
        id
    }

    /// Remove a listener. Returns false when the id is unknown.
    pub fn off(&self, event_type: EventType, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(registrations) = listeners.get_mut(&event_type) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|reg| reg.id != id);
        registrations.len() != before
    }

    /// Number of registered listeners for a type.
    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners
            .read()
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Add a filter predicate; returning false vetoes delivery.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&WatermarkEvent) -> bool + Send + Sync + 'static,
    {
        self.filters.write().push(Arc::new(filter));
    }

    /// Append a middleware stage; it may transform or suppress the event.
    pub fn add_middleware<F>(&self, middleware: F)
    where
        F: Fn(WatermarkEvent) -> Option<WatermarkEvent> + Send + Sync + 'static,
    {
        self.middleware.write().push(Arc::new(middleware));
    }

    /// Run the emit pipeline for one event.
    ///
    /// In strict mode the first listener error aborts delivery to the
    /// remaining listeners and is returned; otherwise listener failures
    /// are logged and isolated.
    pub async fn emit(&self, event: WatermarkEvent) -> Result<()> {
        // Filters: any veto suppresses delivery
        {
            let filters = self.filters.read();
            if filters.iter().any(|filter| !filter(&event)) {
                return Ok(());
            }
        }

        // Middleware chain: transform or suppress
        let mut event = event;
        {
            let middleware = self.middleware.read();
            for stage in middleware.iter() {
                match stage(event) {
                    Some(transformed) => event = transformed,
                    None => return Ok(()),
                }
            }
        }

        // History ring buffer
        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.config.history_capacity {
                history.pop_front();
            }
        }

        // wait_for subscribers
        let _ = self.broadcast_tx.send(event.clone());

        // Listener fan-out; once-listeners are removed before delivery so a
        // listener emitting re-entrantly never sees itself twice.
        let targets: Vec<(ListenerId, Listener)> = {
            let mut listeners = self.listeners.write();
            let Some(registrations) = listeners.get_mut(&event.event_type) else {
                return Ok(());
            };
            let targets = registrations
                .iter()
                .map(|reg| (reg.id, reg.listener.clone()))
                .collect();
            registrations.retain(|reg| !reg.once);
            targets
        };

        if self.config.parallel_delivery {
            let mut handles = Vec::with_capacity(targets.len());
            for (id, listener) in targets {
                let event = event.clone();
                handles.push(tokio::spawn(async move {
                    (id, listener(&event))
                }));
            }
            for handle in handles {
                if let Ok((id, Err(e))) = handle.await {
                    if self.config.strict {
                        return Err(e);
                    }
                    tracing::warn!(listener = ?id, error = %e, "Event listener failed");
                }
            }
        } else {
            for (id, listener) in targets {
                if let Err(e) = listener(&event) {
                    if self.config.strict {
                        return Err(e);
                    }
                    tracing::warn!(listener = ?id, error = %e, "Event listener failed");
                }
            }
        }

        Ok(())
    }

    /// Resolve on the first event of `event_type` matching `filter`, or
    /// fail with an event-timeout error.
    pub async fn wait_for<F>(
        &self,
        event_type: EventType,
        timeout: Duration,
        filter: F,
    ) -> Result<WatermarkEvent>
    where
        F: Fn(&WatermarkEvent) -> bool,
    {
        let mut rx = self.broadcast_tx.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.event_type == event_type && filter(&event) => {
                        return Ok(event);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(WatermarkError::new(
                            ErrorCode::EventDispatchFailed,
                            "Event channel closed",
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            WatermarkError::new(
                ErrorCode::EventTimeout,
                format!("Timed out waiting for {event_type:?} event"),
            )
        })?
    }

    /// Recent events, oldest first, up to the history capacity.
    pub fn history(&self) -> Vec<WatermarkEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Drop all recorded history.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Remove every listener, filter and middleware stage.
    pub fn dispose(&self) {
        self.listeners.write().clear();
        self.filters.write().clear();
        self.middleware.write().clear();
        self.clear_history();
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(EventManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(name: &str) -> WatermarkEvent {
        WatermarkEvent::new(EventType::Lifecycle, name)
    }

    #[tokio::test]
    async fn test_emit_delivers_to_listeners() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        manager.on(EventType::Lifecycle, move |_| {
            count_a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let count_b = count.clone();
        manager.on(EventType::Lifecycle, move |_| {
            count_b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.emit(event("instance:created")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listeners_only_receive_their_type() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_inner = count.clone();
        manager.on(EventType::Security, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.emit(event("instance:created")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_off_removes_listener() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_inner = count.clone();
        let id = manager.on(EventType::Lifecycle, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(manager.off(EventType::Lifecycle, id));
        assert!(!manager.off(EventType::Lifecycle, id));

        manager.emit(event("instance:created")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_once_listener_fires_a_single_time() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_inner = count.clone();
        manager.once(EventType::Lifecycle, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.emit(event("a")).await.unwrap();
        manager.emit(event("b")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.listener_count(EventType::Lifecycle), 0);
    }

    #[tokio::test]
    async fn test_filter_veto_suppresses_delivery() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_inner = count.clone();
        manager.on(EventType::Lifecycle, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.add_filter(|event| event.name != "blocked");

        manager.emit(event("blocked")).await.unwrap();
        manager.emit(event("allowed")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_middleware_transforms_events() {
        let manager = EventManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_inner = seen.clone();
        manager.on(EventType::Lifecycle, move |event| {
            seen_inner.lock().push(event.name.clone());
            Ok(())
        });
        manager.add_middleware(|mut event| {
            event.name = format!("wrapped:{}", event.name);
            Some(event)
        });

        manager.emit(event("created")).await.unwrap();
        assert_eq!(seen.lock().as_slice(), &["wrapped:created".to_string()]);
    }

    #[tokio::test]
    async fn test_middleware_can_suppress() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_inner = count.clone();
        manager.on(EventType::Lifecycle, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.add_middleware(|_| None);

        manager.emit(event("dropped")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_failure_is_isolated() {
        let manager = EventManager::default();
        let count = Arc::new(AtomicUsize::new(0));

        manager.on(EventType::Lifecycle, |_| {
            Err(WatermarkError::new(
                ErrorCode::EventDispatchFailed,
                "listener exploded",
            ))
        });
        let count_inner = count.clone();
        manager.on(EventType::Lifecycle, move |_| {
            count_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Non-strict: the sibling still runs and emit succeeds
        manager.emit(event("created")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_propagates_listener_error() {
        let manager = EventManager::new(EventManagerConfig {
            strict: true,
            ..EventManagerConfig::default()
        });

        manager.on(EventType::Lifecycle, |_| {
            Err(WatermarkError::new(
                ErrorCode::EventDispatchFailed,
                "listener exploded",
            ))
        });

        let result = manager.emit(event("created")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let manager = EventManager::new(EventManagerConfig {
            history_capacity: 3,
            ..EventManagerConfig::default()
        });

        for i in 0..5 {
            manager.emit(event(&format!("event-{i}"))).await.unwrap();
        }

        let history = manager.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].name, "event-2");
        assert_eq!(history[2].name, "event-4");
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_match() {
        let manager = Arc::new(EventManager::default());

        let emitter = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            emitter.emit(event("ignored")).await.unwrap();
            emitter
                .emit(event("target").for_instance("wm-7"))
                .await
                .unwrap();
        });

        let found = manager
            .wait_for(EventType::Lifecycle, Duration::from_secs(1), |e| {
                e.name == "target"
            })
            .await
            .unwrap();
        assert_eq!(found.instance_id.as_deref(), Some("wm-7"));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let manager = EventManager::default();
        let result = manager
            .wait_for(EventType::Lifecycle, Duration::from_millis(20), |_| true)
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::EventTimeout);
    }

    #[tokio::test]
    async fn test_parallel_delivery_reaches_all_listeners() {
        let manager = EventManager::new(EventManagerConfig {
            parallel_delivery: true,
            ..EventManagerConfig::default()
        });
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let count_inner = count.clone();
            manager.on(EventType::Lifecycle, move |_| {
                count_inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        manager.emit(event("created")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
