//! Tamper detection and protection for watermark instances.
//!
//! Per instance, [`SecurityManager::enable_protection`] starts a watcher
//! set chosen by the configured level:
//!
//! - **basic**: structural-removal watching (host mutation records)
//! - **intermediate**: adds style-tamper polling and console-activity
//!   watching
//! - **advanced**: adds the devtools window-delta heuristic, network
//!   watching and element-identity obfuscation
//!
//! Console and network watching are fed by explicit instrumentation call
//! sites ([`InstrumentedConsole`], [`InstrumentedFetch`]) the embedder
//! routes its own wrappers through; no global object is patched.
//!
//! Detection is decoupled from remediation: a violation is recorded,
//! delivered to callbacks, logged and forwarded to the error manager,
//! where a pluggable recovery strategy may act on it. No DOM repair
//! happens here.

use crate::config::{SecurityConfig, SecurityLevel};
use crate::error::{ErrorCode, ErrorSeverity, Result, WatermarkError};
use crate::error_manager::ErrorManager;
use crate::events::{EventManager, EventType, WatermarkEvent};
use crate::host::{HostPage, MutationKind, NodeId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kinds of detected tampering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    ElementRemoved,
    StyleTampered,
    ConsoleActivity,
    DevtoolsOpened,
    NetworkInterception,
}

impl ViolationKind {
    /// Default severity per kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ElementRemoved | Self::StyleTampered => ErrorSeverity::High,
            Self::DevtoolsOpened | Self::ConsoleActivity => ErrorSeverity::Medium,
            Self::NetworkInterception => ErrorSeverity::Critical,
        }
    }
}

/// One recorded violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub instance_id: String,
    pub kind: ViolationKind,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Watcher flavors; removal watching is observation-based, the rest are
/// poll- or channel-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherKind {
    ElementRemoval,
    StyleTamper,
    ConsoleActivity,
    DevtoolsHeuristic,
    NetworkInterception,
}

/// Explicit resource handle for one running watcher.
///
/// `release` aborts the underlying task exactly once; further calls are
/// no-ops.
pub struct WatcherHandle {
    pub id: String,
    pub kind: WatcherKind,
    pub instance_id: String,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    released: AtomicBool,
}

impl WatcherHandle {
    fn new(kind: WatcherKind, instance_id: String, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            id: format!("watcher-{}", Uuid::new_v4().simple()),
            kind,
            instance_id,
            task: Mutex::new(Some(task)),
            released: AtomicBool::new(false),
        }
    }

    /// Stop the watcher. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Record produced by the instrumented console call site.
#[derive(Debug, Clone)]
pub struct ConsoleRecord {
    pub level: String,
    pub message: String,
}

/// Explicit console instrumentation point.
///
/// Embedders route their logging wrapper through this handle instead of
/// patching a global console object.
#[derive(Clone)]
pub struct InstrumentedConsole {
    tx: broadcast::Sender<ConsoleRecord>,
}

impl InstrumentedConsole {
    fn new() -> Self {
        Self {
            tx: broadcast::channel(64).0,
        }
    }

    /// Record one console call.
    pub fn record(&self, level: impl Into<String>, message: impl Into<String>) {
        let _ = self.tx.send(ConsoleRecord {
            level: level.into(),
            message: message.into(),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsoleRecord> {
        self.tx.subscribe()
    }
}

/// Record produced by the instrumented fetch call site.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub url: String,
}

/// Explicit network instrumentation point, mirroring the console one.
#[derive(Clone)]
pub struct InstrumentedFetch {
    tx: broadcast::Sender<FetchRecord>,
}

impl InstrumentedFetch {
    fn new() -> Self {
        Self {
            tx: broadcast::channel(64).0,
        }
    }

    /// Record one outgoing request.
    pub fn record(&self, url: impl Into<String>) {
        let _ = self.tx.send(FetchRecord { url: url.into() });
    }

    fn subscribe(&self) -> broadcast::Receiver<FetchRecord> {
        self.tx.subscribe()
    }
}

type ViolationCallback = Arc<dyn Fn(&SecurityViolation) + Send + Sync>;

struct SecurityState {
    watchers: RwLock<HashMap<String, Arc<WatcherHandle>>>,
    /// Node sets under protection, keyed by instance id. Engine-initiated
    /// re-renders swap the set before removing old nodes, so only foreign
    /// removals count as violations.
    watched_nodes: RwLock<HashMap<String, HashSet<NodeId>>>,
    callbacks: RwLock<HashMap<String, Vec<ViolationCallback>>>,
    history: Mutex<VecDeque<SecurityViolation>>,
    history_capacity: usize,
}

/// Per-instance tamper watching and violation reporting.
///
/// Constructed behind an `Arc`; watcher tasks hold only weak references,
/// so dropping the manager stops every loop.
pub struct SecurityManager {
    page: Arc<dyn HostPage>,
    events: Arc<EventManager>,
    errors: Arc<ErrorManager>,
    console: InstrumentedConsole,
    fetch: InstrumentedFetch,
    state: Arc<SecurityState>,
    weak: std::sync::Weak<SecurityManager>,
}

impl SecurityManager {
    pub fn new(
        page: Arc<dyn HostPage>,
        events: Arc<EventManager>,
        errors: Arc<ErrorManager>,
        history_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            page,
            events,
            errors,
            console: InstrumentedConsole::new(),
            fetch: InstrumentedFetch::new(),
            state: Arc::new(SecurityState {
                watchers: RwLock::new(HashMap::new()),
                watched_nodes: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                history_capacity: history_capacity.max(1),
            }),
            weak: weak.clone(),
        })
    }

    /// The console instrumentation call site for this engine.
    pub fn console(&self) -> InstrumentedConsole {
        self.console.clone()
    }

    /// The network instrumentation call site for this engine.
    pub fn fetch(&self) -> InstrumentedFetch {
        self.fetch.clone()
    }

    /// Start the watcher set for an instance per its security level.
    /// Returns the number of watchers started.
    pub fn enable_protection(
        &self,
        instance_id: &str,
        config: &SecurityConfig,
        elements: &[NodeId],
    ) -> Result<usize> {
        if config.level == SecurityLevel::Off {
            return Ok(0);
        }

        self.refresh_nodes(instance_id, elements);

        let mut started = 0;
        self.spawn_removal_watcher(instance_id);
        started += 1;

        if config.level >= SecurityLevel::Intermediate {
            self.spawn_style_watcher(instance_id, config.style_poll_interval_ms);
            self.spawn_console_watcher(instance_id);
            started += 2;
        }

        if config.level >= SecurityLevel::Advanced {
            self.spawn_devtools_watcher(instance_id, config);
            self.spawn_network_watcher(instance_id);
            started += 2;
            self.apply_obfuscation(instance_id, elements);
        }

        tracing::debug!(
            instance = instance_id,
            level = ?config.level,
            watchers = started,
            "Protection enabled"
        );
        Ok(started)
    }

    /// Stop every watcher for an instance and release their timers and
    /// observers. Safe to call twice.
    pub fn disable_protection(&self, instance_id: &str) {
        let removed: Vec<Arc<WatcherHandle>> = {
            let mut watchers = self.state.watchers.write();
            let ids: Vec<String> = watchers
                .iter()
                .filter(|(_, handle)| handle.instance_id == instance_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| watchers.remove(&id))
                .collect()
        };

        for handle in &removed {
            handle.release();
        }

        self.state.watched_nodes.write().remove(instance_id);
        self.state.callbacks.write().remove(instance_id);

        if !removed.is_empty() {
            tracing::debug!(
                instance = instance_id,
                released = removed.len(),
                "Protection disabled"
            );
        }
    }

    /// Tear down one instance's protection and start it again with a new
    /// config (used when a security config change arrives on update).
    pub fn update_protection(
        &self,
        instance_id: &str,
        config: &SecurityConfig,
        elements: &[NodeId],
    ) -> Result<usize> {
        self.disable_protection(instance_id);
        self.enable_protection(instance_id, config, elements)
    }

    /// Replace the watched node set after a re-render. Must run before
    /// the old elements are removed so the engine's own removals are not
    /// flagged as violations.
    pub fn refresh_nodes(&self, instance_id: &str, elements: &[NodeId]) {
        self.state
            .watched_nodes
            .write()
            .insert(instance_id.to_string(), elements.iter().copied().collect());
    }

    /// Randomize element identity markers. Reapplied after every
    /// re-render while advanced protection is active.
    pub fn apply_obfuscation(&self, instance_id: &str, elements: &[NodeId]) {
        for element in elements {
            let marker = format!("wm-{}", Uuid::new_v4().simple());
            if let Err(e) = self
                .page
                .set_attribute(*element, crate::render::MARKER_ATTRIBUTE, &marker)
            {
                tracing::debug!(instance = instance_id, error = %e, "Obfuscation skipped node");
            }
            let salt_name = format!("data-{}", &Uuid::new_v4().simple().to_string()[..8]);
            let _ = self
                .page
                .set_attribute(*element, &salt_name, &Uuid::new_v4().simple().to_string());
        }
    }

    /// Register a per-instance violation callback.
    pub fn on_violation<F>(&self, instance_id: &str, callback: F)
    where
        F: Fn(&SecurityViolation) + Send + Sync + 'static,
    {
        self.state
            .callbacks
            .write()
            .entry(instance_id.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Record a violation: bounded history, callbacks, log, security
    /// event, and a pass through the error manager's recovery path.
    pub async fn report_violation(
        &self,
        instance_id: &str,
        kind: ViolationKind,
        details: serde_json::Value,
    ) {
        let violation = SecurityViolation {
            instance_id: instance_id.to_string(),
            kind,
            severity: kind.severity(),
            timestamp: Utc::now(),
            details,
        };

        {
            let mut history = self.state.history.lock();
            history.push_back(violation.clone());
            while history.len() > self.state.history_capacity {
                history.pop_front();
            }
        }

        let callbacks: Vec<ViolationCallback> = self
            .state
            .callbacks
            .read()
            .get(instance_id)
            .map(|cbs| cbs.to_vec())
            .unwrap_or_default();
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&violation)
            }));
            if result.is_err() {
                tracing::warn!(instance = instance_id, "Violation callback panicked");
            }
        }

        tracing::warn!(
            instance = instance_id,
            kind = ?kind,
            severity = ?violation.severity,
            "Security violation detected"
        );

        let _ = self
            .events
            .emit(
                WatermarkEvent::new(EventType::Security, "security:violation")
                    .for_instance(instance_id)
                    .with_payload(serde_json::to_value(&violation).unwrap_or_default()),
            )
            .await;

        // Violations are observational signals, never exceptions; the
        // error manager owns any recovery strategy for this code.
        self.errors
            .handle(
                WatermarkError::new(
                    ErrorCode::ViolationDetected,
                    format!("Security violation: {kind:?}"),
                )
                .with_severity(violation.severity)
                .with_context("instance_id", instance_id),
            )
            .await;
    }

    /// Violations recorded for one instance, oldest first.
    pub fn violations(&self, instance_id: &str) -> Vec<SecurityViolation> {
        self.state
            .history
            .lock()
            .iter()
            .filter(|v| v.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// All recorded violations, oldest first.
    pub fn all_violations(&self) -> Vec<SecurityViolation> {
        self.state.history.lock().iter().cloned().collect()
    }

    /// Watchers currently running for an instance.
    pub fn active_watchers(&self, instance_id: &str) -> Vec<Arc<WatcherHandle>> {
        self.state
            .watchers
            .read()
            .values()
            .filter(|handle| handle.instance_id == instance_id && !handle.is_released())
            .cloned()
            .collect()
    }

    fn track(&self, handle: WatcherHandle) {
        let handle = Arc::new(handle);
        self.state
            .watchers
            .write()
            .insert(handle.id.clone(), handle);
    }

    fn spawn_removal_watcher(&self, instance_id: &str) {
        let weak = self.weak.clone();
        let instance_id_owned = instance_id.to_string();
        let mut rx = self.page.watch_mutations();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) if record.kind == MutationKind::NodeRemoved => {
                        let Some(manager) = weak.upgrade() else { break };
                        // Only foreign removals of a currently watched node
                        // count; the node is dropped from the set so one
                        // mutation yields exactly one violation.
                        let hit = {
                            let mut watched = manager.state.watched_nodes.write();
                            watched
                                .get_mut(&instance_id_owned)
                                .map(|nodes| nodes.remove(&record.node))
                                .unwrap_or(false)
                        };
                        if hit {
                            manager
                                .report_violation(
                                    &instance_id_owned,
                                    ViolationKind::ElementRemoved,
                                    serde_json::json!({
                                        "node": record.node.to_string(),
                                        "container": record.container.to_string(),
                                    }),
                                )
                                .await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.track(WatcherHandle::new(
            WatcherKind::ElementRemoval,
            instance_id.to_string(),
            task,
        ));
    }

    fn spawn_style_watcher(&self, instance_id: &str, interval_ms: u64) {
        let weak = self.weak.clone();
        let instance_id_owned = instance_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Nodes already flagged; re-reported only after the drift clears
            let mut flagged: HashSet<NodeId> = HashSet::new();

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let nodes: Vec<NodeId> = manager
                    .state
                    .watched_nodes
                    .read()
                    .get(&instance_id_owned)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();

                for node in nodes {
                    let Some(snapshot) = manager.page.snapshot(node) else {
                        continue;
                    };
                    if !snapshot.attached {
                        continue;
                    }
                    if snapshot.is_suppressed() {
                        if flagged.insert(node) {
                            manager
                                .report_violation(
                                    &instance_id_owned,
                                    ViolationKind::StyleTampered,
                                    serde_json::json!({
                                        "node": node.to_string(),
                                        "styles": snapshot.styles,
                                    }),
                                )
                                .await;
                        }
                    } else {
                        flagged.remove(&node);
                    }
                }
            }
        });

        self.track(WatcherHandle::new(
            WatcherKind::StyleTamper,
            instance_id.to_string(),
            task,
        ));
    }

    fn spawn_console_watcher(&self, instance_id: &str) {
        let weak = self.weak.clone();
        let instance_id_owned = instance_id.to_string();
        let mut rx = self.console.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager
                            .report_violation(
                                &instance_id_owned,
                                ViolationKind::ConsoleActivity,
                                serde_json::json!({
                                    "level": record.level,
                                    "message": record.message,
                                }),
                            )
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.track(WatcherHandle::new(
            WatcherKind::ConsoleActivity,
            instance_id.to_string(),
            task,
        ));
    }

    fn spawn_devtools_watcher(&self, instance_id: &str, config: &SecurityConfig) {
        let weak = self.weak.clone();
        let instance_id_owned = instance_id.to_string();
        let interval_ms = config.devtools_poll_interval_ms.max(10);
        let delta_px = config.devtools_delta_px as i64;
        let hit_threshold = config.devtools_hit_threshold.max(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_hits = 0u32;
            let mut reported = false;

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let env = manager.page.environment();
                let delta_w = env.outer_window.width as i64 - env.viewport.width as i64;
                let delta_h = env.outer_window.height as i64 - env.viewport.height as i64;
                let hit = delta_w > delta_px || delta_h > delta_px;

                if hit {
                    consecutive_hits += 1;
                    // Require N consecutive hits to damp false positives,
                    // then stay quiet until the heuristic goes negative.
                    if consecutive_hits >= hit_threshold && !reported {
                        reported = true;
                        manager
                            .report_violation(
                                &instance_id_owned,
                                ViolationKind::DevtoolsOpened,
                                serde_json::json!({
                                    "outer": [env.outer_window.width, env.outer_window.height],
                                    "viewport": [env.viewport.width, env.viewport.height],
                                    "consecutive_hits": consecutive_hits,
                                }),
                            )
                            .await;
                    }
                } else {
                    consecutive_hits = 0;
                    reported = false;
                }
            }
        });

        self.track(WatcherHandle::new(
            WatcherKind::DevtoolsHeuristic,
            instance_id.to_string(),
            task,
        ));
    }

    fn spawn_network_watcher(&self, instance_id: &str) {
        let weak = self.weak.clone();
        let instance_id_owned = instance_id.to_string();
        let mut rx = self.fetch.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager
                            .report_violation(
                                &instance_id_owned,
                                ViolationKind::NetworkInterception,
                                serde_json::json!({ "url": record.url }),
                            )
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.track(WatcherHandle::new(
            WatcherKind::NetworkInterception,
            instance_id.to_string(),
            task,
        ));
    }

    /// Release every watcher across all instances.
    pub fn dispose(&self) {
        let watchers: Vec<Arc<WatcherHandle>> =
            self.state.watchers.write().drain().map(|(_, h)| h).collect();
        for handle in watchers {
            handle.release();
        }
        self.state.watched_nodes.write().clear();
        self.state.callbacks.write().clear();
        self.state.history.lock().clear();
    }
}
