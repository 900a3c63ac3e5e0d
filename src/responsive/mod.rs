//! Breakpoint tracking and adaptive reconfiguration.
//!
//! Per observed instance, a debounced task follows container geometry
//! changes. On a change (or breakpoint crossing) it merges the matching
//! breakpoint's override slice into the instance's effective config, runs
//! the configured adaptive strategies, and signals the orchestrator to
//! re-render. The manager itself never renders.
//!
//! Device classification is computed once per change event and cached
//! until the next one.

use crate::config::{
    AdaptiveStrategyKind, Breakpoint, BreakpointOverride, ConfigManager, ResponsiveConfig,
};
use crate::events::{EventManager, EventType, WatermarkEvent};
use crate::host::{EnvironmentSnapshot, HostPage, Rect, Size};
use crate::instance::SharedInstance;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;

/// Broad device classes derived from the environment snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

/// Viewport orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

/// Cached device classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub class: DeviceClass,
    pub os: String,
    pub browser: String,
    pub touch_support: bool,
    pub pixel_ratio: f64,
    pub orientation: Orientation,
    pub viewport: Size,
}

/// Classify a device from the host environment snapshot.
pub fn classify_device(env: &EnvironmentSnapshot) -> DeviceInfo {
    let ua = env.user_agent.to_lowercase();

    let class = if ua.contains("mobile") || ua.contains("iphone") || ua.contains("ipod") {
        DeviceClass::Mobile
    } else if ua.contains("tablet") || ua.contains("ipad") {
        DeviceClass::Tablet
    } else {
        DeviceClass::Desktop
    };

    let os = if ua.contains("windows") {
        "windows"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "ios"
    } else if ua.contains("mac") {
        "macos"
    } else if ua.contains("linux") {
        "linux"
    } else {
        "unknown"
    };

    let browser = if ua.contains("edge") {
        "edge"
    } else if ua.contains("chrome") {
        "chrome"
    } else if ua.contains("firefox") {
        "firefox"
    } else if ua.contains("safari") {
        "safari"
    } else {
        "unknown"
    };

    let orientation = if env.viewport.width > env.viewport.height {
        Orientation::Landscape
    } else {
        Orientation::Portrait
    };

    DeviceInfo {
        class,
        os: os.to_string(),
        browser: browser.to_string(),
        touch_support: env.touch_support,
        pixel_ratio: env.device_pixel_ratio,
        orientation,
        viewport: env.viewport,
    }
}

/// The built-in breakpoint table.
pub fn default_breakpoints() -> Vec<Breakpoint> {
    [
        ("xs", 0, Some(575)),
        ("sm", 576, Some(767)),
        ("md", 768, Some(991)),
        ("lg", 992, Some(1199)),
        ("xl", 1200, Some(1399)),
        ("xxl", 1400, None),
    ]
    .into_iter()
    .map(|(name, min_width, max_width)| Breakpoint {
        name: name.to_string(),
        min_width,
        max_width,
    })
    .collect()
}

/// Find the breakpoint matching a width, widest range first.
pub fn match_breakpoint(table: &[Breakpoint], width: u32) -> Option<&Breakpoint> {
    let mut sorted: Vec<&Breakpoint> = table.iter().collect();
    sorted.sort_by_key(|bp| std::cmp::Reverse(bp.min_width));
    sorted.into_iter().find(|bp| {
        width >= bp.min_width && bp.max_width.map_or(true, |max| width <= max)
    })
}

/// Release-once handle for one instance's resize observer task.
pub struct ObserverHandle {
    pub instance_id: String,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    released: AtomicBool,
}

impl ObserverHandle {
    fn new(instance_id: String, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            instance_id,
            task: Mutex::new(Some(task)),
            released: AtomicBool::new(false),
        }
    }

    /// Stop the observer. Idempotent.
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

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.release();
    }
}

struct ResponsiveState {
    observers: RwLock<HashMap<String, Arc<ObserverHandle>>>,
    last_breakpoint: RwLock<HashMap<String, String>>,
    device: RwLock<Option<DeviceInfo>>,
}

/// Breakpoint and container-size tracking for observed instances.
///
/// Constructed behind an `Arc`; observer tasks hold only weak references,
/// so dropping the manager stops every loop.
pub struct ResponsiveManager {
    page: Arc<dyn HostPage>,
    events: Arc<EventManager>,
    table: Vec<Breakpoint>,
    /// Orchestrator channel; an instance id sent here requests a
    /// re-render of that instance.
    rerender_tx: UnboundedSender<String>,
    state: Arc<ResponsiveState>,
    weak: std::sync::Weak<ResponsiveManager>,
}

impl ResponsiveManager {
    pub fn new(
        page: Arc<dyn HostPage>,
        events: Arc<EventManager>,
        rerender_tx: UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            page,
            events,
            table: default_breakpoints(),
            rerender_tx,
            state: Arc::new(ResponsiveState {
                observers: RwLock::new(HashMap::new()),
                last_breakpoint: RwLock::new(HashMap::new()),
                device: RwLock::new(None),
            }),
            weak: weak.clone(),
        })
    }

    /// Cached device classification from the last change event.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.state.device.read().clone()
    }

    /// Begin observing an instance's container. Geometry bursts are
    /// debounced by the instance's configured debounce window.
    pub fn observe(&self, instance: SharedInstance) {
        let (instance_id, container, debounce_ms) = {
            let guard = instance.lock();
            (
                guard.id.clone(),
                guard.container.clone(),
                guard.config.responsive.debounce_ms.max(1),
            )
        };

        // Replace any prior observer for the id
        self.unobserve(&instance_id);

        let weak = self.weak.clone();
        let id_for_task = instance_id.clone();
        let mut rx = self.page.watch_container(&container);

        let task = tokio::spawn(async move {
            loop {
                let mut latest = match rx.recv().await {
                    Ok(rect) => rect,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                // Debounce: keep folding in changes until the burst ends
                loop {
                    match tokio::time::timeout(Duration::from_millis(debounce_ms), rx.recv()).await
                    {
                        Ok(Ok(rect)) => latest = rect,
                        Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                        Ok(Err(broadcast::error::RecvError::Closed)) => return,
                        Err(_) => break,
                    }
                }

                let Some(manager) = weak.upgrade() else { break };
                manager.apply_change(&id_for_task, &instance, latest).await;
            }
        });

        self.state.observers.write().insert(
            instance_id.clone(),
            Arc::new(ObserverHandle::new(instance_id, task)),
        );
    }

    /// Stop observing an instance. Safe to call twice.
    pub fn unobserve(&self, instance_id: &str) {
        if let Some(handle) = self.state.observers.write().remove(instance_id) {
            handle.release();
        }
        self.state.last_breakpoint.write().remove(instance_id);
    }

    /// Currently observed instance ids.
    pub fn observed(&self) -> Vec<String> {
        self.state.observers.read().keys().cloned().collect()
    }

    /// Apply breakpoint overrides and adaptive strategies for a geometry
    /// change, then signal the orchestrator to re-render.
    ///
    /// Exposed for direct invocation so hosts without resize events can
    /// trigger adaptation manually.
    pub async fn apply_change(&self, instance_id: &str, instance: &SharedInstance, rect: Rect) {
        self.apply_change_inner(instance_id, instance, rect, true)
            .await;
    }

    /// Initial application at attach time. Mutates the effective config
    /// like a change event but does not signal a re-render; the creator
    /// decides whether one is needed.
    pub async fn apply_initial(&self, instance_id: &str, instance: &SharedInstance, rect: Rect) {
        self.apply_change_inner(instance_id, instance, rect, false)
            .await;
    }

    async fn apply_change_inner(
        &self,
        instance_id: &str,
        instance: &SharedInstance,
        rect: Rect,
        signal: bool,
    ) {
        // Device classification is recomputed once per change event
        let device = classify_device(&self.page.environment());
        *self.state.device.write() = Some(device.clone());

        let (responsive, width) = {
            let guard = instance.lock();
            (guard.config.responsive.clone(), rect.width as u32)
        };
        if !responsive.enabled {
            return;
        }

        let table = responsive.table.as_deref().unwrap_or(self.table.as_slice());
        let breakpoint = match_breakpoint(table, width);

        let crossed = {
            let mut last = self.state.last_breakpoint.write();
            match breakpoint {
                Some(bp) => {
                    let previous = last.insert(instance_id.to_string(), bp.name.clone());
                    previous.as_deref() != Some(bp.name.as_str())
                }
                None => last.remove(instance_id).is_some(),
            }
        };

        if let Some(bp) = breakpoint {
            if let Some(slice) = responsive.breakpoints.get(&bp.name) {
                apply_override_slice(instance, slice);
            }
        }

        self.apply_strategies(instance, &responsive, &device, rect);

        {
            let mut guard = instance.lock();
            guard.render_context.container_rect = rect;
        }

        if crossed {
            let name = breakpoint.map(|bp| bp.name.clone()).unwrap_or_default();
            tracing::debug!(instance = instance_id, breakpoint = %name, "Breakpoint crossed");
            let _ = self
                .events
                .emit(
                    WatermarkEvent::new(EventType::Responsive, "responsive:breakpoint")
                        .for_instance(instance_id)
                        .with_payload(serde_json::json!({
                            "breakpoint": name,
                            "width": width,
                        })),
                )
                .await;
        }

        // Adaptation only mutates effective config and element styles;
        // rendering is the orchestrator's job.
        if signal {
            let _ = self.rerender_tx.send(instance_id.to_string());
        }
    }

    fn apply_strategies(
        &self,
        instance: &SharedInstance,
        responsive: &ResponsiveConfig,
        device: &DeviceInfo,
        rect: Rect,
    ) {
        for strategy in &responsive.strategies {
            match strategy {
                AdaptiveStrategyKind::Scale => {
                    let scale = (rect.width / 1200.0).min(1.0);
                    let elements = instance.lock().elements.clone();
                    for element in elements {
                        let _ = self
                            .page
                            .set_style(element, "scale", &format!("{scale:.3}"));
                    }
                }
                AdaptiveStrategyKind::Reflow => {
                    let small = device.class == DeviceClass::Mobile || rect.width < 768.0;
                    if small {
                        let mut guard = instance.lock();
                        let layout = &mut guard.config.layout;
                        layout.gap_x = (layout.gap_x / 2).max(10);
                        layout.gap_y = (layout.gap_y / 2).max(10);
                    }
                }
                AdaptiveStrategyKind::Hide => {
                    let hide = rect.width < responsive.min_width as f64
                        || rect.height < responsive.min_height as f64;
                    let elements = instance.lock().elements.clone();
                    let value = if hide { "none" } else { "" };
                    for element in elements {
                        let _ = self.page.set_style(element, "display", value);
                    }
                }
            }
        }
    }

    /// Release every observer.
    pub fn dispose(&self) {
        let observers: Vec<Arc<ObserverHandle>> = self
            .state
            .observers
            .write()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in observers {
            handle.release();
        }
        self.state.last_breakpoint.write().clear();
    }
}

fn apply_override_slice(instance: &SharedInstance, slice: &BreakpointOverride) {
    let mut guard = instance.lock();
    let mut config = guard.config.clone();

    if let Some(content) = &slice.content {
        config = ConfigManager::merge(
            &config,
            &crate::config::ConfigPatch {
                content: Some(content.clone()),
                ..crate::config::ConfigPatch::default()
            },
        );
    }
    if let Some(style) = &slice.style {
        config.style = style.apply(&config.style);
    }
    if let Some(layout) = &slice.layout {
        config.layout = layout.apply(&config.layout);
    }

    guard.config = config;
}
