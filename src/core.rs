//! Watermark engine orchestrator.
//!
//! [`WatermarkCore`] composes the config, instance, event, error,
//! security, responsive and animation subsystems behind four verbs:
//! create, update, destroy and pause/resume. All managers live inside the
//! core value, so independent cores coexist in one process.
//!
//! Per-instance operations are serialized through a per-id async lock:
//! concurrent operations on the same id queue in arrival order, while
//! operations on different ids interleave freely.

use crate::animation::AnimationEngine;
use crate::assets::{ImageCache, ImageCacheConfig};
use crate::config::{
    AnimationKind, ConfigManager, ConfigPatch, SecurityLevel, WatermarkConfig,
};
use crate::error::{ErrorCode, Result, WatermarkError};
use crate::error_manager::{ErrorManager, ErrorManagerConfig};
use crate::events::{EventManager, EventManagerConfig, EventType, ListenerId, WatermarkEvent};
use crate::host::{AnimationDriver, ContainerId, HostPage, NodeId};
use crate::instance::{
    InstanceManager, InstanceQuery, InstanceStats, LifecycleState, SharedInstance,
    WatermarkInstance,
};
use crate::render::{
    raster::RasterRenderer, text::TextRasterizer, tree::TreeRenderer, vector::VectorRenderer,
    RenderContext, Renderer, RendererFactory,
};
use crate::responsive::ResponsiveManager;
use crate::security::SecurityManager;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Target container for `create`.
#[derive(Debug, Clone)]
pub enum ContainerRef {
    /// The host's default container.
    Default,
    /// Resolve by selector string.
    Selector(String),
    /// Use an already-resolved handle.
    Handle(ContainerId),
}

impl From<&str> for ContainerRef {
    fn from(selector: &str) -> Self {
        Self::Selector(selector.to_string())
    }
}

impl From<ContainerId> for ContainerRef {
    fn from(handle: ContainerId) -> Self {
        Self::Handle(handle)
    }
}

/// Options accepted by `create`.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Render immediately (default: true).
    pub immediate: bool,
    /// Attach security watchers when the config enables them.
    pub enable_security: bool,
    /// Attach responsive observation when the config enables it.
    pub enable_responsive: bool,
    /// Attach animations when the config declares one.
    pub enable_animation: bool,
    pub user_data: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            immediate: true,
            enable_security: true,
            enable_responsive: true,
            enable_animation: true,
            user_data: BTreeMap::new(),
            tags: Vec::new(),
        }
    }
}

/// Options accepted by `update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Re-render even when no rendering-relevant field changed.
    pub force_rerender: bool,
    /// Keep in-flight animations running across the update.
    pub preserve_animations: bool,
}

/// Construction options for the core.
#[derive(Default)]
pub struct CoreOptions {
    /// TTF/OTF bytes enabling the raster backend's text path.
    pub font: Option<Vec<u8>>,
    pub events: EventManagerConfig,
    pub errors: ErrorManagerConfig,
    pub images: ImageCacheConfig,
}

/// Top-level orchestrator owning every subsystem.
pub struct WatermarkCore {
    page: Arc<dyn HostPage>,
    instances: InstanceManager,
    events: Arc<EventManager>,
    errors: Arc<ErrorManager>,
    security: Arc<SecurityManager>,
    responsive: Arc<ResponsiveManager>,
    animations: Arc<AnimationEngine>,
    factory: RendererFactory,
    images: ImageCache,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    rerender_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl WatermarkCore {
    /// Build a core against a host page and animation driver.
    pub fn new(
        page: Arc<dyn HostPage>,
        driver: Arc<dyn AnimationDriver>,
        options: CoreOptions,
    ) -> Result<Arc<Self>> {
        let images = ImageCache::new(options.images)?;
        let events = Arc::new(EventManager::new(options.events));
        let errors = Arc::new(ErrorManager::new(options.errors));
        errors.set_environment(page.environment());

        let rasterizer = match options.font {
            Some(bytes) => Some(TextRasterizer::from_font_bytes(bytes)?),
            None => None,
        };
        let factory = RendererFactory::new(
            TreeRenderer::new(images.clone()),
            RasterRenderer::new(images.clone(), rasterizer),
            VectorRenderer::new(),
        );

        let security = SecurityManager::new(page.clone(), events.clone(), errors.clone(), 256);

        let (rerender_tx, mut rerender_rx) = tokio::sync::mpsc::unbounded_channel();
        let responsive = ResponsiveManager::new(page.clone(), events.clone(), rerender_tx);
        let animations = Arc::new(AnimationEngine::new(driver));

        let core = Arc::new(Self {
            page,
            instances: InstanceManager::new(),
            events,
            errors,
            security,
            responsive,
            animations,
            factory,
            images,
            op_locks: Mutex::new(HashMap::new()),
            rerender_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        // Drain responsive re-render requests on a task holding only a
        // weak reference, so dropping the core shuts the loop down.
        let weak = Arc::downgrade(&core);
        let task = tokio::spawn(async move {
            while let Some(instance_id) = rerender_rx.recv().await {
                let Some(core) = weak.upgrade() else { break };
                core.rerender(&instance_id).await;
            }
        });
        *core.rerender_task.lock() = Some(task);

        Ok(core)
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(WatermarkError::new(
                ErrorCode::InvalidState,
                "WatermarkCore has been disposed",
            ));
        }
        Ok(())
    }

    fn resolve_container(&self, container: &ContainerRef) -> Result<ContainerId> {
        let resolved = match container {
            ContainerRef::Default => Some(self.page.default_container()),
            ContainerRef::Selector(selector) => self.page.resolve_container(selector),
            ContainerRef::Handle(handle) => self
                .page
                .container_geometry(handle)
                .is_some()
                .then(|| handle.clone()),
        };
        resolved.ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::InvalidContainer,
                format!("Container could not be resolved: {container:?}"),
            )
        })
    }

    fn render_context(&self, instance_id: &str, container: &ContainerId) -> Result<RenderContext> {
        let rect = self.page.container_geometry(container).ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::InvalidContainer,
                format!("Container has no geometry: {container}"),
            )
        })?;
        Ok(RenderContext {
            instance_id: instance_id.to_string(),
            container: container.clone(),
            container_rect: rect,
            device_pixel_ratio: self.page.environment().device_pixel_ratio,
            capabilities: self.page.capabilities(),
        })
    }

    /// Create a watermark instance. Returns its id.
    pub async fn create(
        &self,
        container: ContainerRef,
        patch: ConfigPatch,
        options: CreateOptions,
    ) -> Result<String> {
        self.ensure_not_disposed()?;

        let config = match ConfigManager::validate(&patch) {
            Ok(config) => config,
            Err(e) => {
                self.errors.handle(e.clone()).await;
                return Err(e);
            }
        };

        let container = self.resolve_container(&container)?;
        let instance_id = format!("wm-{}", Uuid::new_v4().simple());
        let ctx = self.render_context(&instance_id, &container)?;
        let renderer = self.factory.select(config.render_mode, &ctx);
        let render_mode = renderer.mode();

        let instance: SharedInstance = Arc::new(Mutex::new(WatermarkInstance {
            id: instance_id.clone(),
            state: LifecycleState::Creating,
            config: config.clone(),
            container,
            elements: Vec::new(),
            render_mode,
            render_context: ctx,
            animations: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            visible: config.visible,
            user_data: options.user_data.clone(),
            tags: options.tags.clone(),
            cleanup: Vec::new(),
        }));
        self.instances.register(instance.clone())?;

        let lock = self.op_lock(&instance_id);
        let _guard = lock.lock().await;

        match self
            .create_inner(&instance, renderer, &config, &options)
            .await
        {
            Ok(()) => {
                self.events
                    .emit(
                        WatermarkEvent::new(EventType::Lifecycle, "instance:created")
                            .for_instance(&instance_id),
                    )
                    .await?;
                Ok(instance_id)
            }
            Err(e) => {
                // Roll the partial instance back out
                self.teardown_instance(&instance).await;
                self.instances.unregister(&instance_id);
                let wrapped = WatermarkError::new(
                    ErrorCode::InstanceCreationFailed,
                    format!("Failed to create watermark instance: {}", e.message),
                )
                .with_context("instance_id", &instance_id);
                self.errors.handle(wrapped.clone()).await;
                Err(wrapped)
            }
        }
    }

    async fn create_inner(
        &self,
        instance: &SharedInstance,
        renderer: &dyn Renderer,
        config: &WatermarkConfig,
        options: &CreateOptions,
    ) -> Result<()> {
        let instance_id = instance.lock().id.clone();

        if options.immediate {
            let ctx = instance.lock().render_context.clone();
            let elements = renderer.render(self.page.as_ref(), config, &ctx).await?;
            instance.lock().elements = elements;
        }

        let security_enabled = options.enable_security && config.security.level != SecurityLevel::Off;
        if security_enabled {
            let elements = instance.lock().elements.clone();
            self.security
                .enable_protection(&instance_id, &config.security, &elements)?;
        }

        if options.enable_responsive && config.responsive.enabled {
            self.responsive.observe(instance.clone());

            // The initial breakpoint slice may mutate the effective
            // config; render again when it did.
            let rect = instance.lock().render_context.container_rect;
            let before = instance.lock().config.clone();
            self.responsive
                .apply_initial(&instance_id, instance, rect)
                .await;
            let after = instance.lock().config.clone();
            if options.immediate && ConfigManager::has_rendering_changes(&before, &after) {
                self.render_instance(instance, &after).await?;
            }
        }

        if options.enable_animation && config.animation.kind != AnimationKind::None {
            self.attach_animations(instance)?;
        }

        instance.lock().transition(LifecycleState::Active)?;
        Ok(())
    }

    fn attach_animations(&self, instance: &SharedInstance) -> Result<()> {
        let (instance_id, kind, animation_config, elements) = {
            let guard = instance.lock();
            (
                guard.id.clone(),
                guard.config.animation.kind,
                guard.config.animation.clone(),
                guard.elements.clone(),
            )
        };

        let mut ids = Vec::with_capacity(elements.len());
        for element in elements {
            ids.push(
                self.animations
                    .create(&instance_id, element, kind, &animation_config)?,
            );
        }
        instance.lock().animations = ids;
        Ok(())
    }

    /// Re-render an instance's elements, swapping the security watcher
    /// set around the replacement so engine-initiated removals are not
    /// flagged as tampering.
    async fn render_instance(
        &self,
        instance: &SharedInstance,
        config: &WatermarkConfig,
    ) -> Result<Vec<NodeId>> {
        let (instance_id, old_elements, ctx, render_mode) = {
            let guard = instance.lock();
            (
                guard.id.clone(),
                guard.elements.clone(),
                guard.render_context.clone(),
                guard.render_mode,
            )
        };

        self.security.refresh_nodes(&instance_id, &[]);
        let renderer = self.factory.select(render_mode, &ctx);
        let elements = renderer
            .update(self.page.as_ref(), &old_elements, config, &ctx)
            .await?;

        self.security.refresh_nodes(&instance_id, &elements);
        if config.security.level >= SecurityLevel::Advanced {
            // Re-randomize identity markers on every re-render
            self.security.apply_obfuscation(&instance_id, &elements);
        }

        let mut guard = instance.lock();
        guard.elements = elements.clone();
        guard.updated_at = Utc::now();
        Ok(elements)
    }

    /// Merge a partial config into an instance and re-apply whatever the
    /// change predicates say was touched. Restores the prior config and
    /// state if anything fails mid-update.
    pub async fn update(
        &self,
        instance_id: &str,
        patch: ConfigPatch,
        options: UpdateOptions,
    ) -> Result<()> {
        self.ensure_not_disposed()?;

        let instance = self.instances.get(instance_id).ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::InstanceNotFound,
                format!("Instance with id {instance_id} not found"),
            )
        })?;

        let lock = self.op_lock(instance_id);
        let _guard = lock.lock().await;

        let old_config = {
            let mut guard = instance.lock();
            let old_config = guard.config.clone();
            guard.transition(LifecycleState::Updating)?;
            old_config
        };

        match self
            .update_inner(&instance, &old_config, patch, &options)
            .await
        {
            Ok(()) => {
                instance.lock().transition(LifecycleState::Active)?;
                self.events
                    .emit(
                        WatermarkEvent::new(EventType::Lifecycle, "instance:updated")
                            .for_instance(instance_id),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                // Restore prior config and state
                {
                    let mut guard = instance.lock();
                    guard.config = old_config;
                    guard.state = LifecycleState::Active;
                }
                let wrapped = WatermarkError::new(
                    ErrorCode::InstanceUpdateFailed,
                    format!("Failed to update watermark instance: {}", e.message),
                )
                .with_context("instance_id", instance_id);
                self.errors.handle(wrapped.clone()).await;
                Err(wrapped)
            }
        }
    }

    async fn update_inner(
        &self,
        instance: &SharedInstance,
        old_config: &WatermarkConfig,
        patch: ConfigPatch,
        options: &UpdateOptions,
    ) -> Result<()> {
        let instance_id = instance.lock().id.clone();

        let new_config = ConfigManager::merge(old_config, &patch);
        ConfigManager::check(&new_config)?;
        instance.lock().config = new_config.clone();

        let rerendered = if options.force_rerender
            || ConfigManager::has_rendering_changes(old_config, &new_config)
        {
            self.render_instance(instance, &new_config).await?;
            true
        } else {
            false
        };

        // Animations follow elements: a re-render invalidates their
        // targets unless the caller asked to preserve them.
        let animation_changed = ConfigManager::has_animation_changes(old_config, &new_config);
        if animation_changed || (rerendered && !options.preserve_animations) {
            self.animations.destroy_all(&instance_id);
            instance.lock().animations.clear();
            if new_config.animation.kind != AnimationKind::None {
                self.attach_animations(instance)?;
            }
        }

        if ConfigManager::has_security_changes(old_config, &new_config) {
            let elements = instance.lock().elements.clone();
            if new_config.security.level == SecurityLevel::Off {
                self.security.disable_protection(&instance_id);
            } else {
                self.security
                    .update_protection(&instance_id, &new_config.security, &elements)?;
            }
        }

        if ConfigManager::has_responsive_changes(old_config, &new_config) {
            self.responsive.unobserve(&instance_id);
            if new_config.responsive.enabled {
                self.responsive.observe(instance.clone());
            }
        }

        Ok(())
    }

    /// Destroy an instance: stop animations, detach security and
    /// responsive, remove elements, run cleanup callbacks, unregister and
    /// emit. Unknown ids are a no-op.
    pub async fn destroy(&self, instance_id: &str) -> Result<()> {
        let Some(instance) = self.instances.get(instance_id) else {
            return Ok(());
        };

        let lock = self.op_lock(instance_id);
        let _guard = lock.lock().await;

        {
            let mut guard = instance.lock();
            if matches!(
                guard.state,
                LifecycleState::Destroying | LifecycleState::Destroyed
            ) {
                return Ok(());
            }
            guard.transition(LifecycleState::Destroying)?;
        }

        self.teardown_instance(&instance).await;

        instance.lock().transition(LifecycleState::Destroyed)?;
        self.instances.unregister(instance_id);
        self.op_locks.lock().remove(instance_id);

        self.events
            .emit(
                WatermarkEvent::new(EventType::Lifecycle, "instance:destroyed")
                    .for_instance(instance_id),
            )
            .await?;
        Ok(())
    }

    /// Shared teardown used by destroy and by create's failure path.
    async fn teardown_instance(&self, instance: &SharedInstance) {
        let (instance_id, elements, render_mode, ctx, cleanup) = {
            let mut guard = instance.lock();
            let cleanup: Vec<_> = guard.cleanup.drain(..).collect();
            (
                guard.id.clone(),
                std::mem::take(&mut guard.elements),
                guard.render_mode,
                guard.render_context.clone(),
                cleanup,
            )
        };

        self.animations.destroy_all(&instance_id);
        instance.lock().animations.clear();

        self.security.disable_protection(&instance_id);
        self.responsive.unobserve(&instance_id);

        let renderer = self.factory.select(render_mode, &ctx);
        renderer.destroy(self.page.as_ref(), &elements);

        // Cleanup callbacks run sequentially; a failure is logged and the
        // rest still run.
        for callback in cleanup {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
            if result.is_err() {
                tracing::warn!(instance = %instance_id, "Cleanup callback panicked");
            }
        }
    }

    /// Pause an instance and its animations. Unknown ids are a no-op.
    pub async fn pause(&self, instance_id: &str) -> Result<()> {
        let Some(instance) = self.instances.get(instance_id) else {
            return Ok(());
        };
        let lock = self.op_lock(instance_id);
        let _guard = lock.lock().await;

        instance.lock().transition(LifecycleState::Paused)?;
        self.animations.pause_all(instance_id);
        self.events
            .emit(
                WatermarkEvent::new(EventType::Lifecycle, "instance:paused")
                    .for_instance(instance_id),
            )
            .await
    }

    /// Resume a paused instance and its animations.
    pub async fn resume(&self, instance_id: &str) -> Result<()> {
        let Some(instance) = self.instances.get(instance_id) else {
            return Ok(());
        };
        let lock = self.op_lock(instance_id);
        let _guard = lock.lock().await;

        instance.lock().transition(LifecycleState::Active)?;
        self.animations.resume_all(instance_id);
        self.events
            .emit(
                WatermarkEvent::new(EventType::Lifecycle, "instance:resumed")
                    .for_instance(instance_id),
            )
            .await
    }

    /// Show an instance's elements.
    pub async fn show(&self, instance_id: &str) -> Result<()> {
        self.set_visibility(instance_id, true).await
    }

    /// Hide an instance's elements without destroying them.
    pub async fn hide(&self, instance_id: &str) -> Result<()> {
        self.set_visibility(instance_id, false).await
    }

    async fn set_visibility(&self, instance_id: &str, visible: bool) -> Result<()> {
        let Some(instance) = self.instances.get(instance_id) else {
            return Ok(());
        };

        let elements = {
            let mut guard = instance.lock();
            guard.visible = visible;
            guard.config.visible = visible;
            guard.elements.clone()
        };
        let value = if visible { "" } else { "none" };
        for element in elements {
            if let Err(e) = self.page.set_style(element, "display", value) {
                tracing::warn!(element = %element, error = %e, "Failed to toggle visibility");
            }
        }

        self.events
            .emit(
                WatermarkEvent::new(
                    EventType::Visibility,
                    if visible {
                        "visibility:shown"
                    } else {
                        "visibility:hidden"
                    },
                )
                .for_instance(instance_id),
            )
            .await
    }

    /// Responsive-triggered re-render of one instance.
    async fn rerender(&self, instance_id: &str) {
        let Some(instance) = self.instances.get(instance_id) else {
            return;
        };
        let lock = self.op_lock(instance_id);
        let _guard = lock.lock().await;

        let (state, config) = {
            let guard = instance.lock();
            (guard.state, guard.config.clone())
        };
        if state != LifecycleState::Active {
            return;
        }

        if let Err(e) = self.render_instance(&instance, &config).await {
            self.errors.handle(e).await;
            return;
        }

        let _ = self
            .events
            .emit(
                WatermarkEvent::new(EventType::Render, "render:responsive")
                    .for_instance(instance_id),
            )
            .await;
    }

    /// Look up an instance by id.
    pub fn get_instance(&self, instance_id: &str) -> Option<SharedInstance> {
        self.instances.get(instance_id)
    }

    /// All registered instances.
    pub fn get_all_instances(&self) -> Vec<SharedInstance> {
        self.instances.get_all()
    }

    /// Instances bound to one container.
    pub fn get_instances_by_container(&self, container: &ContainerId) -> Vec<SharedInstance> {
        self.instances.get_by_container(container)
    }

    /// Run a registry query.
    pub fn query_instances(&self, query: &InstanceQuery) -> Vec<SharedInstance> {
        self.instances.query(query)
    }

    /// Registry statistics.
    pub fn instance_stats(&self) -> InstanceStats {
        self.instances.stats()
    }

    /// The instance registry, for batch operations and cleanup.
    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// Register an event listener.
    pub fn on<F>(&self, event_type: EventType, listener: F) -> ListenerId
    where
        F: Fn(&WatermarkEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.events.on(event_type, listener)
    }

    /// Remove an event listener.
    pub fn off(&self, event_type: EventType, id: ListenerId) -> bool {
        self.events.off(event_type, id)
    }

    /// The event manager, for middleware, filters and `wait_for`.
    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// The error manager, for handlers and recovery strategies.
    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    /// The security manager, for violation callbacks and history.
    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// The responsive manager, for manual adaptation triggers.
    pub fn responsive(&self) -> &Arc<ResponsiveManager> {
        &self.responsive
    }

    /// The animation engine, for timelines and transitions.
    pub fn animations(&self) -> &Arc<AnimationEngine> {
        &self.animations
    }

    /// The image cache backing image watermarks.
    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Destroy every instance and release every subsystem resource.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let ids: Vec<String> = self
            .instances
            .get_all()
            .into_iter()
            .map(|instance| instance.lock().id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.destroy(&id).await {
                tracing::warn!(instance = %id, error = %e, "Destroy during dispose failed");
            }
        }

        if let Some(task) = self.rerender_task.lock().take() {
            task.abort();
        }
        self.security.dispose();
        self.responsive.dispose();
        self.events.dispose();
        self.images.dispose().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SecurityConfig, StylePatch};
    use crate::host::memory::{MemoryPage, RecordingDriver};

    fn core_with_page() -> (Arc<WatermarkCore>, Arc<MemoryPage>) {
        let page = Arc::new(MemoryPage::new(800.0, 600.0));
        let driver = Arc::new(RecordingDriver::new());
        let core = WatermarkCore::new(page.clone(), driver, CoreOptions::default()).unwrap();
        (core, page)
    }

    fn quiet_security() -> ConfigPatch {
        // Keep watcher noise out of unrelated tests
        ConfigPatch {
            security: Some(SecurityConfig {
                level: SecurityLevel::Off,
                ..SecurityConfig::default()
            }),
            ..ConfigPatch::text("CONFIDENTIAL")
        }
    }

    #[tokio::test]
    async fn test_create_renders_default_grid() {
        let (core, page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let instance = core.get_instance(&id).unwrap();
        let guard = instance.lock();
        assert_eq!(guard.state, LifecycleState::Active);
        assert_eq!(guard.elements.len(), 63); // 9 cols x 7 rows at 800x600
        assert_eq!(page.child_count(&page.default_container()), 63);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_content_before_insertion() {
        let (core, page) = core_with_page();
        let result = core
            .create(
                ContainerRef::Default,
                ConfigPatch::default(),
                CreateOptions::default(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(page.child_count(&page.default_container()), 0);
    }

    #[tokio::test]
    async fn test_create_with_unknown_selector_fails() {
        let (core, _page) = core_with_page();
        let result = core
            .create(
                ContainerRef::from("#missing"),
                quiet_security(),
                CreateOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::InvalidContainer);
    }

    #[tokio::test]
    async fn test_create_then_destroy_restores_child_count() {
        let (core, page) = core_with_page();
        let container = page.default_container();
        let before = page.child_count(&container);

        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();
        assert_ne!(page.child_count(&container), before);

        core.destroy(&id).await.unwrap();
        assert_eq!(page.child_count(&container), before);
        assert!(core.get_instance(&id).is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_without_duplicate_events() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        core.destroy(&id).await.unwrap();
        core.destroy(&id).await.unwrap(); // no-op, no error

        let destroyed_events = core
            .events()
            .history()
            .into_iter()
            .filter(|e| e.name == "instance:destroyed")
            .count();
        assert_eq!(destroyed_events, 1);
    }

    #[tokio::test]
    async fn test_destroy_unknown_id_is_noop() {
        let (core, _page) = core_with_page();
        assert!(core.destroy("wm-never-existed").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_style_preserves_content() {
        let (core, page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        core.update(
            &id,
            ConfigPatch {
                style: Some(StylePatch {
                    font_size: Some(24.0),
                    color: Some("#FF0000".to_string()),
                    ..StylePatch::default()
                }),
                ..ConfigPatch::default()
            },
            UpdateOptions::default(),
        )
        .await
        .unwrap();

        let instance = core.get_instance(&id).unwrap();
        let (config, first_element) = {
            let guard = instance.lock();
            (guard.config.clone(), guard.elements[0])
        };
        assert_eq!(config.style.font_size, 24.0);
        assert_eq!(config.content.text.as_deref(), Some("CONFIDENTIAL"));

        let snapshot = page.snapshot(first_element).unwrap();
        assert_eq!(
            snapshot.styles.get("color").map(String::as_str),
            Some("#FF0000")
        );
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let (core, _page) = core_with_page();
        let result = core
            .update(
                "wm-missing",
                ConfigPatch::text("X"),
                UpdateOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::InstanceNotFound);
    }

    #[tokio::test]
    async fn test_update_failure_restores_prior_config() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let result = core
            .update(
                &id,
                ConfigPatch {
                    style: Some(StylePatch {
                        opacity: Some(5.0),
                        ..StylePatch::default()
                    }),
                    ..ConfigPatch::default()
                },
                UpdateOptions::default(),
            )
            .await;
        assert!(result.is_err());

        let instance = core.get_instance(&id).unwrap();
        let guard = instance.lock();
        assert_eq!(guard.state, LifecycleState::Active);
        assert_eq!(guard.config.style.opacity, 0.15); // default restored
    }

    #[tokio::test]
    async fn test_content_update_resets_or_preserves_animations() {
        let page = Arc::new(MemoryPage::new(800.0, 600.0));
        let driver = Arc::new(RecordingDriver::new());
        let core =
            WatermarkCore::new(page.clone(), driver, CoreOptions::default()).unwrap();

        let patch = ConfigPatch {
            animation: Some(crate::config::AnimationConfig {
                kind: AnimationKind::Pulse,
                duration_ms: 60_000,
                ..crate::config::AnimationConfig::default()
            }),
            ..quiet_security()
        };
        let id = core
            .create(ContainerRef::Default, patch, CreateOptions::default())
            .await
            .unwrap();

        let before: Vec<String> = core.get_instance(&id).unwrap().lock().animations.clone();
        assert!(!before.is_empty());

        // Content-only change with preserve_animations keeps the same ids
        core.update(
            &id,
            ConfigPatch::text("UPDATED"),
            UpdateOptions {
                preserve_animations: true,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();
        let preserved: Vec<String> = core.get_instance(&id).unwrap().lock().animations.clone();
        assert_eq!(before, preserved);
        assert!(core.animations().state(&before[0]).is_some());

        // Without the flag the animations are reset
        core.update(&id, ConfigPatch::text("AGAIN"), UpdateOptions::default())
            .await
            .unwrap();
        let reset: Vec<String> = core.get_instance(&id).unwrap().lock().animations.clone();
        assert!(!reset.is_empty());
        assert_ne!(before, reset);
        assert!(core.animations().state(&before[0]).is_none());
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        core.pause(&id).await.unwrap();
        assert_eq!(
            core.get_instance(&id).unwrap().lock().state,
            LifecycleState::Paused
        );

        core.resume(&id).await.unwrap();
        assert_eq!(
            core.get_instance(&id).unwrap().lock().state,
            LifecycleState::Active
        );
    }

    #[tokio::test]
    async fn test_update_while_paused_is_invalid_state() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        core.pause(&id).await.unwrap();
        let result = core
            .update(&id, ConfigPatch::text("X"), UpdateOptions::default())
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_show_hide_toggle_elements() {
        let (core, page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        core.hide(&id).await.unwrap();
        let instance = core.get_instance(&id).unwrap();
        let element = instance.lock().elements[0];
        assert_eq!(
            page.snapshot(element).unwrap().styles.get("display").map(String::as_str),
            Some("none")
        );
        assert!(!instance.lock().visible);

        core.show(&id).await.unwrap();
        assert_eq!(
            page.snapshot(element).unwrap().styles.get("display").map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();
        core.update(&id, ConfigPatch::text("NEW"), UpdateOptions::default())
            .await
            .unwrap();
        core.destroy(&id).await.unwrap();

        let names: Vec<String> = core
            .events()
            .history()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"instance:created".to_string()));
        assert!(names.contains(&"instance:updated".to_string()));
        assert!(names.contains(&"instance:destroyed".to_string()));
    }

    #[tokio::test]
    async fn test_removing_element_produces_violation() {
        let (core, page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                ConfigPatch::text("PROTECTED"),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let element = core.get_instance(&id).unwrap().lock().elements[0];
        page.remove_node(element).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let violations = core.security().violations(&id);
        assert_eq!(violations.len(), 1);
    }

    #[tokio::test]
    async fn test_rerender_does_not_trip_own_security() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                ConfigPatch::text("PROTECTED"),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        // Updates replace all 63 elements; none may count as tampering
        core.update(&id, ConfigPatch::text("NEW TEXT"), UpdateOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(core.security().violations(&id).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ops_on_same_id_serialize() {
        let (core, _page) = core_with_page();
        let id = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let core_a = core.clone();
        let id_a = id.clone();
        let update = tokio::spawn(async move {
            core_a
                .update(&id_a, ConfigPatch::text("A"), UpdateOptions::default())
                .await
        });
        let core_b = core.clone();
        let id_b = id.clone();
        let destroy = tokio::spawn(async move { core_b.destroy(&id_b).await });

        let (update_result, destroy_result) = tokio::join!(update, destroy);
        // Whatever the interleaving, both complete without panics and the
        // instance ends up destroyed exactly once.
        let _ = update_result.unwrap();
        destroy_result.unwrap().unwrap();
        assert!(core.get_instance(&id).is_none());
    }

    #[tokio::test]
    async fn test_dispose_destroys_everything() {
        let (core, page) = core_with_page();
        core.create(
            ContainerRef::Default,
            quiet_security(),
            CreateOptions::default(),
        )
        .await
        .unwrap();
        core.create(
            ContainerRef::Default,
            quiet_security(),
            CreateOptions::default(),
        )
        .await
        .unwrap();

        core.dispose().await.unwrap();
        assert!(core.get_all_instances().is_empty());
        assert_eq!(page.child_count(&page.default_container()), 0);

        // Operations after dispose are rejected
        let result = core
            .create(
                ContainerRef::Default,
                quiet_security(),
                CreateOptions::default(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_responsive_resize_triggers_rerender() {
        let (core, page) = core_with_page();
        let patch = ConfigPatch {
            responsive: Some(crate::config::ResponsiveConfig {
                enabled: true,
                debounce_ms: 10,
                strategies: vec![],
                ..crate::config::ResponsiveConfig::default()
            }),
            ..quiet_security()
        };
        let id = core
            .create(ContainerRef::Default, patch, CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(core.get_instance(&id).unwrap().lock().elements.len(), 63);

        // Shrink the container; the grid re-renders against new geometry
        page.resize_container(
            &page.default_container(),
            crate::host::Rect::sized(400.0, 300.0),
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let elements = core.get_instance(&id).unwrap().lock().elements.len();
        assert_eq!(elements, 20); // (ceil(400/100)+1) x (ceil(300/100)+1) = 5 x 4
    }
}
