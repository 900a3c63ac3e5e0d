//! In-memory host page.
//!
//! The reference [`HostPage`] implementation used by tests and headless
//! embedders. It keeps real parent/child bookkeeping so container child
//! counts are meaningful, and broadcasts mutation and resize records the
//! same way a browser adapter would, which lets tests tamper with nodes
//! out from under the engine and observe the security response.

use super::{
    AnimationDriver, AnimationTiming, ContainerId, EnvironmentSnapshot, HostCapabilities,
    HostError, HostPage, Keyframe, MutationKind, MutationRecord, NodeId, NodeSnapshot,
    PlaybackHandle, Rect, VisualNode,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

struct StoredNode {
    node: VisualNode,
    container: ContainerId,
    attached: bool,
}

struct ContainerState {
    rect: Rect,
    children: Vec<NodeId>,
    resize_tx: broadcast::Sender<Rect>,
}

/// In-memory host page with mutation/resize broadcasting.
pub struct MemoryPage {
    nodes: RwLock<HashMap<NodeId, StoredNode>>,
    containers: RwLock<HashMap<ContainerId, ContainerState>>,
    default_container: ContainerId,
    mutation_tx: broadcast::Sender<MutationRecord>,
    environment: RwLock<EnvironmentSnapshot>,
    capabilities: RwLock<HostCapabilities>,
}

impl MemoryPage {
    /// Create a page with a single default container of the given size.
    pub fn new(width: f64, height: f64) -> Self {
        let page = Self {
            nodes: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
            default_container: ContainerId::new("body"),
            mutation_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            environment: RwLock::new(EnvironmentSnapshot::default()),
            capabilities: RwLock::new(HostCapabilities::default()),
        };
        page.add_container("body", Rect::sized(width, height));
        page
    }

    /// Register an additional container.
    pub fn add_container(&self, id: impl Into<String>, rect: Rect) -> ContainerId {
        let id = ContainerId::new(id);
        self.containers.write().insert(
            id.clone(),
            ContainerState {
                rect,
                children: Vec::new(),
                resize_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            },
        );
        id
    }

    /// Change a container's geometry and broadcast the new rect.
    pub fn resize_container(&self, container: &ContainerId, rect: Rect) {
        let mut containers = self.containers.write();
        if let Some(state) = containers.get_mut(container) {
            state.rect = rect;
            let _ = state.resize_tx.send(rect);
        }
    }

    /// Replace the environment snapshot (window sizes, user agent, ...).
    pub fn set_environment(&self, env: EnvironmentSnapshot) {
        *self.environment.write() = env;
    }

    /// Replace the advertised backend capabilities.
    pub fn set_capabilities(&self, caps: HostCapabilities) {
        *self.capabilities.write() = caps;
    }

    /// All node ids currently attached to a container, in insertion order.
    pub fn children_of(&self, container: &ContainerId) -> Vec<NodeId> {
        self.containers
            .read()
            .get(container)
            .map(|state| state.children.clone())
            .unwrap_or_default()
    }

    fn broadcast(&self, kind: MutationKind, node: NodeId, container: ContainerId) {
        let _ = self.mutation_tx.send(MutationRecord {
            kind,
            node,
            container,
        });
    }
}

impl HostPage for MemoryPage {
    fn resolve_container(&self, selector: &str) -> Option<ContainerId> {
        let id = ContainerId::new(selector.trim_start_matches('#'));
        self.containers.read().contains_key(&id).then_some(id)
    }

    fn default_container(&self) -> ContainerId {
        self.default_container.clone()
    }

    fn container_geometry(&self, container: &ContainerId) -> Option<Rect> {
        self.containers.read().get(container).map(|s| s.rect)
    }

    fn child_count(&self, container: &ContainerId) -> usize {
        self.containers
            .read()
            .get(container)
            .map(|s| s.children.len())
            .unwrap_or(0)
    }

    fn insert_node(
        &self,
        container: &ContainerId,
        node: VisualNode,
    ) -> std::result::Result<NodeId, HostError> {
        let id = NodeId::generate();
        {
            let mut containers = self.containers.write();
            let state = containers
                .get_mut(container)
                .ok_or_else(|| HostError::ContainerNotFound(container.0.clone()))?;
            state.children.push(id);
        }
        self.nodes.write().insert(
            id,
            StoredNode {
                node,
                container: container.clone(),
                attached: true,
            },
        );
        self.broadcast(MutationKind::NodeInserted, id, container.clone());
        Ok(id)
    }

    fn remove_node(&self, node: NodeId) -> std::result::Result<(), HostError> {
        let container = {
            let mut nodes = self.nodes.write();
            let stored = nodes.get_mut(&node).ok_or(HostError::NodeNotFound(node))?;
            if !stored.attached {
                return Ok(());
            }
            stored.attached = false;
            stored.container.clone()
        };
        {
            let mut containers = self.containers.write();
            if let Some(state) = containers.get_mut(&container) {
                state.children.retain(|child| *child != node);
            }
        }
        self.broadcast(MutationKind::NodeRemoved, node, container);
        Ok(())
    }

    fn set_style(
        &self,
        node: NodeId,
        property: &str,
        value: &str,
    ) -> std::result::Result<(), HostError> {
        let container = {
            let mut nodes = self.nodes.write();
            let stored = nodes.get_mut(&node).ok_or(HostError::NodeNotFound(node))?;
            stored
                .node
                .styles
                .insert(property.to_string(), value.to_string());
            stored.container.clone()
        };
        self.broadcast(MutationKind::StyleChanged, node, container);
        Ok(())
    }

    fn set_attribute(
        &self,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> std::result::Result<(), HostError> {
        let container = {
            let mut nodes = self.nodes.write();
            let stored = nodes.get_mut(&node).ok_or(HostError::NodeNotFound(node))?;
            stored
                .node
                .attributes
                .insert(name.to_string(), value.to_string());
            stored.container.clone()
        };
        self.broadcast(MutationKind::AttributeChanged, node, container);
        Ok(())
    }

    fn snapshot(&self, node: NodeId) -> Option<NodeSnapshot> {
        self.nodes.read().get(&node).map(|stored| NodeSnapshot {
            attached: stored.attached,
            styles: stored.node.styles.clone(),
            attributes: stored.node.attributes.clone(),
        })
    }

    fn environment(&self) -> EnvironmentSnapshot {
        self.environment.read().clone()
    }

    fn capabilities(&self) -> HostCapabilities {
        *self.capabilities.read()
    }

    fn watch_mutations(&self) -> broadcast::Receiver<MutationRecord> {
        self.mutation_tx.subscribe()
    }

    fn watch_container(&self, container: &ContainerId) -> broadcast::Receiver<Rect> {
        self.containers
            .read()
            .get(container)
            .map(|state| state.resize_tx.subscribe())
            // Subscribing to an unknown container yields a channel that
            // never fires rather than a panic path.
            .unwrap_or_else(|| broadcast::channel(1).0.subscribe())
    }
}

/// Playback state a [`RecordingDriver`] tracks per animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedPlayback {
    Running,
    Paused,
    Cancelled,
    Finished,
}

struct RecordedAnimation {
    node: NodeId,
    keyframes: Vec<Keyframe>,
    timing: AnimationTiming,
    playback: RecordedPlayback,
}

/// Animation driver that records every command it receives.
///
/// Stands in for the host's native keyframe primitive; tests assert against
/// the recorded playback states.
#[derive(Default)]
pub struct RecordingDriver {
    animations: Arc<Mutex<Vec<Arc<Mutex<RecordedAnimation>>>>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of animations ever started.
    pub fn started_count(&self) -> usize {
        self.animations.lock().len()
    }

    /// Playback state of the n-th started animation.
    pub fn playback_state(&self, index: usize) -> Option<RecordedPlayback> {
        self.animations
            .lock()
            .get(index)
            .map(|anim| anim.lock().playback)
    }

    /// Node the n-th animation was started on.
    pub fn node_of(&self, index: usize) -> Option<NodeId> {
        self.animations.lock().get(index).map(|anim| anim.lock().node)
    }

    /// Keyframes of the n-th animation.
    pub fn keyframes_of(&self, index: usize) -> Option<Vec<Keyframe>> {
        self.animations
            .lock()
            .get(index)
            .map(|anim| anim.lock().keyframes.clone())
    }

    /// Timing of the n-th animation.
    pub fn timing_of(&self, index: usize) -> Option<AnimationTiming> {
        self.animations
            .lock()
            .get(index)
            .map(|anim| anim.lock().timing.clone())
    }
}

struct RecordingHandle {
    animation: Arc<Mutex<RecordedAnimation>>,
}

impl PlaybackHandle for RecordingHandle {
    fn play(&self) {
        self.animation.lock().playback = RecordedPlayback::Running;
    }

    fn pause(&self) {
        let mut anim = self.animation.lock();
        if anim.playback == RecordedPlayback::Running {
            anim.playback = RecordedPlayback::Paused;
        }
    }

    fn cancel(&self) {
        self.animation.lock().playback = RecordedPlayback::Cancelled;
    }

    fn finish(&self) {
        self.animation.lock().playback = RecordedPlayback::Finished;
    }
}

impl AnimationDriver for RecordingDriver {
    fn start(
        &self,
        node: NodeId,
        keyframes: &[Keyframe],
        timing: &AnimationTiming,
    ) -> std::result::Result<Arc<dyn PlaybackHandle>, HostError> {
        let animation = Arc::new(Mutex::new(RecordedAnimation {
            node,
            keyframes: keyframes.to_vec(),
            timing: timing.clone(),
            playback: RecordedPlayback::Running,
        }));
        self.animations.lock().push(animation.clone());
        Ok(Arc::new(RecordingHandle { animation }))
    }
}
