//! Host-environment boundary.
//!
//! The engine never talks to a real browser. Everything it needs from the
//! hosting document is expressed here as a narrow contract:
//!
//! - [`HostPage`]: a tree of visual nodes with geometry, styling and
//!   structural-mutation / container-resize subscriptions
//! - [`AnimationDriver`]: the declarative keyframe-animation primitive
//! - an environment snapshot used for device classification and the
//!   devtools window-delta heuristic
//!
//! [`MemoryPage`](memory::MemoryPage) is the crate's reference
//! implementation, backing tests and headless embedding.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Axis-aligned rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn sized(width: f64, height: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
        }
    }
}

/// Integer pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Opaque handle for a visual node owned by the host tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of a host container watermarks render into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw RGBA pixel payload carried by a surface node.
#[derive(Clone)]
pub struct SurfacePayload {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows.
    pub rgba: Arc<Vec<u8>>,
}

impl fmt::Debug for SurfacePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfacePayload")
            .field("dimensions", &(self.width, self.height))
            .field("bytes", &self.rgba.len())
            .finish()
    }
}

/// What kind of visual node a renderer produced.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Positioned block carrying text and/or an image reference.
    Block,
    /// Pixel surface with a drawn buffer.
    Surface(SurfacePayload),
    /// Structured vector markup document.
    Markup(String),
}

/// A visual node handed to the host tree for insertion.
#[derive(Debug, Clone)]
pub struct VisualNode {
    pub kind: NodeKind,
    /// Text content for block nodes.
    pub text: Option<String>,
    /// Style properties (css-like key/value pairs).
    pub styles: BTreeMap<String, String>,
    /// Marker and metadata attributes.
    pub attributes: BTreeMap<String, String>,
}

impl VisualNode {
    pub fn block() -> Self {
        Self {
            kind: NodeKind::Block,
            text: None,
            styles: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn surface(payload: SurfacePayload) -> Self {
        Self {
            kind: NodeKind::Surface(payload),
            text: None,
            styles: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn markup(document: String) -> Self {
        Self {
            kind: NodeKind::Markup(document),
            text: None,
            styles: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.styles.insert(property.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Point-in-time view of a node used by tamper checks.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// False once the node has been removed from its container.
    pub attached: bool,
    pub styles: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

impl NodeSnapshot {
    /// Style drift that effectively hides the node.
    pub fn is_suppressed(&self) -> bool {
        let style = |p: &str| self.styles.get(p).map(String::as_str);
        if style("display") == Some("none") || style("visibility") == Some("hidden") {
            return true;
        }
        if let Some(op) = style("opacity").and_then(|v| v.parse::<f64>().ok()) {
            if op == 0.0 {
                return true;
            }
        }
        for prop in ["left", "top"] {
            if let Some(px) = style(prop)
                .and_then(|v| v.strip_suffix("px"))
                .and_then(|v| v.parse::<f64>().ok())
            {
                if px < -1000.0 {
                    return true;
                }
            }
        }
        false
    }
}

/// Structural mutation kinds observable on the host tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    NodeInserted,
    NodeRemoved,
    StyleChanged,
    AttributeChanged,
}

/// One observed structural mutation.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub node: NodeId,
    pub container: ContainerId,
}

/// Environment snapshot used for device classification and security
/// heuristics. The host recomputes this on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub user_agent: String,
    pub platform: String,
    /// Inner viewport size.
    pub viewport: Size,
    /// Physical screen size.
    pub screen: Size,
    /// Outer window size; the devtools heuristic compares this against the
    /// viewport.
    pub outer_window: Size,
    pub device_pixel_ratio: f64,
    pub touch_support: bool,
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            user_agent: "aquamark-headless".to_string(),
            platform: "linux".to_string(),
            viewport: Size::new(1280, 800),
            screen: Size::new(1280, 800),
            outer_window: Size::new(1280, 800),
            device_pixel_ratio: 1.0,
            touch_support: false,
        }
    }
}

/// Drawing backends the host can service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub raster: bool,
    pub vector: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            raster: true,
            vector: true,
        }
    }
}

/// Errors raised at the host boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Host rejected the operation: {0}")]
    Rejected(String),
}

/// The host document tree the engine renders into.
///
/// All methods are synchronous bookkeeping; change notifications arrive
/// through the broadcast subscriptions.
pub trait HostPage: Send + Sync {
    /// Resolve a selector string to a container, if present.
    fn resolve_container(&self, selector: &str) -> Option<ContainerId>;

    /// The container used when the caller passes no target.
    fn default_container(&self) -> ContainerId;

    /// Current geometry of a container.
    fn container_geometry(&self, container: &ContainerId) -> Option<Rect>;

    /// Number of children currently attached to a container.
    fn child_count(&self, container: &ContainerId) -> usize;

    /// Insert a node into a container, returning its handle.
    fn insert_node(
        &self,
        container: &ContainerId,
        node: VisualNode,
    ) -> std::result::Result<NodeId, HostError>;

    /// Remove a node from its container.
    fn remove_node(&self, node: NodeId) -> std::result::Result<(), HostError>;

    /// Set a style property on an attached node.
    fn set_style(
        &self,
        node: NodeId,
        property: &str,
        value: &str,
    ) -> std::result::Result<(), HostError>;

    /// Set an attribute on an attached node.
    fn set_attribute(
        &self,
        node: NodeId,
        name: &str,
        value: &str,
    ) -> std::result::Result<(), HostError>;

    /// Snapshot a node for tamper checks. `None` for unknown handles.
    fn snapshot(&self, node: NodeId) -> Option<NodeSnapshot>;

    /// Current environment snapshot.
    fn environment(&self) -> EnvironmentSnapshot;

    /// Which drawing backends the host can service.
    fn capabilities(&self) -> HostCapabilities;

    /// Subscribe to structural mutations across the page.
    fn watch_mutations(&self) -> broadcast::Receiver<MutationRecord>;

    /// Subscribe to geometry changes of one container.
    fn watch_container(&self, container: &ContainerId) -> broadcast::Receiver<Rect>;
}

/// One keyframe of a declarative animation: progress offset plus property
/// values at that offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Progress offset in [0, 1].
    pub offset: f32,
    /// Property values at this offset (transform, opacity, ...).
    pub properties: BTreeMap<String, String>,
}

impl Keyframe {
    pub fn at(offset: f32) -> Self {
        Self {
            offset,
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(property.into(), value.into());
        self
    }
}

/// Timing parameters handed to the animation driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationTiming {
    pub duration_ms: u64,
    pub delay_ms: u64,
    /// `None` means infinite.
    pub iterations: Option<u32>,
    pub direction: crate::config::PlaybackDirection,
    pub fill: crate::config::FillMode,
    pub easing: String,
}

/// Playback control over one running driver animation.
pub trait PlaybackHandle: Send + Sync {
    fn play(&self);
    fn pause(&self);
    /// Cancel discards the animation's effect.
    fn cancel(&self);
    /// Jump to the final keyframe.
    fn finish(&self);
}

/// The host's declarative keyframe-animation primitive.
pub trait AnimationDriver: Send + Sync {
    fn start(
        &self,
        node: NodeId,
        keyframes: &[Keyframe],
        timing: &AnimationTiming,
    ) -> std::result::Result<Arc<dyn PlaybackHandle>, HostError>;
}
