//! Rendering backends for watermark overlays.
//!
//! Three interchangeable backends implement the same [`Renderer`] contract:
//!
//! - [`tree::TreeRenderer`] - one positioned host node per grid cell
//! - [`raster::RasterRenderer`] - whole grid drawn into one pixel surface
//! - [`vector::VectorRenderer`] - whole grid emitted as one markup node
//!
//! All backends place cells through the shared [`layout`] routine, so the
//! factory can switch backends without visual discontinuity. Backend
//! selection follows the config's `render_mode`; an unsupported mode falls
//! back to the tree backend with a warning, never an error.

pub mod compose;
pub mod layout;
pub mod raster;
pub mod text;
pub mod tree;
pub mod vector;

pub use layout::{CellPosition, LayoutResult};

use crate::config::{LayoutConfig, RenderMode, WatermarkConfig};
use crate::error::Result;
use crate::host::{HostCapabilities, HostPage, NodeId, Rect};
use async_trait::async_trait;

/// Marker attribute carried by every rendered element.
pub const MARKER_ATTRIBUTE: &str = "data-watermark";

/// Snapshot of the environment a render runs against.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Owning instance id, stamped into element markers.
    pub instance_id: String,
    pub container: crate::host::ContainerId,
    pub container_rect: Rect,
    pub device_pixel_ratio: f64,
    pub capabilities: HostCapabilities,
}

/// Contract shared by the three renderer backends.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Stable backend tag.
    fn mode(&self) -> RenderMode;

    /// Whether this backend can run against the given context.
    fn is_supported(&self, ctx: &RenderContext) -> bool;

    /// Compute the placement grid this backend would use.
    fn layout(&self, config: &LayoutConfig, rect: &Rect) -> LayoutResult {
        layout::compute(config, rect)
    }

    /// Produce host elements for the config.
    async fn render(
        &self,
        page: &dyn HostPage,
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<Vec<NodeId>>;

    /// Replace previously rendered elements. Old elements are fully
    /// detached before the new set is inserted.
    async fn update(
        &self,
        page: &dyn HostPage,
        elements: &[NodeId],
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<Vec<NodeId>> {
        self.destroy(page, elements);
        self.render(page, config, ctx).await
    }

    /// Remove rendered elements from the host tree.
    fn destroy(&self, page: &dyn HostPage, elements: &[NodeId]) {
        for element in elements {
            if let Err(e) = page.remove_node(*element) {
                tracing::warn!(element = %element, error = %e, "Failed to remove rendered element");
            }
        }
    }
}

/// Maps a render mode to its backend, probing support and falling back to
/// the tree backend when the requested one cannot run.
pub struct RendererFactory {
    tree: tree::TreeRenderer,
    raster: raster::RasterRenderer,
    vector: vector::VectorRenderer,
}

impl RendererFactory {
    pub fn new(
        tree: tree::TreeRenderer,
        raster: raster::RasterRenderer,
        vector: vector::VectorRenderer,
    ) -> Self {
        Self {
            tree,
            raster,
            vector,
        }
    }

    /// Select the backend for a mode, falling back to the tree backend
    /// when the requested one reports unsupported.
    pub fn select(&self, mode: RenderMode, ctx: &RenderContext) -> &dyn Renderer {
        let requested: &dyn Renderer = match mode {
            RenderMode::Tree => &self.tree,
            RenderMode::Raster => &self.raster,
            RenderMode::Vector => &self.vector,
        };

        if requested.is_supported(ctx) {
            requested
        } else {
            tracing::warn!(
                requested = mode.as_str(),
                fallback = RenderMode::Tree.as_str(),
                "Requested render backend unsupported, falling back"
            );
            &self.tree
        }
    }
}

/// Style properties shared by every backend's root element.
pub(crate) fn base_root_styles(config: &WatermarkConfig) -> Vec<(&'static str, String)> {
    let mut styles = vec![
        ("position", "absolute".to_string()),
        ("pointer-events", "none".to_string()),
        ("user-select", "none".to_string()),
        ("z-index", config.z_index.to_string()),
    ];
    if !config.visible {
        styles.push(("display", "none".to_string()));
    }
    if let Some(blend) = &config.style.blend_mode {
        styles.push(("mix-blend-mode", blend.clone()));
    }
    styles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{ImageCache, ImageCacheConfig};
    use crate::config::{ConfigManager, ConfigPatch};
    use crate::host::ContainerId;

    fn test_factory() -> RendererFactory {
        let images = ImageCache::new(ImageCacheConfig::default()).unwrap();
        RendererFactory::new(
            tree::TreeRenderer::new(images.clone()),
            raster::RasterRenderer::new(images.clone(), None),
            vector::VectorRenderer::new(),
        )
    }

    fn ctx(caps: HostCapabilities) -> RenderContext {
        RenderContext {
            instance_id: "wm-test".to_string(),
            container: ContainerId::new("body"),
            container_rect: Rect::sized(800.0, 600.0),
            device_pixel_ratio: 1.0,
            capabilities: caps,
        }
    }

    #[test]
    fn test_factory_maps_modes() {
        let factory = test_factory();
        let ctx = ctx(HostCapabilities::default());

        assert_eq!(
            factory.select(RenderMode::Tree, &ctx).mode(),
            RenderMode::Tree
        );
        assert_eq!(
            factory.select(RenderMode::Vector, &ctx).mode(),
            RenderMode::Vector
        );
    }

    #[test]
    fn test_factory_falls_back_without_raster_font() {
        let factory = test_factory();
        // Raster backend carries no font, so it reports unsupported
        let ctx = ctx(HostCapabilities::default());
        assert_eq!(
            factory.select(RenderMode::Raster, &ctx).mode(),
            RenderMode::Tree
        );
    }

    #[test]
    fn test_factory_falls_back_without_vector_capability() {
        let factory = test_factory();
        let ctx = ctx(HostCapabilities {
            raster: true,
            vector: false,
        });
        assert_eq!(
            factory.select(RenderMode::Vector, &ctx).mode(),
            RenderMode::Tree
        );
    }

    #[test]
    fn test_backends_share_layout_results() {
        let factory = test_factory();
        let config = ConfigManager::validate(&ConfigPatch::text("WM")).unwrap();
        let rect = Rect::sized(800.0, 600.0);

        let from_tree = factory.tree.layout(&config.layout, &rect);
        let from_raster = factory.raster.layout(&config.layout, &rect);
        let from_vector = factory.vector.layout(&config.layout, &rect);

        assert_eq!(from_tree, from_raster);
        assert_eq!(from_tree, from_vector);
        assert_eq!(from_tree.cols, 9);
        assert_eq!(from_tree.rows, 7);
    }

    #[test]
    fn test_base_root_styles_reflect_visibility() {
        let config = ConfigManager::validate(&ConfigPatch::text("WM")).unwrap();
        let styles = base_root_styles(&config);
        assert!(styles.iter().any(|(p, v)| *p == "z-index" && v == "9999"));
        assert!(!styles.iter().any(|(p, _)| *p == "display"));

        let hidden = ConfigManager::merge(
            &config,
            &ConfigPatch {
                visible: Some(false),
                ..ConfigPatch::default()
            },
        );
        let styles = base_root_styles(&hidden);
        assert!(styles.iter().any(|(p, v)| *p == "display" && v == "none"));
    }
}
