//! Tree backend: one positioned host node per grid cell.
//!
//! The always-available backend and the factory's fallback. Each cell
//! becomes a block node carrying the text and/or an image reference, with
//! interaction suppressed through style properties.

use super::{base_root_styles, layout, Renderer, RenderContext, MARKER_ATTRIBUTE};
use crate::assets::ImageCache;
use crate::config::{RenderMode, WatermarkConfig};
use crate::error::Result;
use crate::host::{HostPage, NodeId, VisualNode};
use async_trait::async_trait;

/// Renderer emitting one block node per cell.
#[derive(Clone)]
pub struct TreeRenderer {
    images: ImageCache,
}

impl TreeRenderer {
    pub fn new(images: ImageCache) -> Self {
        Self { images }
    }

    fn cell_node(
        &self,
        config: &WatermarkConfig,
        ctx: &RenderContext,
        pos: &layout::CellPosition,
        image_size: Option<(u32, u32)>,
    ) -> VisualNode {
        let style = &config.style;
        let mut node = VisualNode::block()
            .with_style("left", format!("{}px", pos.x))
            .with_style("top", format!("{}px", pos.y))
            .with_style("font-size", format!("{}px", style.font_size))
            .with_style("font-family", style.font_family.clone())
            .with_style("font-weight", style.font_weight.clone())
            .with_style("color", style.color.clone())
            .with_style("opacity", format!("{}", style.opacity))
            .with_style("white-space", "nowrap")
            .with_attribute(MARKER_ATTRIBUTE, ctx.instance_id.clone())
            .with_attribute("data-wm-cell", format!("{}-{}", pos.row, pos.col));

        for (property, value) in base_root_styles(config) {
            node = node.with_style(property, value);
        }

        if style.rotation != 0.0 {
            node = node.with_style("transform", format!("rotate({}deg)", style.rotation));
        }

        if let Some(text) = &config.content.text {
            node = node.with_text(text.clone());
        }

        if let Some(image) = &config.content.image {
            node = node.with_attribute("data-wm-image", image.src.clone());
            if let Some((natural_w, natural_h)) = image_size {
                let width = image.width.unwrap_or(natural_w);
                let height = image.height.unwrap_or(natural_h);
                node = node
                    .with_style("background-image", format!("url({})", image.src))
                    .with_style("width", format!("{width}px"))
                    .with_style("height", format!("{height}px"));
            }
            if let Some(opacity) = image.opacity {
                node = node.with_style("opacity", format!("{opacity}"));
            }
        }

        node
    }
}

#[async_trait]
impl Renderer for TreeRenderer {
    fn mode(&self) -> RenderMode {
        RenderMode::Tree
    }

    fn is_supported(&self, _ctx: &RenderContext) -> bool {
        true
    }

    async fn render(
        &self,
        page: &dyn HostPage,
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<Vec<NodeId>> {
        let grid = layout::compute(&config.layout, &ctx.container_rect);

        // Decode the image up front so a bad source fails the whole render
        // before any node is inserted.
        let image_size = match &config.content.image {
            Some(image) => Some(self.images.fetch(&image.src).await?.natural_size()),
            None => None,
        };

        let mut elements = Vec::with_capacity(grid.positions.len());
        for pos in &grid.positions {
            let node = self.cell_node(config, ctx, pos, image_size);
            let id = page.insert_node(&ctx.container, node).map_err(|e| {
                crate::error::WatermarkError::new(
                    crate::error::ErrorCode::RenderFailed,
                    format!("Failed to insert watermark node: {e}"),
                )
                .with_context("backend", self.mode().as_str())
            })?;
            elements.push(id);
        }

        tracing::debug!(
            instance = %ctx.instance_id,
            cells = elements.len(),
            rows = grid.rows,
            cols = grid.cols,
            "Tree backend rendered grid"
        );

        Ok(elements)
    }
}
