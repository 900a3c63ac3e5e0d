//! Raster backend: the whole grid drawn into one pixel surface.
//!
//! Renders the watermark text once into an RGBA tile, stamps it across the
//! layout grid with the compositor, and hands the finished buffer to the
//! host as a single surface node. The surface is sized in device pixels
//! and scaled back to css pixels through its style, so output stays sharp
//! on high-density displays.
//!
//! Requires an embedder-supplied font; without one the backend reports
//! unsupported and the factory falls back to the tree backend.

use super::text::{parse_hex_color, TextRasterizer, TextTileOptions};
use super::{base_root_styles, compose, layout, Renderer, RenderContext, MARKER_ATTRIBUTE};
use crate::assets::ImageCache;
use crate::config::{RenderMode, WatermarkConfig};
use crate::error::{ErrorCode, Result, WatermarkError};
use crate::host::{HostPage, NodeId, SurfacePayload, VisualNode};
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;

/// Renderer drawing the grid into one RGBA surface node.
#[derive(Clone)]
pub struct RasterRenderer {
    images: ImageCache,
    rasterizer: Option<TextRasterizer>,
}

impl RasterRenderer {
    pub fn new(images: ImageCache, rasterizer: Option<TextRasterizer>) -> Self {
        Self { images, rasterizer }
    }

    async fn build_surface(
        &self,
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<RgbaImage> {
        let dpr = if ctx.device_pixel_ratio > 0.0 {
            ctx.device_pixel_ratio
        } else {
            1.0
        };
        let grid = layout::compute(&config.layout, &ctx.container_rect);

        let surface_w = ((ctx.container_rect.width.max(1.0)) * dpr).ceil() as u32;
        let surface_h = ((ctx.container_rect.height.max(1.0)) * dpr).ceil() as u32;
        let mut surface = RgbaImage::new(surface_w.max(1), surface_h.max(1));

        if let Some(text) = &config.content.text {
            // The font is only needed for text content; image-only
            // watermarks rasterize without one.
            let rasterizer = self.rasterizer.as_ref().ok_or_else(|| {
                WatermarkError::new(
                    ErrorCode::FontUnavailable,
                    "Raster backend requires a font for text content",
                )
            })?;
            let color = parse_hex_color(&config.style.color)?;
            let tile = rasterizer.render_tile(&TextTileOptions {
                text: text.clone(),
                font_size: (config.style.font_size as f64 * dpr) as f32,
                color,
                // Opacity is applied per-layer; keep the glyph alpha intact.
                opacity: 1.0,
                rotation_degrees: Some(config.style.rotation),
            })?;
            let layers = compose::grid_layers(&tile, &grid, dpr, config.style.opacity);
            compose::apply_layers(&mut surface, &layers);
        }

        if let Some(image_ref) = &config.content.image {
            let decoded = self.images.fetch(&image_ref.src).await?;
            let (natural_w, natural_h) = decoded.natural_size();
            let target_w = ((image_ref.width.unwrap_or(natural_w)) as f64 * dpr) as u32;
            let target_h = ((image_ref.height.unwrap_or(natural_h)) as f64 * dpr) as u32;

            let tile = image::imageops::resize(
                decoded.image.as_ref(),
                target_w.max(1),
                target_h.max(1),
                image::imageops::FilterType::Triangle,
            );
            let opacity = image_ref.opacity.unwrap_or(config.style.opacity);
            let layers = compose::grid_layers(&tile, &grid, dpr, opacity);
            compose::apply_layers(&mut surface, &layers);
        }

        Ok(surface)
    }
}

#[async_trait]
impl Renderer for RasterRenderer {
    fn mode(&self) -> RenderMode {
        RenderMode::Raster
    }

    fn is_supported(&self, ctx: &RenderContext) -> bool {
        ctx.capabilities.raster && self.rasterizer.is_some()
    }

    async fn render(
        &self,
        page: &dyn HostPage,
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<Vec<NodeId>> {
        let surface = self.build_surface(config, ctx).await?;
        let (width, height) = (surface.width(), surface.height());

        let payload = SurfacePayload {
            width,
            height,
            rgba: Arc::new(surface.into_raw()),
        };

        let mut node = VisualNode::surface(payload)
            .with_style("left", "0px")
            .with_style("top", "0px")
            .with_style("width", format!("{}px", ctx.container_rect.width))
            .with_style("height", format!("{}px", ctx.container_rect.height))
            .with_attribute(MARKER_ATTRIBUTE, ctx.instance_id.clone());
        for (property, value) in base_root_styles(config) {
            node = node.with_style(property, value);
        }

        let id = page.insert_node(&ctx.container, node).map_err(|e| {
            WatermarkError::new(
                ErrorCode::RenderFailed,
                format!("Failed to insert surface node: {e}"),
            )
            .with_context("backend", self.mode().as_str())
        })?;

        tracing::debug!(
            instance = %ctx.instance_id,
            surface_width = width,
            surface_height = height,
            "Raster backend rendered surface"
        );

        Ok(vec![id])
    }
}
