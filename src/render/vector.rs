//! Vector backend: the whole grid emitted as one structured-markup node.
//!
//! Builds an svg document sized to the container with one `<text>` (and
//! optionally one `<image>`) child per grid cell, rotated around its own
//! anchor point. The host receives a single markup node, so tamper
//! detection watches exactly one element for this backend.

use super::{base_root_styles, layout, Renderer, RenderContext, MARKER_ATTRIBUTE};
use crate::config::{RenderMode, WatermarkConfig};
use crate::error::{ErrorCode, Result, WatermarkError};
use crate::host::{HostPage, NodeId, VisualNode};
use async_trait::async_trait;
use std::fmt::Write as _;

/// Renderer emitting one svg markup node for the whole grid.
#[derive(Debug, Clone, Default)]
pub struct VectorRenderer;

impl VectorRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Build the svg document for a config and container.
    fn build_document(&self, config: &WatermarkConfig, ctx: &RenderContext) -> String {
        let grid = layout::compute(&config.layout, &ctx.container_rect);
        let style = &config.style;
        let width = ctx.container_rect.width;
        let height = ctx.container_rect.height;

        let mut doc = String::with_capacity(grid.positions.len() * 96 + 256);
        let _ = write!(
            doc,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        );
        let _ = write!(
            doc,
            r#"<g fill="{}" font-size="{}" font-family="{}" font-weight="{}" opacity="{}">"#,
            style.color,
            style.font_size,
            escape_attribute(&style.font_family),
            escape_attribute(&style.font_weight),
            style.opacity,
        );

        for pos in &grid.positions {
            if let Some(text) = &config.content.text {
                // Baseline sits one font-size below the cell origin
                let baseline = pos.y as f32 + style.font_size;
                if style.rotation != 0.0 {
                    let _ = write!(
                        doc,
                        r#"<text x="{}" y="{}" transform="rotate({} {} {})">{}</text>"#,
                        pos.x,
                        baseline,
                        style.rotation,
                        pos.x,
                        baseline,
                        escape_text(text),
                    );
                } else {
                    let _ = write!(
                        doc,
                        r#"<text x="{}" y="{}">{}</text>"#,
                        pos.x,
                        baseline,
                        escape_text(text),
                    );
                }
            }

            if let Some(image) = &config.content.image {
                let _ = write!(
                    doc,
                    r#"<image href="{}" x="{}" y="{}""#,
                    escape_attribute(&image.src),
                    pos.x,
                    pos.y,
                );
                if let Some(w) = image.width {
                    let _ = write!(doc, r#" width="{w}""#);
                }
                if let Some(h) = image.height {
                    let _ = write!(doc, r#" height="{h}""#);
                }
                if let Some(op) = image.opacity {
                    let _ = write!(doc, r#" opacity="{op}""#);
                }
                doc.push_str("/>");
            }
        }

        doc.push_str("</g></svg>");
        doc
    }
}

/// Escape text content for embedding in markup.
fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape an attribute value for embedding in markup.
fn escape_attribute(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

#[async_trait]
impl Renderer for VectorRenderer {
    fn mode(&self) -> RenderMode {
        RenderMode::Vector
    }

    fn is_supported(&self, ctx: &RenderContext) -> bool {
        ctx.capabilities.vector
    }

    async fn render(
        &self,
        page: &dyn HostPage,
        config: &WatermarkConfig,
        ctx: &RenderContext,
    ) -> Result<Vec<NodeId>> {
        let document = self.build_document(config, ctx);

        let mut node = VisualNode::markup(document)
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
                format!("Failed to insert markup node: {e}"),
            )
            .with_context("backend", self.mode().as_str())
        })?;

        tracing::debug!(instance = %ctx.instance_id, "Vector backend rendered document");

        Ok(vec![id])
    }
}
