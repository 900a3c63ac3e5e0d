//! Text rasterization for the raster backend.
//!
//! Renders watermark text into transparent RGBA tiles that the compositor
//! stamps across the surface buffer.
//!
//! # Features
//!
//! - Hex color parsing (#RGB and #RRGGBB formats)
//! - Configurable font size and opacity
//! - Rotation with bilinear resampling
//!
//! No font ships with the crate; the embedder supplies font bytes and the
//! raster backend reports itself unsupported without them.

use crate::error::{ErrorCode, Result, WatermarkError};
use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};

/// Parsed RGB color from a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0)
    }
}

/// Options for rendering one text tile.
#[derive(Debug, Clone)]
pub struct TextTileOptions {
    pub text: String,
    /// Font size in device pixels.
    pub font_size: f32,
    pub color: Color,
    /// Opacity from 0.0 to 1.0, baked into the tile's alpha channel.
    pub opacity: f32,
    /// Clockwise rotation in degrees.
    pub rotation_degrees: Option<f32>,
}

/// Parse a hex color string into RGB components.
///
/// Supports both #RGB and #RRGGBB formats.
pub fn parse_hex_color(hex: &str) -> Result<Color> {
    let invalid =
        |msg: &str| WatermarkError::new(ErrorCode::RenderFailed, format!("Invalid color: {msg}"));

    let hex = hex
        .strip_prefix('#')
        .ok_or_else(|| invalid("must start with '#'"))?;

    let digit = |s: &str| u8::from_str_radix(s, 16).map_err(|_| invalid("invalid hex digit"));

    match hex.len() {
        3 => {
            // #RGB - each digit doubled: 0xF -> 0xFF
            let r = digit(&hex[0..1])?;
            let g = digit(&hex[1..2])?;
            let b = digit(&hex[2..3])?;
            Ok(Color::new(r * 17, g * 17, b * 17))
        }
        6 => Ok(Color::new(
            digit(&hex[0..2])?,
            digit(&hex[2..4])?,
            digit(&hex[4..6])?,
        )),
        n => Err(invalid(&format!(
            "must be #RGB or #RRGGBB format, got {n} characters"
        ))),
    }
}

/// Text rasterizer bound to an embedder-supplied font.
#[derive(Clone)]
pub struct TextRasterizer {
    font: FontArc,
}

impl std::fmt::Debug for TextRasterizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextRasterizer").finish()
    }
}

impl TextRasterizer {
    /// Load a rasterizer from TTF/OTF font bytes.
    pub fn from_font_bytes(bytes: Vec<u8>) -> Result<Self> {
        let font = FontArc::try_from_vec(bytes).map_err(|e| {
            WatermarkError::new(
                ErrorCode::FontUnavailable,
                format!("Failed to load font: {e}"),
            )
        })?;
        Ok(Self { font })
    }

    /// Measure rendered text dimensions in pixels.
    pub fn measure(&self, text: &str, font_size: f32) -> (u32, u32) {
        let scale = PxScale::from(font_size);
        let scaled_font = self.font.as_scaled(scale);

        let mut width = 0.0f32;
        let mut prev_glyph: Option<ab_glyph::GlyphId> = None;

        for c in text.chars() {
            let glyph_id = scaled_font.glyph_id(c);
            if let Some(prev) = prev_glyph {
                width += scaled_font.kern(prev, glyph_id);
            }
            width += scaled_font.h_advance(glyph_id);
            prev_glyph = Some(glyph_id);
        }

        let height = scaled_font.height();

        // Small padding so antialiased edges survive
        let padding = 2;
        (width.ceil() as u32 + padding, height.ceil() as u32 + padding)
    }

    /// Render text to a transparent RGBA tile.
    pub fn render_tile(&self, options: &TextTileOptions) -> Result<RgbaImage> {
        if options.text.is_empty() {
            return Err(WatermarkError::new(
                ErrorCode::RenderFailed,
                "Cannot render empty text",
            ));
        }

        let scale = PxScale::from(options.font_size);
        let scaled_font = self.font.as_scaled(scale);
        let (width, height) = self.measure(&options.text, options.font_size);

        let mut image = RgbaImage::new(width.max(1), height.max(1));
        let alpha = (options.opacity.clamp(0.0, 1.0) * 255.0) as u8;
        let baseline_y = scaled_font.ascent();

        let mut cursor_x = 0.0f32;
        let mut prev_glyph: Option<ab_glyph::GlyphId> = None;

        for c in options.text.chars() {
            let glyph_id = scaled_font.glyph_id(c);
            if let Some(prev) = prev_glyph {
                cursor_x += scaled_font.kern(prev, glyph_id);
            }

            let glyph =
                glyph_id.with_scale_and_position(scale, ab_glyph::point(cursor_x, baseline_y));

            if let Some(outlined) = self.font.outline_glyph(glyph) {
                let bounds = outlined.px_bounds();
                let (canvas_w, canvas_h) = (image.width() as i32, image.height() as i32);

                outlined.draw(|px, py, coverage| {
                    let x = px as i32 + bounds.min.x as i32;
                    let y = py as i32 + bounds.min.y as i32;

                    if x >= 0 && y >= 0 && x < canvas_w && y < canvas_h {
                        let pixel_alpha = (coverage * alpha as f32) as u8;
                        let pixel = Rgba([
                            options.color.r,
                            options.color.g,
                            options.color.b,
                            pixel_alpha,
                        ]);
                        let existing = image.get_pixel(x as u32, y as u32);
                        let blended = blend_over(*existing, pixel);
                        image.put_pixel(x as u32, y as u32, blended);
                    }
                });
            }

            cursor_x += scaled_font.h_advance(glyph_id);
            prev_glyph = Some(glyph_id);
        }

        if let Some(degrees) = options.rotation_degrees {
            if degrees != 0.0 {
                image = rotate_tile(&image, degrees);
            }
        }

        Ok(image)
    }
}

/// Alpha-composite `top` over `bottom` (antialiased glyph overlap).
fn blend_over(bottom: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    let top_alpha = top[3] as f32 / 255.0;
    let bottom_alpha = bottom[3] as f32 / 255.0;
    let out_alpha = top_alpha + bottom_alpha * (1.0 - top_alpha);

    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let blend = |t: u8, b: u8| -> u8 {
        let t = t as f32 / 255.0;
        let b = b as f32 / 255.0;
        let result = (t * top_alpha + b * bottom_alpha * (1.0 - top_alpha)) / out_alpha;
        (result * 255.0) as u8
    };

    Rgba([
        blend(top[0], bottom[0]),
        blend(top[1], bottom[1]),
        blend(top[2], bottom[2]),
        (out_alpha * 255.0) as u8,
    ])
}

/// Rotate a tile by the given degrees (clockwise) with bilinear sampling.
fn rotate_tile(image: &RgbaImage, degrees: f32) -> RgbaImage {
    let radians = -degrees.to_radians();
    let cos = radians.cos();
    let sin = radians.sin();

    let src_w = image.width() as f32;
    let src_h = image.height() as f32;
    let cx = src_w / 2.0;
    let cy = src_h / 2.0;

    let corners = [
        (-cx, -cy),
        (src_w - cx, -cy),
        (-cx, src_h - cy),
        (src_w - cx, src_h - cy),
    ];

    let rotated: Vec<(f32, f32)> = corners
        .iter()
        .map(|(x, y)| (x * cos - y * sin, x * sin + y * cos))
        .collect();

    let min_x = rotated.iter().map(|(x, _)| *x).fold(f32::INFINITY, f32::min);
    let max_x = rotated
        .iter()
        .map(|(x, _)| *x)
        .fold(f32::NEG_INFINITY, f32::max);
    let min_y = rotated.iter().map(|(_, y)| *y).fold(f32::INFINITY, f32::min);
    let max_y = rotated
        .iter()
        .map(|(_, y)| *y)
        .fold(f32::NEG_INFINITY, f32::max);

    let dst_w = ((max_x - min_x).ceil() as u32).max(1);
    let dst_h = ((max_y - min_y).ceil() as u32).max(1);

    let mut output = RgbaImage::new(dst_w, dst_h);
    let dst_cx = dst_w as f32 / 2.0;
    let dst_cy = dst_h as f32 / 2.0;

    let inv_cos = (-radians).cos();
    let inv_sin = (-radians).sin();

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let rx = dx as f32 - dst_cx;
            let ry = dy as f32 - dst_cy;
            let sx = rx * inv_cos - ry * inv_sin + cx;
            let sy = rx * inv_sin + ry * inv_cos + cy;

            if sx >= 0.0 && sx < src_w - 1.0 && sy >= 0.0 && sy < src_h - 1.0 {
                let x0 = sx.floor() as u32;
                let y0 = sy.floor() as u32;
                let fx = sx - x0 as f32;
                let fy = sy - y0 as f32;

                let p00 = image.get_pixel(x0, y0);
                let p10 = image.get_pixel(x0 + 1, y0);
                let p01 = image.get_pixel(x0, y0 + 1);
                let p11 = image.get_pixel(x0 + 1, y0 + 1);

                let interpolate = |c: usize| -> u8 {
                    let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + p10[c] as f32 * fx * (1.0 - fy)
                        + p01[c] as f32 * (1.0 - fx) * fy
                        + p11[c] as f32 * fx * fy;
                    v.clamp(0.0, 255.0) as u8
                };

                output.put_pixel(
                    dx,
                    dy,
                    Rgba([
                        interpolate(0),
                        interpolate(1),
                        interpolate(2),
                        interpolate(3),
                    ]),
                );
            }
        }
    }

    output
}
