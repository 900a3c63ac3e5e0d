//! Surface compositing for the raster backend.
//!
//! Stamps pre-rendered RGBA tiles onto the surface buffer at the grid
//! positions computed by the layout routine, using Porter-Duff "over"
//! alpha blending.

use super::layout::LayoutResult;
use image::{Rgba, RgbaImage};

/// One tile placement on the surface.
#[derive(Clone)]
pub struct TileLayer {
    pub tile: RgbaImage,
    pub x: i32,
    pub y: i32,
    /// Extra opacity multiplied onto the tile's own alpha.
    pub opacity: f32,
}

impl std::fmt::Debug for TileLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLayer")
            .field("dimensions", &(self.tile.width(), self.tile.height()))
            .field("position", &(self.x, self.y))
            .field("opacity", &self.opacity)
            .finish()
    }
}

/// Stamp a tile across every cell of a layout grid.
///
/// Positions are scaled by `scale` so device-pixel-ratio surfaces place
/// cells on the same visual lattice as the css-pixel backends.
pub fn grid_layers(tile: &RgbaImage, layout: &LayoutResult, scale: f64, opacity: f32) -> Vec<TileLayer> {
    layout
        .positions
        .iter()
        .map(|pos| TileLayer {
            tile: tile.clone(),
            x: (pos.x as f64 * scale) as i32,
            y: (pos.y as f64 * scale) as i32,
            opacity,
        })
        .collect()
}

/// Blend every layer onto the target surface, in order.
pub fn apply_layers(target: &mut RgbaImage, layers: &[TileLayer]) {
    for layer in layers {
        blend_layer(target, layer);
    }
}

/// Blend a single tile layer onto the target, clipped to its bounds.
fn blend_layer(target: &mut RgbaImage, layer: &TileLayer) {
    let target_w = target.width() as i32;
    let target_h = target.height() as i32;
    let tile_w = layer.tile.width() as i32;
    let tile_h = layer.tile.height() as i32;

    let x_start = layer.x.max(0);
    let y_start = layer.y.max(0);
    let x_end = (layer.x + tile_w).min(target_w);
    let y_end = (layer.y + tile_h).min(target_h);

    for ty in y_start..y_end {
        for tx in x_start..x_end {
            let wx = (tx - layer.x) as u32;
            let wy = (ty - layer.y) as u32;

            let tile_pixel = layer.tile.get_pixel(wx, wy);
            let target_pixel = target.get_pixel(tx as u32, ty as u32);
            let blended = blend_pixels(*target_pixel, *tile_pixel, layer.opacity);
            target.put_pixel(tx as u32, ty as u32, blended);
        }
    }
}

/// Porter-Duff "over" with an extra opacity factor on the foreground.
fn blend_pixels(background: Rgba<u8>, foreground: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    let fg_alpha = (foreground[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
    let bg_alpha = background[3] as f32 / 255.0;
    let out_alpha = fg_alpha + bg_alpha * (1.0 - fg_alpha);

    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let blend_channel = |fg: u8, bg: u8| -> u8 {
        let fg_f = fg as f32 / 255.0;
        let bg_f = bg as f32 / 255.0;
        let result = (fg_f * fg_alpha + bg_f * bg_alpha * (1.0 - fg_alpha)) / out_alpha;
        (result * 255.0).clamp(0.0, 255.0) as u8
    };

    Rgba([
        blend_channel(foreground[0], background[0]),
        blend_channel(foreground[1], background[1]),
        blend_channel(foreground[2], background[2]),
        (out_alpha * 255.0) as u8,
    ])
}
