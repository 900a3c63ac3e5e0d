//! Grid layout calculation for repeated watermark items.
//!
//! Layout is derived purely from configuration and container geometry and
//! is never cached across resizes. Every backend computes cell placement
//! through this routine, which is what lets the factory switch backends
//! without visual discontinuity.

use crate::config::LayoutConfig;
use crate::host::Rect;

/// A single grid cell position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPosition {
    pub x: i32,
    pub y: i32,
    pub row: u32,
    pub col: u32,
}

/// Computed grid for placing repeated watermark items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutResult {
    pub rows: u32,
    pub cols: u32,
    pub gap_x: u32,
    pub gap_y: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    /// Cell footprint; items are laid out on a gap-sized lattice.
    pub item_width: u32,
    pub item_height: u32,
    pub total_width: u32,
    pub total_height: u32,
    /// Row-major cell positions.
    pub positions: Vec<CellPosition>,
}

/// Compute the layout grid for a container.
///
/// In auto mode the grid extends one cell past the container edge so the
/// pattern has no bare margin:
/// `cols = max(1, ceil(width / gap_x) + 1)`,
/// `rows = max(1, ceil(height / gap_y) + 1)`.
/// Fixed `rows`/`cols` in the config override the computation.
pub fn compute(layout: &LayoutConfig, rect: &Rect) -> LayoutResult {
    let gap_x = layout.gap_x.max(1);
    let gap_y = layout.gap_y.max(1);

    let width = if rect.width > 0.0 { rect.width } else { 800.0 };
    let height = if rect.height > 0.0 { rect.height } else { 600.0 };

    let cols = match layout.cols {
        Some(cols) => cols.max(1),
        None => ((width / gap_x as f64).ceil() as u32 + 1).max(1),
    };
    let rows = match layout.rows {
        Some(rows) => rows.max(1),
        None => ((height / gap_y as f64).ceil() as u32 + 1).max(1),
    };

    let mut positions = Vec::with_capacity((rows * cols) as usize);
    for row in 0..rows {
        for col in 0..cols {
            positions.push(CellPosition {
                x: (col * gap_x) as i32 + layout.offset_x,
                y: (row * gap_y) as i32 + layout.offset_y,
                row,
                col,
            });
        }
    }

    LayoutResult {
        rows,
        cols,
        gap_x,
        gap_y,
        offset_x: layout.offset_x,
        offset_y: layout.offset_y,
        item_width: gap_x,
        item_height: gap_y,
        total_width: cols * gap_x,
        total_height: rows * gap_y,
        positions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(gap_x: u32, gap_y: u32) -> LayoutConfig {
        LayoutConfig {
            gap_x,
            gap_y,
            ..LayoutConfig::default()
        }
    }

    #[test]
    fn test_default_grid_for_800x600() {
        let result = compute(&layout(100, 100), &Rect::sized(800.0, 600.0));
        // ceil(800/100)+1 = 9 columns, ceil(600/100)+1 = 7 rows
        assert_eq!(result.cols, 9);
        assert_eq!(result.rows, 7);
        assert_eq!(result.positions.len(), 63);
    }

    #[test]
    fn test_non_divisible_dimensions_round_up() {
        let result = compute(&layout(100, 100), &Rect::sized(850.0, 610.0));
        assert_eq!(result.cols, 10); // ceil(8.5)+1
        assert_eq!(result.rows, 8); // ceil(6.1)+1
    }

    #[test]
    fn test_tiny_container_still_renders_one_cell() {
        let result = compute(&layout(100, 100), &Rect::sized(10.0, 10.0));
        assert_eq!(result.cols, 2);
        assert_eq!(result.rows, 2);
    }

    #[test]
    fn test_positions_follow_gap_lattice() {
        let result = compute(&layout(100, 50), &Rect::sized(200.0, 100.0));
        assert!(result.positions.contains(&CellPosition {
            x: 0,
            y: 0,
            row: 0,
            col: 0
        }));
        assert!(result.positions.contains(&CellPosition {
            x: 100,
            y: 50,
            row: 1,
            col: 1
        }));
        // Row-major ordering
        assert_eq!(result.positions[0].row, 0);
        assert_eq!(result.positions[1].col, 1);
    }

    #[test]
    fn test_offsets_shift_every_cell() {
        let config = LayoutConfig {
            gap_x: 100,
            gap_y: 100,
            offset_x: 25,
            offset_y: -10,
            ..LayoutConfig::default()
        };
        let result = compute(&config, &Rect::sized(200.0, 200.0));
        assert_eq!(result.positions[0].x, 25);
        assert_eq!(result.positions[0].y, -10);
        assert_eq!(result.positions[1].x, 125);
    }

    #[test]
    fn test_fixed_rows_cols_override_auto() {
        let config = LayoutConfig {
            gap_x: 100,
            gap_y: 100,
            rows: Some(2),
            cols: Some(3),
            ..LayoutConfig::default()
        };
        let result = compute(&config, &Rect::sized(1920.0, 1080.0));
        assert_eq!(result.rows, 2);
        assert_eq!(result.cols, 3);
        assert_eq!(result.positions.len(), 6);
    }

    #[test]
    fn test_zero_sized_container_uses_fallback_geometry() {
        let result = compute(&layout(100, 100), &Rect::sized(0.0, 0.0));
        assert_eq!(result.cols, 9);
        assert_eq!(result.rows, 7);
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let a = compute(&layout(120, 80), &Rect::sized(1024.0, 768.0));
        let b = compute(&layout(120, 80), &Rect::sized(1024.0, 768.0));
        assert_eq!(a, b);
    }
}
