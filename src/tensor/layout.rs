//! Page layout: row-major vs. tiled element order

use crate::error::{Error, Result};

/// Tile height in elements
pub const TILE_HEIGHT: usize = 32;
/// Tile width in elements
pub const TILE_WIDTH: usize = 32;

/// Order of elements within a tensor's backing buffer
///
/// `RowMajor` stores elements in plain C order. `Tile` packs the flattened
/// 2D view into 32x32 blocks (row-major over the tile grid, row-major within
/// each tile), the atomic unit the compute cores stream. Tiled tensors
/// require the last two extents of the flattened view to be tile-aligned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PageLayout {
    /// Plain row-major element order
    RowMajor,
    /// 32x32 tile-blocked element order
    Tile,
}

impl PageLayout {
    /// Validate that a shape may use this layout
    pub fn validate(self, shape: &[usize]) -> Result<()> {
        if self == PageLayout::Tile {
            let rows = super::shape::flat_rows(shape);
            let cols = super::shape::flat_cols(shape);
            if rows % TILE_HEIGHT != 0 || cols % TILE_WIDTH != 0 {
                return Err(Error::invalid_layout(format!(
                    "shape {shape:?} flattens to {rows}x{cols}, not a multiple of \
                     {TILE_HEIGHT}x{TILE_WIDTH}; pad before tilizing"
                )));
            }
        }
        Ok(())
    }
}

/// Permute a row-major value buffer into tile order
///
/// `rows` and `cols` are the flattened 2D extents and must be tile-aligned.
pub fn tilize<T: Copy>(src: &[T], rows: usize, cols: usize) -> Vec<T> {
    debug_assert_eq!(src.len(), rows * cols);
    debug_assert!(rows % TILE_HEIGHT == 0 && cols % TILE_WIDTH == 0);
    let tile_cols = cols / TILE_WIDTH;
    let mut out = Vec::with_capacity(src.len());
    for tr in 0..rows / TILE_HEIGHT {
        for tc in 0..tile_cols {
            for ir in 0..TILE_HEIGHT {
                let row = tr * TILE_HEIGHT + ir;
                let col = tc * TILE_WIDTH;
                out.extend_from_slice(&src[row * cols + col..row * cols + col + TILE_WIDTH]);
            }
        }
    }
    out
}

/// Permute a tile-ordered value buffer back to row-major
pub fn untilize<T: Copy + Default>(src: &[T], rows: usize, cols: usize) -> Vec<T> {
    debug_assert_eq!(src.len(), rows * cols);
    debug_assert!(rows % TILE_HEIGHT == 0 && cols % TILE_WIDTH == 0);
    let tile_cols = cols / TILE_WIDTH;
    let mut out = vec![T::default(); src.len()];
    let mut cursor = 0;
    for tr in 0..rows / TILE_HEIGHT {
        for tc in 0..tile_cols {
            for ir in 0..TILE_HEIGHT {
                let row = tr * TILE_HEIGHT + ir;
                let col = tc * TILE_WIDTH;
                out[row * cols + col..row * cols + col + TILE_WIDTH]
                    .copy_from_slice(&src[cursor..cursor + TILE_WIDTH]);
                cursor += TILE_WIDTH;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tilize_untilize_roundtrip() {
        let rows = 64;
        let cols = 96;
        let src: Vec<u32> = (0..rows * cols).map(|i| i as u32).collect();
        let tiled = tilize(&src, rows, cols);
        assert_ne!(tiled, src);
        assert_eq!(untilize(&tiled, rows, cols), src);
    }

    #[test]
    fn test_tilize_single_tile_is_identity() {
        let src: Vec<u32> = (0..TILE_HEIGHT * TILE_WIDTH).map(|i| i as u32).collect();
        assert_eq!(tilize(&src, TILE_HEIGHT, TILE_WIDTH), src);
    }

    #[test]
    fn test_tile_order_first_elements() {
        // second tile in the buffer is the tile to the right, not below
        let rows = TILE_HEIGHT;
        let cols = 2 * TILE_WIDTH;
        let src: Vec<u32> = (0..rows * cols).map(|i| i as u32).collect();
        let tiled = tilize(&src, rows, cols);
        assert_eq!(tiled[TILE_HEIGHT * TILE_WIDTH], TILE_WIDTH as u32);
    }

    #[test]
    fn test_validate_rejects_unaligned() {
        assert!(PageLayout::Tile.validate(&[1, 1, 62, 64]).is_err());
        assert!(PageLayout::Tile.validate(&[1, 1, 64, 64]).is_ok());
        assert!(PageLayout::RowMajor.validate(&[3, 5]).is_ok());
    }
}
