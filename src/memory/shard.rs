//! Shard geometry: validation and the canonical/sharded reorder plans

use super::{CoreCoord, CoreRangeSet, ShardOrientation, TensorMemoryLayout};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::{PageLayout, TILE_HEIGHT, TILE_WIDTH};

/// Geometry of a sharded tensor: which cores, what per-core shape, and the
/// traversal order assigning shards to cores
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardSpec {
    /// Cores receiving shards, in assignment order
    pub grid: CoreRangeSet,
    /// Per-shard shape in elements: `[rows, cols]` of the flattened 2D view
    pub shape: [usize; 2],
    /// Core traversal order
    pub orientation: ShardOrientation,
    /// Whether a non-evenly-dividing extent may pad the trailing shard
    pub allow_padding: bool,
}

impl ShardSpec {
    /// Create a shard spec with padding disallowed
    pub fn new(grid: CoreRangeSet, shape: [usize; 2], orientation: ShardOrientation) -> Self {
        Self {
            grid,
            shape,
            orientation,
            allow_padding: false,
        }
    }

    /// Opt in to zero-padding the trailing shard when the sharded extent does
    /// not divide evenly
    pub fn with_padding(mut self) -> Self {
        self.allow_padding = true;
        self
    }
}

/// One byte-copy step of a reorder plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyRun {
    /// Copy `len` bytes from canonical offset `src` to sharded offset `dst`
    Copy {
        /// Source byte offset in the canonical buffer
        src: usize,
        /// Destination byte offset in the sharded buffer
        dst: usize,
        /// Run length in bytes
        len: usize,
    },
    /// Zero-fill `len` padding bytes at sharded offset `dst`
    Zero {
        /// Destination byte offset in the sharded buffer
        dst: usize,
        /// Run length in bytes
        len: usize,
    },
}

/// Resolved shard geometry for a concrete tensor
///
/// Built once per (shape, layout, dtype, memory config) and cached inside
/// compiled data-movement programs: the reorder plan depends only on
/// structure, never on data.
#[derive(Clone, Debug)]
pub struct ShardLayout {
    /// Cores in shard order
    pub cores: Vec<CoreCoord>,
    /// Flattened 2D view: unit rows of the canonical buffer
    unit_rows: usize,
    /// Flattened 2D view: unit columns of the canonical buffer
    unit_cols: usize,
    /// Shard extent in units
    shard_unit_rows: usize,
    /// Shard extent in units
    shard_unit_cols: usize,
    /// Bytes per unit (element for row-major pages, whole tile for tiled)
    unit_bytes: usize,
    /// Per-shard 2D placement, in shard order: (unit_row_start, unit_col_start)
    shard_origins: Vec<(usize, usize)>,
}

impl ShardLayout {
    /// Validate a shard spec against a tensor and resolve the geometry
    ///
    /// The tensor's logical shape is flattened to 2D: all dims but the last
    /// collapse into rows, the last dim is the columns. In tiled page layout
    /// the unit of movement is a whole tile, so shard extents must be
    /// tile-aligned.
    pub fn build(
        shape: &[usize],
        page_layout: PageLayout,
        dtype: DType,
        scheme: TensorMemoryLayout,
        spec: &ShardSpec,
    ) -> Result<Self> {
        let volume: usize = shape.iter().product();
        let cols = *shape.last().unwrap_or(&1);
        if cols == 0 || volume == 0 {
            return Err(Error::invalid_shard_spec("cannot shard an empty tensor"));
        }
        let rows = volume / cols;
        let [shard_rows, shard_cols] = spec.shape;
        if shard_rows == 0 || shard_cols == 0 {
            return Err(Error::invalid_shard_spec("shard shape must be non-zero"));
        }

        // resolve the unit of movement
        let (unit_h, unit_w, unit_bytes) = match page_layout {
            PageLayout::RowMajor => {
                if dtype.is_block_float() {
                    return Err(Error::invalid_layout(format!(
                        "{dtype} requires tiled page layout"
                    )));
                }
                (1, 1, dtype.size_in_bytes())
            }
            PageLayout::Tile => (
                TILE_HEIGHT,
                TILE_WIDTH,
                dtype.buffer_bytes(TILE_HEIGHT * TILE_WIDTH),
            ),
        };
        if rows % unit_h != 0 || cols % unit_w != 0 {
            return Err(Error::invalid_layout(format!(
                "tensor extent {rows}x{cols} is not tile-aligned"
            )));
        }
        if shard_rows % unit_h != 0 || shard_cols % unit_w != 0 {
            return Err(Error::invalid_shard_spec(format!(
                "shard shape {shard_rows}x{shard_cols} is not tile-aligned"
            )));
        }

        let unit_rows = rows / unit_h;
        let unit_cols = cols / unit_w;
        let su_rows = shard_rows / unit_h;
        let su_cols = shard_cols / unit_w;
        let num_cores = spec.grid.num_cores();

        let check_extent = |extent: usize, shard_extent: usize, axis: &str| -> Result<usize> {
            let shards = extent.div_ceil(shard_extent);
            if extent % shard_extent != 0 && !spec.allow_padding {
                return Err(Error::invalid_shard_spec(format!(
                    "{axis} extent {extent} does not divide into shards of {shard_extent}; \
                     request padding explicitly"
                )));
            }
            Ok(shards)
        };

        // per-scheme shard placement, in core-assignment order
        let shard_origins: Vec<(usize, usize)> = match scheme {
            TensorMemoryLayout::HeightSharded => {
                if shard_cols != cols {
                    return Err(Error::invalid_shard_spec(format!(
                        "height sharding requires shard width {shard_cols} == tensor width {cols}"
                    )));
                }
                let shards = check_extent(unit_rows, su_rows, "row")?;
                if shards != num_cores {
                    return Err(Error::invalid_shard_spec(format!(
                        "{shards} height shards but grid has {num_cores} cores"
                    )));
                }
                (0..shards).map(|i| (i * su_rows, 0)).collect()
            }
            TensorMemoryLayout::WidthSharded => {
                if shard_rows != rows {
                    return Err(Error::invalid_shard_spec(format!(
                        "width sharding requires shard height {shard_rows} == tensor height {rows}"
                    )));
                }
                let shards = check_extent(unit_cols, su_cols, "column")?;
                if shards != num_cores {
                    return Err(Error::invalid_shard_spec(format!(
                        "{shards} width shards but grid has {num_cores} cores"
                    )));
                }
                (0..shards).map(|i| (0, i * su_cols)).collect()
            }
            TensorMemoryLayout::BlockSharded => {
                let block_rows = check_extent(unit_rows, su_rows, "row")?;
                let block_cols = check_extent(unit_cols, su_cols, "column")?;
                if block_rows * block_cols != num_cores {
                    return Err(Error::invalid_shard_spec(format!(
                        "{block_rows}x{block_cols} shard blocks but grid has {num_cores} cores"
                    )));
                }
                let mut origins = Vec::with_capacity(num_cores);
                match spec.orientation {
                    ShardOrientation::RowMajor => {
                        for r in 0..block_rows {
                            for c in 0..block_cols {
                                origins.push((r * su_rows, c * su_cols));
                            }
                        }
                    }
                    ShardOrientation::ColMajor => {
                        for c in 0..block_cols {
                            for r in 0..block_rows {
                                origins.push((r * su_rows, c * su_cols));
                            }
                        }
                    }
                }
                origins
            }
            TensorMemoryLayout::Interleaved => {
                return Err(Error::invalid_shard_spec(
                    "interleaved layout takes no shard spec",
                ))
            }
        };

        Ok(Self {
            cores: spec.grid.cores(spec.orientation),
            unit_rows,
            unit_cols,
            shard_unit_rows: su_rows,
            shard_unit_cols: su_cols,
            unit_bytes,
            shard_origins,
        })
    }

    /// Number of shards (== number of cores)
    pub fn num_shards(&self) -> usize {
        self.shard_origins.len()
    }

    /// Bytes of one shard, padding included
    pub fn shard_bytes(&self) -> usize {
        self.shard_unit_rows * self.shard_unit_cols * self.unit_bytes
    }

    /// Total bytes of the sharded buffer, padding included
    pub fn buffer_bytes(&self) -> usize {
        self.shard_bytes() * self.num_shards()
    }

    /// Reorder plan: canonical buffer -> shard-ordered buffer
    ///
    /// Emits one run per contiguous unit row segment; padding regions become
    /// zero-fill runs.
    pub fn runs_to_sharded(&self) -> Vec<CopyRun> {
        let mut runs = Vec::new();
        let mut dst = 0usize;
        let row_seg = self.shard_unit_cols * self.unit_bytes;
        for &(r0, c0) in &self.shard_origins {
            for lr in 0..self.shard_unit_rows {
                let r = r0 + lr;
                if r >= self.unit_rows || c0 >= self.unit_cols {
                    runs.push(CopyRun::Zero { dst, len: row_seg });
                    dst += row_seg;
                    continue;
                }
                let cols_here = self.shard_unit_cols.min(self.unit_cols - c0);
                let live = cols_here * self.unit_bytes;
                runs.push(CopyRun::Copy {
                    src: (r * self.unit_cols + c0) * self.unit_bytes,
                    dst,
                    len: live,
                });
                dst += live;
                if live < row_seg {
                    runs.push(CopyRun::Zero {
                        dst,
                        len: row_seg - live,
                    });
                    dst += row_seg - live;
                }
            }
        }
        runs
    }

    /// Reorder plan: shard-ordered buffer -> canonical buffer
    ///
    /// The inverse of [`Self::runs_to_sharded`]; padding runs are dropped.
    pub fn runs_to_canonical(&self) -> Vec<CopyRun> {
        self.runs_to_sharded()
            .into_iter()
            .filter_map(|run| match run {
                CopyRun::Copy { src, dst, len } => Some(CopyRun::Copy {
                    src: dst,
                    dst: src,
                    len,
                }),
                CopyRun::Zero { .. } => None,
            })
            .collect()
    }
}

/// Apply a reorder plan to produce the destination buffer
pub(crate) fn apply_runs(runs: &[CopyRun], src: &[u8], dst: &mut [u8]) {
    for run in runs {
        match *run {
            CopyRun::Copy { src: s, dst: d, len } => {
                dst[d..d + len].copy_from_slice(&src[s..s + len]);
            }
            CopyRun::Zero { dst: d, len } => {
                dst[d..d + len].fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CoreRangeSet;

    fn height_spec(grid: CoreRangeSet, shape: [usize; 2]) -> ShardSpec {
        ShardSpec::new(grid, shape, ShardOrientation::RowMajor)
    }

    #[test]
    fn test_height_shard_geometry() {
        // 64x64 bf16 tensor, two cores, 32-row shards
        let spec = height_spec(CoreRangeSet::rect((0, 0), (0, 1)).unwrap(), [32, 64]);
        let layout = ShardLayout::build(
            &[1, 1, 64, 64],
            PageLayout::Tile,
            DType::BF16,
            TensorMemoryLayout::HeightSharded,
            &spec,
        )
        .unwrap();
        assert_eq!(layout.num_shards(), 2);
        assert_eq!(layout.shard_bytes(), 32 * 64 * 2);
        assert_eq!(layout.buffer_bytes(), 64 * 64 * 2);
    }

    #[test]
    fn test_uneven_shard_rejected_without_padding() {
        let spec = height_spec(CoreRangeSet::rect((0, 0), (0, 2)).unwrap(), [32, 64]);
        let err = ShardLayout::build(
            &[1, 1, 80, 64],
            PageLayout::RowMajor,
            DType::BF16,
            TensorMemoryLayout::HeightSharded,
            &spec,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_uneven_shard_pads_when_requested() {
        let spec =
            height_spec(CoreRangeSet::rect((0, 0), (0, 2)).unwrap(), [32, 64]).with_padding();
        let layout = ShardLayout::build(
            &[1, 1, 80, 64],
            PageLayout::RowMajor,
            DType::BF16,
            TensorMemoryLayout::HeightSharded,
            &spec,
        )
        .unwrap();
        assert_eq!(layout.num_shards(), 3);
        // trailing shard is half padding
        let zeros: usize = layout
            .runs_to_sharded()
            .iter()
            .filter_map(|r| match r {
                CopyRun::Zero { len, .. } => Some(*len),
                _ => None,
            })
            .sum();
        assert_eq!(zeros, 16 * 64 * 2);
    }

    #[test]
    fn test_core_count_mismatch_rejected() {
        let spec = height_spec(CoreRangeSet::rect((0, 0), (0, 3)).unwrap(), [32, 64]);
        assert!(ShardLayout::build(
            &[1, 1, 64, 64],
            PageLayout::Tile,
            DType::BF16,
            TensorMemoryLayout::HeightSharded,
            &spec,
        )
        .is_err());
    }

    #[test]
    fn test_block_float_requires_tile_layout() {
        let spec = height_spec(CoreRangeSet::rect((0, 0), (0, 1)).unwrap(), [32, 64]);
        assert!(ShardLayout::build(
            &[1, 1, 64, 64],
            PageLayout::RowMajor,
            DType::Bfp8,
            TensorMemoryLayout::HeightSharded,
            &spec,
        )
        .is_err());
    }

    #[test]
    fn test_roundtrip_through_runs() {
        let spec = height_spec(CoreRangeSet::rect((0, 0), (0, 1)).unwrap(), [2, 4]);
        let layout = ShardLayout::build(
            &[4, 4],
            PageLayout::RowMajor,
            DType::U8,
            TensorMemoryLayout::HeightSharded,
            &spec,
        )
        .unwrap();
        let canonical: Vec<u8> = (0..16).collect();
        let mut sharded = vec![0u8; layout.buffer_bytes()];
        apply_runs(&layout.runs_to_sharded(), &canonical, &mut sharded);
        let mut back = vec![0u8; 16];
        apply_runs(&layout.runs_to_canonical(), &sharded, &mut back);
        assert_eq!(back, canonical);
    }

    #[test]
    fn test_block_shard_origins_row_major() {
        let spec = ShardSpec::new(
            CoreRangeSet::rect((0, 0), (1, 1)).unwrap(),
            [32, 32],
            ShardOrientation::RowMajor,
        );
        let layout = ShardLayout::build(
            &[1, 1, 64, 64],
            PageLayout::Tile,
            DType::BF16,
            TensorMemoryLayout::BlockSharded,
            &spec,
        )
        .unwrap();
        assert_eq!(
            layout.shard_origins,
            vec![(0, 0), (0, 1), (1, 0), (1, 1)],
        );
    }
}
