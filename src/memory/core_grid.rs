//! Compute-core grid coordinates and core range sets

use crate::error::{Error, Result};
use std::fmt;

/// Coordinate of one compute core on the device grid
///
/// `x` is the column, `y` the row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreCoord {
    /// Column on the grid
    pub x: usize,
    /// Row on the grid
    pub y: usize,
}

impl CoreCoord {
    /// Create a core coordinate
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Inclusive rectangular region of cores, `start` at the top-left
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CoreRange {
    /// Top-left corner (inclusive)
    pub start: CoreCoord,
    /// Bottom-right corner (inclusive)
    pub end: CoreCoord,
}

impl CoreRange {
    /// Create a range; `start` must not exceed `end` on either axis
    pub fn new(start: CoreCoord, end: CoreCoord) -> Result<Self> {
        if start.x > end.x || start.y > end.y {
            return Err(Error::invalid_shard_spec(format!(
                "core range start {start} exceeds end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of cores covered by the range
    pub fn num_cores(&self) -> usize {
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    /// Whether the range contains a core
    pub fn contains(&self, c: CoreCoord) -> bool {
        c.x >= self.start.x && c.x <= self.end.x && c.y >= self.start.y && c.y <= self.end.y
    }

    /// Whether two ranges overlap
    pub fn intersects(&self, other: &CoreRange) -> bool {
        self.start.x <= other.end.x
            && other.start.x <= self.end.x
            && self.start.y <= other.end.y
            && other.start.y <= self.end.y
    }

    fn cores_row_major(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        (self.start.y..=self.end.y)
            .flat_map(move |y| (self.start.x..=self.end.x).map(move |x| CoreCoord { x, y }))
    }

    fn cores_col_major(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        (self.start.x..=self.end.x)
            .flat_map(move |x| (self.start.y..=self.end.y).map(move |y| CoreCoord { x, y }))
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Ordered set of non-overlapping core ranges
///
/// Shards map to cores by enumerating the ranges in order, each range
/// traversed per the shard orientation. The ranges must not overlap; that is
/// validated at construction so every downstream consumer can assume a core
/// appears at most once.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    /// Build a set from ranges, rejecting overlaps
    pub fn new(ranges: Vec<CoreRange>) -> Result<Self> {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.intersects(b) {
                    return Err(Error::invalid_shard_spec(format!(
                        "core ranges {a} and {b} overlap"
                    )));
                }
            }
        }
        Ok(Self { ranges })
    }

    /// Convenience constructor for a single rectangle given corner tuples
    pub fn rect(start: (usize, usize), end: (usize, usize)) -> Result<Self> {
        Self::new(vec![CoreRange::new(
            CoreCoord::new(start.0, start.1),
            CoreCoord::new(end.0, end.1),
        )?])
    }

    /// The ranges in declaration order
    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    /// Total number of cores in the set
    pub fn num_cores(&self) -> usize {
        self.ranges.iter().map(CoreRange::num_cores).sum()
    }

    /// Cores in shard-assignment order for the given orientation
    pub fn cores(&self, orientation: ShardOrientation) -> Vec<CoreCoord> {
        let mut out = Vec::with_capacity(self.num_cores());
        for r in &self.ranges {
            match orientation {
                ShardOrientation::RowMajor => out.extend(r.cores_row_major()),
                ShardOrientation::ColMajor => out.extend(r.cores_col_major()),
            }
        }
        out
    }

    /// Bounding-box extent check against a device grid size
    pub fn fits_within(&self, grid: CoreCoord) -> bool {
        self.ranges
            .iter()
            .all(|r| r.end.x < grid.x && r.end.y < grid.y)
    }
}

/// Traversal order of cores within a range when assigning shards
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardOrientation {
    /// Row-by-row (x fastest)
    RowMajor,
    /// Column-by-column (y fastest)
    ColMajor,
}
