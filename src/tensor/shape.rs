//! Shape utilities

use crate::error::{Error, Result};
use smallvec::SmallVec;

/// Stack allocation threshold for dimensions
///
/// Most tensors have 4 or fewer dimensions, so we stack-allocate up to 4.
const STACK_DIMS: usize = 4;

/// Shape type: dimensions of a tensor
pub type Shape = SmallVec<[usize; STACK_DIMS]>;

/// Total number of elements for a shape
#[inline]
pub fn volume(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Rows of the flattened 2D view (all dims but the last collapsed)
#[inline]
pub fn flat_rows(shape: &[usize]) -> usize {
    let cols = flat_cols(shape);
    if cols == 0 {
        0
    } else {
        volume(shape) / cols
    }
}

/// Columns of the flattened 2D view (the last dim)
#[inline]
pub fn flat_cols(shape: &[usize]) -> usize {
    *shape.last().unwrap_or(&1)
}

/// Resolve a reshape target against an element count
///
/// At most one dimension may be the wildcard `-1`, inferred from the rest.
/// The resolved shape must preserve the element count exactly.
pub fn resolve_reshape(elem_count: usize, dims: &[isize]) -> Result<Shape> {
    let mut wildcard = None;
    let mut known: usize = 1;
    for (i, &d) in dims.iter().enumerate() {
        match d {
            -1 => {
                if wildcard.replace(i).is_some() {
                    return Err(Error::invalid_argument(
                        "shape",
                        "at most one dimension may be -1",
                    ));
                }
            }
            d if d > 0 => known *= d as usize,
            d => {
                return Err(Error::invalid_argument(
                    "shape",
                    format!("dimension {d} is not positive"),
                ))
            }
        }
    }

    let mut out: Shape = dims.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(i) = wildcard {
        if known == 0 || elem_count % known != 0 {
            return Err(Error::invalid_argument(
                "shape",
                format!("cannot infer wildcard: {elem_count} elements over {known}"),
            ));
        }
        out[i] = elem_count / known;
    } else if known != elem_count {
        return Err(Error::ShapeMismatch {
            expected: vec![elem_count],
            got: vec![known],
        });
    }
    Ok(out)
}

/// Normalize a possibly-negative dimension index
pub fn normalize_dim(dim: isize, ndim: usize) -> Result<usize> {
    let idx = if dim < 0 { ndim as isize + dim } else { dim };
    if idx >= 0 && (idx as usize) < ndim {
        Ok(idx as usize)
    } else {
        Err(Error::InvalidDimension { dim, ndim })
    }
}
