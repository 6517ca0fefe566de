//! Data type system for tilr tensors
//!
//! This module provides the `DType` enum representing all supported element
//! types, including the two block-compressed float formats the tiled wire
//! format uses, along with host-side conversion utilities.

pub mod bfp;
mod element;

pub use element::Element;

use std::fmt;

/// Data types supported by tilr tensors
///
/// Using an enum (rather than generics) allows runtime type selection and
/// support for the block-compressed formats, which have no per-element host
/// representation.
///
/// The two block formats (`Bfp8`, `Bfp4`) pack 16 consecutive elements into
/// one block sharing a single 8-bit exponent; they are legal only in tiled
/// page layout, where blocks never straddle a tile boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum DType {
    /// 32-bit floating point
    F32 = 0,
    /// 16-bit floating point (IEEE 754)
    F16 = 1,
    /// 16-bit brain floating point (the primary wire format)
    BF16 = 2,
    /// Block-compressed float: 16 elements share an 8-bit exponent,
    /// 1 sign + 7 mantissa bits per element
    Bfp8 = 3,
    /// Block-compressed float: 16 elements share an 8-bit exponent,
    /// 1 sign + 3 mantissa bits per element
    Bfp4 = 4,

    /// 32-bit unsigned integer
    U32 = 10,
    /// 16-bit unsigned integer
    U16 = 11,
    /// 8-bit unsigned integer
    U8 = 12,
    /// 32-bit signed integer
    I32 = 13,
}

/// Elements per shared-exponent block in the block-compressed formats
pub const BFP_BLOCK_ELEMS: usize = 16;

impl DType {
    /// Size of one element in bytes
    ///
    /// # Panics
    ///
    /// Panics for block-compressed formats, which have no per-element size;
    /// use [`DType::buffer_bytes`] instead.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::U32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::U16 => 2,
            Self::U8 => 1,
            Self::Bfp8 | Self::Bfp4 => {
                panic!("block-compressed dtypes have no per-element size")
            }
        }
    }

    /// Bytes required to store `elems` elements of this dtype
    ///
    /// For block formats the element count is rounded up to a whole number of
    /// 16-element blocks; each block carries one exponent byte plus its
    /// mantissa bytes.
    #[inline]
    pub const fn buffer_bytes(self, elems: usize) -> usize {
        match self {
            Self::Bfp8 | Self::Bfp4 => {
                let blocks = (elems + BFP_BLOCK_ELEMS - 1) / BFP_BLOCK_ELEMS;
                blocks * self.block_bytes()
            }
            _ => elems * self.size_in_bytes(),
        }
    }

    /// Bytes per 16-element block for block formats
    ///
    /// Returns 0 for scalar dtypes.
    #[inline]
    pub const fn block_bytes(self) -> usize {
        match self {
            Self::Bfp8 => 1 + BFP_BLOCK_ELEMS,
            Self::Bfp4 => 1 + BFP_BLOCK_ELEMS / 2,
            _ => 0,
        }
    }

    /// Returns true if this is a floating point type (including block formats)
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::F32 | Self::F16 | Self::BF16 | Self::Bfp8 | Self::Bfp4
        )
    }

    /// Returns true if this is a block-compressed float format
    #[inline]
    pub const fn is_block_float(self) -> bool {
        matches!(self, Self::Bfp8 | Self::Bfp4)
    }

    /// Returns true if this is an integer type
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, Self::U32 | Self::U16 | Self::U8 | Self::I32)
    }

    /// Short name for display (e.g., "bf16", "bfp8")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::Bfp8 => "bfp8",
            Self::Bfp4 => "bfp4",
            Self::U32 => "u32",
            Self::U16 => "u16",
            Self::U8 => "u8",
            Self::I32 => "i32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Unpack a packed device buffer into an f64 workspace
///
/// The workspace is the common domain the emulated kernels compute in: every
/// supported scalar type is exactly representable in f64, so the unpack/pack
/// round trip is lossless for non-block dtypes. Conversion goes through
/// little-endian byte reads, so source buffers need no particular alignment.
pub fn unpack_to_f64(bytes: &[u8], dtype: DType, elems: usize) -> Vec<f64> {
    fn from_le<const N: usize>(bytes: &[u8], elems: usize, f: impl Fn([u8; N]) -> f64) -> Vec<f64> {
        bytes
            .chunks_exact(N)
            .take(elems)
            .map(|c| f(c.try_into().unwrap()))
            .collect()
    }

    match dtype {
        DType::F32 => from_le::<4>(bytes, elems, |c| f32::from_le_bytes(c) as f64),
        DType::F16 => from_le::<2>(bytes, elems, |c| {
            half::f16::from_le_bytes(c).to_f64()
        }),
        DType::BF16 => from_le::<2>(bytes, elems, |c| {
            half::bf16::from_le_bytes(c).to_f64()
        }),
        DType::U32 => from_le::<4>(bytes, elems, |c| u32::from_le_bytes(c) as f64),
        DType::U16 => from_le::<2>(bytes, elems, |c| u16::from_le_bytes(c) as f64),
        DType::U8 => bytes[..elems].iter().map(|&v| v as f64).collect(),
        DType::I32 => from_le::<4>(bytes, elems, |c| i32::from_le_bytes(c) as f64),
        DType::Bfp8 => bfp::unpack_blocks(bytes, bfp::BfpFormat::Bfp8, elems)
            .into_iter()
            .map(|v| v as f64)
            .collect(),
        DType::Bfp4 => bfp::unpack_blocks(bytes, bfp::BfpFormat::Bfp4, elems)
            .into_iter()
            .map(|v| v as f64)
            .collect(),
    }
}

/// Pack an f64 workspace back into a device buffer of the given dtype
///
/// Floats round to the target precision; integers round half-away-from-zero
/// and saturate at the type's bounds.
pub fn pack_from_f64(values: &[f64], dtype: DType) -> Vec<u8> {
    fn to_le<const N: usize>(values: &[f64], f: impl Fn(f64) -> [u8; N]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * N);
        for &v in values {
            out.extend_from_slice(&f(v));
        }
        out
    }

    match dtype {
        DType::F32 => to_le::<4>(values, |x| (x as f32).to_le_bytes()),
        DType::F16 => to_le::<2>(values, |x| half::f16::from_f64(x).to_le_bytes()),
        DType::BF16 => to_le::<2>(values, |x| half::bf16::from_f64(x).to_le_bytes()),
        DType::U32 => to_le::<4>(values, |x| {
            (x.round().clamp(0.0, u32::MAX as f64) as u32).to_le_bytes()
        }),
        DType::U16 => to_le::<2>(values, |x| {
            (x.round().clamp(0.0, u16::MAX as f64) as u16).to_le_bytes()
        }),
        DType::U8 => values
            .iter()
            .map(|&x| x.round().clamp(0.0, u8::MAX as f64) as u8)
            .collect(),
        DType::I32 => to_le::<4>(values, |x| {
            (x.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32).to_le_bytes()
        }),
        DType::Bfp8 => {
            let v: Vec<f32> = values.iter().map(|&x| x as f32).collect();
            bfp::pack_blocks(&v, bfp::BfpFormat::Bfp8)
        }
        DType::Bfp4 => {
            let v: Vec<f32> = values.iter().map(|&x| x as f32).collect();
            bfp::pack_blocks(&v, bfp::BfpFormat::Bfp4)
        }
    }
}

/// Element count a buffer of `bytes_len` bytes holds for a dtype
///
/// For block formats this counts every slot in every block, including pad
/// slots of a trailing partial block.
pub fn buffer_elems(bytes_len: usize, dtype: DType) -> usize {
    if dtype.is_block_float() {
        (bytes_len / dtype.block_bytes()) * BFP_BLOCK_ELEMS
    } else {
        bytes_len / dtype.size_in_bytes()
    }
}
