//! Block-compressed float packing
//!
//! The wire formats `Bfp8` and `Bfp4` store 16 consecutive elements as one
//! block: a single shared 8-bit exponent followed by per-element sign +
//! magnitude mantissas (7 bits for Bfp8, 3 bits for Bfp4). The shared
//! exponent is the largest exponent in the block, so the largest-magnitude
//! element keeps close to full relative precision while small elements in a
//! wide-dynamic-range block lose low bits.
//!
//! Block boundaries follow buffer order. In tiled page layout a 32x32 tile
//! holds exactly 64 blocks, so blocks never straddle a tile.

use super::BFP_BLOCK_ELEMS;

/// Which block-compressed format to pack/unpack
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BfpFormat {
    /// 1 sign + 7 magnitude bits per element, 17 bytes per block
    Bfp8,
    /// 1 sign + 3 magnitude bits per element, 9 bytes per block
    Bfp4,
}

impl BfpFormat {
    /// Magnitude bits per element
    #[inline]
    pub const fn magnitude_bits(self) -> u32 {
        match self {
            Self::Bfp8 => 7,
            Self::Bfp4 => 3,
        }
    }

    /// Bytes per packed block (exponent byte + mantissas)
    #[inline]
    pub const fn block_bytes(self) -> usize {
        match self {
            Self::Bfp8 => 1 + BFP_BLOCK_ELEMS,
            Self::Bfp4 => 1 + BFP_BLOCK_ELEMS / 2,
        }
    }
}

/// Unbiased exponent of a finite f32, or i32::MIN for zero
#[inline]
fn exponent_of(v: f32) -> i32 {
    if v == 0.0 || !v.is_finite() {
        return i32::MIN;
    }
    // raw exponent field; subnormals collapse to the minimum exponent
    let bits = v.to_bits();
    let raw = ((bits >> 23) & 0xff) as i32;
    if raw == 0 {
        -126
    } else {
        raw - 127
    }
}

/// Pack f32 values into shared-exponent blocks
///
/// The element count is padded to a whole number of blocks; pad elements
/// encode as zero.
pub fn pack_blocks(values: &[f32], format: BfpFormat) -> Vec<u8> {
    let mag_bits = format.magnitude_bits();
    let max_mag = (1u32 << mag_bits) - 1;
    let blocks = (values.len() + BFP_BLOCK_ELEMS - 1) / BFP_BLOCK_ELEMS;
    let mut out = Vec::with_capacity(blocks * format.block_bytes());

    for block in 0..blocks {
        let start = block * BFP_BLOCK_ELEMS;
        let end = (start + BFP_BLOCK_ELEMS).min(values.len());
        let chunk = &values[start..end];

        let shared_exp = chunk
            .iter()
            .map(|&v| exponent_of(v))
            .max()
            .unwrap_or(i32::MIN);

        if shared_exp == i32::MIN {
            // all-zero block
            out.push(0u8);
            out.resize(out.len() + format.block_bytes() - 1, 0u8);
            continue;
        }

        // store exponent biased like f32 so the byte range covers the full
        // f32 exponent span
        let exp_byte = (shared_exp + 127).clamp(0, 255) as u8;
        out.push(exp_byte);

        // magnitudes are fixed-point fractions of 2^(shared_exp + 1)
        let scale = (max_mag as f32 + 1.0) / pow2(shared_exp + 1);
        let mut nibbles = [0u8; BFP_BLOCK_ELEMS];
        for (i, slot) in nibbles.iter_mut().enumerate() {
            let v = chunk.get(i).copied().unwrap_or(0.0);
            let sign = if v.is_sign_negative() { 1u8 } else { 0u8 };
            let q = (v.abs() * scale).round().min(max_mag as f32) as u8;
            *slot = (sign << mag_bits) | q;
        }

        match format {
            BfpFormat::Bfp8 => out.extend_from_slice(&nibbles),
            BfpFormat::Bfp4 => {
                for pair in nibbles.chunks_exact(2) {
                    out.push(pair[0] | (pair[1] << 4));
                }
            }
        }
    }

    out
}

/// Unpack shared-exponent blocks into `elems` f32 values
pub fn unpack_blocks(bytes: &[u8], format: BfpFormat, elems: usize) -> Vec<f32> {
    let mag_bits = format.magnitude_bits();
    let max_mag = (1u32 << mag_bits) - 1;
    let block_bytes = format.block_bytes();
    let mut out = Vec::with_capacity(elems);

    for block in bytes.chunks_exact(block_bytes) {
        let shared_exp = block[0] as i32 - 127;
        let scale = pow2(shared_exp + 1) / (max_mag as f32 + 1.0);

        let decode = |field: u8| -> f32 {
            let sign = (field >> mag_bits) & 1;
            let q = (field & max_mag as u8) as f32;
            let mag = q * scale;
            if sign == 1 {
                -mag
            } else {
                mag
            }
        };

        match format {
            BfpFormat::Bfp8 => {
                for &b in &block[1..] {
                    out.push(decode(b));
                }
            }
            BfpFormat::Bfp4 => {
                for &b in &block[1..] {
                    out.push(decode(b & 0x0f));
                    out.push(decode(b >> 4));
                }
            }
        }
        if out.len() >= elems {
            break;
        }
    }

    out.truncate(elems);
    out
}

/// 2^e as f32, covering the full biased range without overflow surprises
#[inline]
fn pow2(e: i32) -> f32 {
    (e as f32).exp2()
}
