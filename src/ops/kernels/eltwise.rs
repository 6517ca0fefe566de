//! Element-wise kernel emulation

use super::{pack_output, unpack_input};
use crate::dtype::DType;
use crate::error::Result;
use crate::ops::program::{BinaryOp, ProgramBinding, UnaryOp};

pub(crate) fn binary(
    op: BinaryOp,
    dtype: DType,
    elems: usize,
    binding: &ProgramBinding,
) -> Result<()> {
    let a = unpack_input(binding, 0, dtype, elems)?;
    let b = unpack_input(binding, 1, dtype, elems)?;
    let out: Vec<f64> = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
        })
        .collect();
    pack_output(binding, &out, dtype)
}

pub(crate) fn unary(
    op: UnaryOp,
    dtype: DType,
    elems: usize,
    binding: &ProgramBinding,
) -> Result<()> {
    let a = unpack_input(binding, 0, dtype, elems)?;
    let out: Vec<f64> = a
        .iter()
        .map(|&x| match op {
            UnaryOp::Exp => x.exp(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sqrt => x.sqrt(),
        })
        .collect();
    pack_output(binding, &out, dtype)
}
