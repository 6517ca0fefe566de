//! Tensor distribution across a mesh: shard, replicate, concat

use super::{MeshDevice, MeshTensor};
use crate::error::{Error, Result};
use crate::memory::MemoryConfig;
use crate::tensor::{shape as shape_util, Tensor};

/// Slice a host tensor along one dim into equal per-device shards
///
/// The extent must divide evenly by the device count; distribution never
/// pads silently.
pub fn shard_tensor_to_mesh(
    tensor: &Tensor,
    dim: isize,
    mesh: &MeshDevice,
    memory: MemoryConfig,
) -> Result<MeshTensor> {
    let parts = split_values(tensor, dim, mesh.num_devices())?;
    let shards = parts
        .into_iter()
        .zip(mesh.devices())
        .map(|((values, shape), device)| {
            Tensor::from_f64_values(values, &shape, tensor.dtype())?
                .to_device(device, memory.clone())
        })
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

/// Slice a host tensor along two dims over the 2D cluster shape
///
/// Rows of the cluster take slices of `row_dim`, columns of `col_dim`.
pub fn shard_tensor_to_2d_mesh(
    tensor: &Tensor,
    row_dim: isize,
    col_dim: isize,
    mesh: &MeshDevice,
    memory: MemoryConfig,
) -> Result<MeshTensor> {
    let shape = mesh.shape();
    let row_parts = split_values(tensor, row_dim, shape.rows)?;
    let mut shards = Vec::with_capacity(mesh.num_devices());
    for (values, part_shape) in row_parts {
        let part = Tensor::from_f64_values(values, &part_shape, tensor.dtype())?;
        for (col_values, col_shape) in split_values(&part, col_dim, shape.cols)? {
            shards.push(Tensor::from_f64_values(col_values, &col_shape, tensor.dtype())?);
        }
    }
    let shards = shards
        .into_iter()
        .zip(mesh.devices())
        .map(|(shard, device)| shard.to_device(device, memory.clone()))
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

/// Copy a host tensor identically to every device
pub fn replicate_tensor_to_mesh(
    tensor: &Tensor,
    mesh: &MeshDevice,
    memory: MemoryConfig,
) -> Result<MeshTensor> {
    let shards = mesh
        .devices()
        .iter()
        .map(|device| tensor.to_device(device, memory.clone()))
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

/// Gather per-device shards back into one host tensor along `dim`
///
/// Reverses [`shard_tensor_to_mesh`]: shard order follows mesh order.
pub fn concat_mesh_to_tensor(mesh_tensor: &MeshTensor, dim: isize) -> Result<Tensor> {
    let hosts = mesh_tensor
        .device_tensors()
        .iter()
        .map(|t| t.to_host())
        .collect::<Result<Vec<_>>>()?;
    concat_hosts(&hosts, dim)
}

/// Gather a 2D-distributed mesh tensor, reversing both distribution dims
pub fn concat_2d_mesh_to_tensor(
    mesh_tensor: &MeshTensor,
    row_dim: isize,
    col_dim: isize,
    cluster_rows: usize,
) -> Result<Tensor> {
    let hosts = mesh_tensor
        .device_tensors()
        .iter()
        .map(|t| t.to_host())
        .collect::<Result<Vec<_>>>()?;
    let cols = hosts.len() / cluster_rows;
    let mut rows = Vec::with_capacity(cluster_rows);
    for chunk in hosts.chunks(cols) {
        rows.push(concat_hosts(chunk, col_dim)?);
    }
    concat_hosts(&rows, row_dim)
}

/// Split a host tensor's values along a dim into `parts` equal pieces
pub(crate) fn split_values(
    tensor: &Tensor,
    dim: isize,
    parts: usize,
) -> Result<Vec<(Vec<f64>, Vec<usize>)>> {
    let ndim = tensor.shape().len();
    let d = shape_util::normalize_dim(dim, ndim)?;
    let extent = tensor.shape()[d];
    if parts == 0 || extent % parts != 0 {
        return Err(Error::invalid_argument(
            "dim",
            format!("extent {extent} does not split into {parts} equal shards"),
        ));
    }
    let values = tensor.values_f64()?;
    let piece = extent / parts;
    let inner: usize = tensor.shape()[d + 1..].iter().product();
    let outer: usize = tensor.shape()[..d].iter().product();

    let mut shape = tensor.shape().to_vec();
    shape[d] = piece;

    let mut out = Vec::with_capacity(parts);
    for p in 0..parts {
        let mut part = Vec::with_capacity(outer * piece * inner);
        for o in 0..outer {
            let base = (o * extent + p * piece) * inner;
            part.extend_from_slice(&values[base..base + piece * inner]);
        }
        out.push((part, shape.clone()));
    }
    Ok(out)
}

/// Concatenate host tensors along a dim
pub(crate) fn concat_hosts(hosts: &[Tensor], dim: isize) -> Result<Tensor> {
    let first = hosts
        .first()
        .ok_or_else(|| Error::invalid_argument("tensors", "nothing to concatenate"))?;
    let ndim = first.shape().len();
    let d = shape_util::normalize_dim(dim, ndim)?;

    let mut out_shape = first.shape().to_vec();
    for other in &hosts[1..] {
        if other.shape().len() != ndim
            || other.shape()[..d] != first.shape()[..d]
            || other.shape()[d + 1..] != first.shape()[d + 1..]
        {
            return Err(Error::shape_mismatch(first.shape(), other.shape()));
        }
        if other.dtype() != first.dtype() {
            return Err(Error::DTypeMismatch {
                lhs: first.dtype(),
                rhs: other.dtype(),
            });
        }
        out_shape[d] += other.shape()[d];
    }

    let inner: usize = first.shape()[d + 1..].iter().product();
    let outer: usize = first.shape()[..d].iter().product();
    let parts: Vec<(Vec<f64>, usize)> = hosts
        .iter()
        .map(|t| Ok((t.values_f64()?, t.shape()[d])))
        .collect::<Result<Vec<_>>>()?;

    let mut values = Vec::with_capacity(shape_util::volume(&out_shape));
    for o in 0..outer {
        for (part, extent) in &parts {
            let base = o * extent * inner;
            values.extend_from_slice(&part[base..base + extent * inner]);
        }
    }
    Tensor::from_f64_values(values, &out_shape, first.dtype())
}
