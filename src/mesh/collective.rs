//! Collective operations over mesh-distributed tensors
//!
//! Collectives run on tensors already distributed across the mesh. The
//! emulation is host-mediated: participating devices synchronize, shard data
//! moves through their queues, and per-device results are written back
//! through their queues.
//!
//! Reductions accumulate in ring order — device `d` folds contributions
//! starting from its ring successor — with partials rounded to the tensor
//! dtype at every step for reduced-precision formats. Results are therefore
//! numerically equivalent to reducing the concatenated tensor but not
//! bit-identical to a sequential accumulation; float comparisons belong in
//! tolerance/PCC checks, not exact equality.

use super::distribute::split_values;
use super::MeshTensor;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::ReduceOp;
use crate::tensor::Tensor;

/// Gather every device's shard onto every device, concatenated along `dim`
///
/// Pure data movement: no arithmetic, results are exact.
pub fn all_gather(input: &MeshTensor, dim: isize) -> Result<MeshTensor> {
    sync_all(input)?;
    let hosts = read_back(input)?;
    let gathered = super::distribute::concat_hosts(&hosts, dim)?;

    let shards = input
        .device_tensors()
        .iter()
        .map(|shard| {
            let memory = shard
                .memory_config()
                .cloned()
                .ok_or_else(|| Error::invalid_argument("tensor", "shard missing memory config"))?;
            gathered.to_device(shard.device()?, memory)
        })
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

/// Reduce across devices, scattering one result chunk to each device
///
/// Each device's input is chunked along `dim` into one piece per device;
/// device `d` receives the reduction of every device's chunk `d`.
pub fn reduce_scatter(input: &MeshTensor, dim: isize, op: ReduceOp) -> Result<MeshTensor> {
    sync_all(input)?;
    let num_devices = input.num_shards();
    if num_devices < 2 {
        return Err(Error::invalid_argument(
            "mesh",
            "reduce_scatter needs at least 2 devices",
        ));
    }
    let hosts = read_back(input)?;
    let dtype = hosts[0].dtype();

    // per input tensor: its chunks along the scatter dim
    let mut chunks: Vec<Vec<(Vec<f64>, Vec<usize>)>> = Vec::with_capacity(num_devices);
    for host in &hosts {
        chunks.push(split_values(host, dim, num_devices)?);
    }

    let shards = input
        .device_tensors()
        .iter()
        .enumerate()
        .map(|(d, shard)| {
            let (_, chunk_shape) = &chunks[0][d];
            let len = chunks[0][d].0.len();
            let mut acc = vec![0.0f64; len];
            let mut first = true;
            // ring order: start at the successor, end at self
            for step in 1..=num_devices {
                let src = (d + step) % num_devices;
                let part = &chunks[src][d].0;
                fold(&mut acc, part, op, dtype, first);
                first = false;
            }
            finalize(&mut acc, op, num_devices);
            let memory = shard
                .memory_config()
                .cloned()
                .ok_or_else(|| Error::invalid_argument("tensor", "shard missing memory config"))?;
            Tensor::from_f64_values(acc, chunk_shape, dtype)?.to_device(shard.device()?, memory)
        })
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

/// Reduce across devices, leaving the full result on every device
pub fn all_reduce(input: &MeshTensor, op: ReduceOp) -> Result<MeshTensor> {
    sync_all(input)?;
    let num_devices = input.num_shards();
    let hosts = read_back(input)?;
    let dtype = hosts[0].dtype();
    let shape = hosts[0].shape().to_vec();
    let values: Vec<Vec<f64>> = hosts
        .iter()
        .map(|h| h.values_f64())
        .collect::<Result<Vec<_>>>()?;

    let shards = input
        .device_tensors()
        .iter()
        .enumerate()
        .map(|(d, shard)| {
            let mut acc = vec![0.0f64; values[0].len()];
            let mut first = true;
            for step in 1..=num_devices {
                let src = (d + step) % num_devices;
                fold(&mut acc, &values[src], op, dtype, first);
                first = false;
            }
            finalize(&mut acc, op, num_devices);
            let memory = shard
                .memory_config()
                .cloned()
                .ok_or_else(|| Error::invalid_argument("tensor", "shard missing memory config"))?;
            Tensor::from_f64_values(acc, &shape, dtype)?.to_device(shard.device()?, memory)
        })
        .collect::<Result<Vec<_>>>()?;
    MeshTensor::aggregate(shards)
}

fn sync_all(input: &MeshTensor) -> Result<()> {
    for shard in input.device_tensors() {
        shard.device()?.synchronize()?;
    }
    Ok(())
}

fn read_back(input: &MeshTensor) -> Result<Vec<Tensor>> {
    input.device_tensors().iter().map(|t| t.to_host()).collect()
}

/// Fold one contribution into the accumulator with dtype-step rounding
fn fold(acc: &mut [f64], part: &[f64], op: ReduceOp, dtype: DType, first: bool) {
    let round = |v: f64| -> f64 {
        match dtype {
            DType::BF16 | DType::Bfp8 | DType::Bfp4 => half::bf16::from_f64(v).to_f64(),
            DType::F16 => half::f16::from_f64(v).to_f64(),
            DType::F32 => v as f32 as f64,
            _ => v,
        }
    };
    for (a, &p) in acc.iter_mut().zip(part.iter()) {
        *a = match op {
            ReduceOp::Max => {
                if first {
                    p
                } else {
                    a.max(p)
                }
            }
            _ => {
                if first {
                    p
                } else {
                    round(*a + p)
                }
            }
        };
    }
}

fn finalize(acc: &mut [f64], op: ReduceOp, num_devices: usize) {
    if op == ReduceOp::Mean {
        for a in acc.iter_mut() {
            *a /= num_devices as f64;
        }
    }
}
