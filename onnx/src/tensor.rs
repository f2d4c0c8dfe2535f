//! Conversions between host tensors (ndarray) and TensorProto payloads.
//!
//! Payloads are written to `raw_data` in fixed-width little-endian order.
//! Readers also accept the typed repeated fields (`float_data`, ...) since
//! other producers use them.

use crate::internal::*;
use crate::pb::tensor_proto::DataType;
use crate::pb::*;

use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use ndarray::{ArrayD, Dimension};

/// Size in bytes of one element of the given type.
pub fn size_of(dt: DataType) -> XfeatResult<usize> {
    match dt {
        DataType::Float | DataType::Int32 | DataType::Uint32 => Ok(4),
        DataType::Double | DataType::Int64 | DataType::Uint64 => Ok(8),
        DataType::Float16 | DataType::Bfloat16 | DataType::Int16 | DataType::Uint16 => Ok(2),
        DataType::Int8 | DataType::Uint8 | DataType::Bool => Ok(1),
        _ => bail!("no fixed element size for {}", dt.as_str_name()),
    }
}

/// Number of elements implied by a dims list. Empty dims is a scalar.
pub fn elem_count(dims: &[i64]) -> i64 {
    dims.iter().product()
}

fn proto(name: &str, dt: DataType, dims: Vec<i64>, raw_data: Vec<u8>) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        data_type: dt as i32,
        dims,
        raw_data,
        ..TensorProto::default()
    }
}

pub fn from_f32<D: Dimension>(name: &str, array: &ndarray::Array<f32, D>) -> TensorProto {
    let dims = array.shape().iter().map(|d| *d as i64).collect();
    // iteration is in logical order, yielding C-order bytes for any layout
    let data: Vec<f32> = array.iter().copied().collect();
    let mut raw = vec![0u8; data.len() * 4];
    LittleEndian::write_f32_into(&data, &mut raw);
    proto(name, DataType::Float, dims, raw)
}

pub fn from_i64<D: Dimension>(name: &str, array: &ndarray::Array<i64, D>) -> TensorProto {
    let dims = array.shape().iter().map(|d| *d as i64).collect();
    let data: Vec<i64> = array.iter().copied().collect();
    let mut raw = vec![0u8; data.len() * 8];
    LittleEndian::write_i64_into(&data, &mut raw);
    proto(name, DataType::Int64, dims, raw)
}

pub fn from_i32<D: Dimension>(name: &str, array: &ndarray::Array<i32, D>) -> TensorProto {
    let dims = array.shape().iter().map(|d| *d as i64).collect();
    let data: Vec<i32> = array.iter().copied().collect();
    let mut raw = vec![0u8; data.len() * 4];
    LittleEndian::write_i32_into(&data, &mut raw);
    proto(name, DataType::Int32, dims, raw)
}

/// Rank-0 float tensor.
pub fn scalar_f32(name: &str, f: f32) -> TensorProto {
    proto(name, DataType::Float, vec![], f.to_le_bytes().to_vec())
}

/// Rank-0 int64 tensor.
pub fn scalar_i64(name: &str, i: i64) -> TensorProto {
    proto(name, DataType::Int64, vec![], i.to_le_bytes().to_vec())
}

/// Rank-1 float tensor.
pub fn vec_f32(name: &str, values: &[f32]) -> TensorProto {
    let mut raw = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut raw);
    proto(name, DataType::Float, vec![values.len() as i64], raw)
}

/// Rank-1 int64 tensor. The workhorse for shape/axes/index operands.
pub fn vec_i64(name: &str, values: &[i64]) -> TensorProto {
    let mut raw = vec![0u8; values.len() * 8];
    LittleEndian::write_i64_into(values, &mut raw);
    proto(name, DataType::Int64, vec![values.len() as i64], raw)
}

fn shape_of(t: &TensorProto) -> XfeatResult<Vec<usize>> {
    t.dims
        .iter()
        .map(|&d| {
            ensure!(d >= 0, "tensor {:?} has negative dim {}", t.name, d);
            Ok(d as usize)
        })
        .collect()
}

pub fn to_f32(t: &TensorProto) -> XfeatResult<ArrayD<f32>> {
    ensure!(
        t.data_type == DataType::Float as i32,
        "tensor {:?} is not a float tensor (data_type {})",
        t.name,
        t.data_type
    );
    let shape = shape_of(t)?;
    let count = elem_count(&t.dims) as usize;
    let data = if !t.raw_data.is_empty() {
        ensure!(
            t.raw_data.len() == count * 4,
            "tensor {:?}: raw_data holds {} bytes, dims {:?} require {}",
            t.name,
            t.raw_data.len(),
            t.dims,
            count * 4
        );
        let mut data = vec![0f32; count];
        LittleEndian::read_f32_into(&t.raw_data, &mut data);
        data
    } else {
        ensure!(
            t.float_data.len() == count,
            "tensor {:?}: float_data holds {} values, dims {:?} require {}",
            t.name,
            t.float_data.len(),
            t.dims,
            count
        );
        t.float_data.clone()
    };
    Ok(ArrayD::from_shape_vec(shape, data)?)
}

pub fn to_i64(t: &TensorProto) -> XfeatResult<ArrayD<i64>> {
    ensure!(
        t.data_type == DataType::Int64 as i32,
        "tensor {:?} is not an int64 tensor (data_type {})",
        t.name,
        t.data_type
    );
    let shape = shape_of(t)?;
    let count = elem_count(&t.dims) as usize;
    let data = if !t.raw_data.is_empty() {
        ensure!(
            t.raw_data.len() == count * 8,
            "tensor {:?}: raw_data holds {} bytes, dims {:?} require {}",
            t.name,
            t.raw_data.len(),
            t.dims,
            count * 8
        );
        let mut data = vec![0i64; count];
        LittleEndian::read_i64_into(&t.raw_data, &mut data);
        data
    } else {
        ensure!(
            t.int64_data.len() == count,
            "tensor {:?}: int64_data holds {} values, dims {:?} require {}",
            t.name,
            t.int64_data.len(),
            t.dims,
            count
        );
        t.int64_data.clone()
    };
    Ok(ArrayD::from_shape_vec(shape, data)?)
}

/// Re-encode a little-endian f32 payload as f16.
pub fn raw_f32_to_f16(raw: &[u8]) -> XfeatResult<Vec<u8>> {
    ensure!(raw.len() % 4 == 0, "f32 payload length {} is not a multiple of 4", raw.len());
    let mut out = Vec::with_capacity(raw.len() / 2);
    for chunk in raw.chunks_exact(4) {
        let half = f16::from_f32(LittleEndian::read_f32(chunk));
        out.extend_from_slice(&half.to_le_bytes());
    }
    Ok(out)
}
