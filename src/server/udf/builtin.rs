//! Row aggregates and row updates every server ships with.
//!
//! Every parameter blob starts with the big-endian `row_index: i32` the
//! function works on; updates follow it with one big-endian `f64`.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use super::{FuncError, FunctionRegistry, GetFunc, PartitionParam, UpdateFunc};
use crate::server::partition::{PartitionStore, Row};

pub const SUM: &str = "aggr.Sum";
pub const MAX: &str = "aggr.Max";
pub const NNZ: &str = "aggr.Nnz";
pub const FILL: &str = "update.Fill";
pub const SCALE: &str = "update.Scale";

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register_get::<Sum>(SUM);
    registry.register_get::<Max>(MAX);
    registry.register_get::<Nnz>(NNZ);
    registry.register_update::<Fill>(FILL);
    registry.register_update::<Scale>(SCALE);
}

/// Encodes the parameter blob of an aggregate.
pub fn row_param(row_index: i32) -> Vec<u8> {
    row_index.to_be_bytes().to_vec()
}

/// Encodes the parameter blob of an update.
pub fn row_value_param(row_index: i32, value: f64) -> Vec<u8> {
    let mut buf = row_param(row_index);
    buf.extend_from_slice(&value.to_be_bytes());
    buf
}

fn read_row_index(cursor: &mut Cursor<&[u8]>) -> Result<i32, FuncError> {
    cursor
        .read_i32::<BigEndian>()
        .map_err(|_| FuncError::InvalidParam("expected a row index".into()))
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<f64, FuncError> {
    cursor
        .read_f64::<BigEndian>()
        .map_err(|_| FuncError::InvalidParam("expected an f64 after the row index".into()))
}

fn fetch_row(
    store: &dyn PartitionStore,
    param: &PartitionParam,
) -> Result<Option<Row>, FuncError> {
    let row_index = read_row_index(&mut Cursor::new(param.bytes.as_slice()))?;
    Ok(store.get_row(param.key.matrix_id, row_index, param.key.partition_id)?)
}

/// Applies `f` to every value of the row named in `param`.
fn map_row(
    store: &dyn PartitionStore,
    param: &PartitionParam,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), FuncError> {
    let mut cursor = Cursor::new(param.bytes.as_slice());
    let row_index = read_row_index(&mut cursor)?;
    let operand = read_value(&mut cursor)?;

    let mut found = false;
    store.modify(param.key, &mut |partition| {
        if let Some(row) = partition
            .rows
            .iter_mut()
            .find(|row| row.row_index == row_index)
        {
            row.values.iter_mut().for_each(|v| *v = f(*v, operand));
            found = true;
        }
    })?;
    if !found {
        return Err(FuncError::Failed(format!(
            "row {row_index} is not materialized in partition {}",
            param.key
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct Sum;

impl GetFunc for Sum {
    fn partition_get(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<Vec<u8>, FuncError> {
        let sum: f64 = fetch_row(store, param)?.map_or(0.0, |row| row.values.iter().sum());
        Ok(sum.to_be_bytes().to_vec())
    }
}

#[derive(Default)]
pub struct Max;

impl GetFunc for Max {
    fn partition_get(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<Vec<u8>, FuncError> {
        let max = fetch_row(store, param)?.map_or(f64::NEG_INFINITY, |row| {
            row.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        });
        Ok(max.to_be_bytes().to_vec())
    }
}

#[derive(Default)]
pub struct Nnz;

impl GetFunc for Nnz {
    fn partition_get(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<Vec<u8>, FuncError> {
        let nnz = fetch_row(store, param)?
            .map_or(0, |row| row.values.iter().filter(|v| **v != 0.0).count());
        Ok((nnz as i64).to_be_bytes().to_vec())
    }
}

#[derive(Default)]
pub struct Fill;

impl UpdateFunc for Fill {
    fn partition_update(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<(), FuncError> {
        map_row(store, param, |_, value| value)
    }
}

#[derive(Default)]
pub struct Scale;

impl UpdateFunc for Scale {
    fn partition_update(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<(), FuncError> {
        map_row(store, param, |v, factor| v * factor)
    }
}
