use std::{io::Cursor, sync::Arc};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::partition::{
    Clock, ClockTable, PartitionKey, PartitionSnapshot, PartitionStore, Row,
    StoreError,
};

/// A partition store that keeps dense `f64` rows in memory.
///
/// Update payloads are a sequence of row deltas, each encoded as
/// `row_index: i32 | n: i32 | n * f64` (big-endian), added element-wise into
/// the row. Rows spring into existence, zero-filled, on their first update.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition>>>,
}

struct Partition {
    key: PartitionKey,
    start_row: i32,
    end_row: i32,
    cols: usize,
    rows: RwLock<HashMap<i32, Vec<f64>>>,
    clocks: Mutex<Vec<Clock>>,
}

impl Partition {
    fn check_row(&self, row_index: i32, len: usize) -> Result<(), StoreError> {
        if row_index < self.start_row || row_index >= self.end_row {
            return Err(StoreError::RowOutOfRange {
                key: self.key,
                row_index,
            });
        }
        if len != self.cols {
            return Err(StoreError::ShapeMismatch {
                key: self.key,
                row_index,
                expected: self.cols,
                got: len,
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> PartitionSnapshot {
        let rows = self.rows.read();
        let mut rows: Vec<Row> = rows
            .iter()
            .map(|(row_index, values)| Row {
                row_index: *row_index,
                values: values.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.row_index);
        PartitionSnapshot {
            key: self.key,
            start_row: self.start_row,
            end_row: self.end_row,
            rows,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition covering `start_row..end_row` with `cols`
    /// columns, written to by `tasks` tasks whose clocks all start at zero.
    /// Registering an existing key replaces it.
    pub fn add_partition(
        &self,
        key: PartitionKey,
        start_row: i32,
        end_row: i32,
        cols: usize,
        tasks: usize,
    ) {
        debug!(%key, start_row, end_row, cols, tasks, "adding partition");
        let partition = Partition {
            key,
            start_row,
            end_row,
            cols,
            rows: RwLock::new(HashMap::new()),
            clocks: Mutex::new(vec![0; tasks]),
        };
        self.partitions.write().insert(key, Arc::new(partition));
    }

    /// Registers `partitions` consecutive partitions of `rows_per_partition`
    /// rows each for one matrix. Nothing is registered if the row range of
    /// the matrix does not fit in an `i32`.
    pub fn add_matrix(
        &self,
        matrix_id: i32,
        partitions: i32,
        rows_per_partition: i32,
        cols: usize,
        tasks: usize,
    ) -> Result<(), StoreError> {
        if partitions < 0
            || rows_per_partition < 0
            || partitions.checked_mul(rows_per_partition).is_none()
        {
            return Err(StoreError::InvalidLayout(format!(
                "{partitions} partitions of {rows_per_partition} rows do not fit matrix {matrix_id}"
            )));
        }
        for partition_id in 0..partitions {
            let start_row = partition_id * rows_per_partition;
            self.add_partition(
                PartitionKey::new(matrix_id, partition_id),
                start_row,
                start_row + rows_per_partition,
                cols,
                tasks,
            );
        }
        Ok(())
    }

    /// Overwrites one row.
    pub fn put_row(
        &self,
        key: PartitionKey,
        row_index: i32,
        values: Vec<f64>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        partition.check_row(row_index, values.len())?;
        partition.rows.write().insert(row_index, values);
        Ok(())
    }

    fn partition(&self, key: PartitionKey) -> Result<Arc<Partition>, StoreError> {
        self.partitions
            .read()
            .get(&key)
            .cloned()
            .ok_or(StoreError::UnknownPartition(key))
    }
}

impl PartitionStore for MemoryStore {
    fn partition_ready(
        &self,
        key: PartitionKey,
        clock: Clock,
    ) -> Result<bool, StoreError> {
        let partition = self.partition(key)?;
        let clocks = partition.clocks.lock();
        // a partition nobody writes to is always current
        Ok(clocks.iter().min().map_or(true, |ready| *ready >= clock))
    }

    fn get_row(
        &self,
        matrix_id: i32,
        row_index: i32,
        partition_id: i32,
    ) -> Result<Option<Row>, StoreError> {
        let partition = self.partition(PartitionKey::new(matrix_id, partition_id))?;
        let rows = partition.rows.read();
        Ok(rows.get(&row_index).map(|values| Row {
            row_index,
            values: values.clone(),
        }))
    }

    fn get_partition(
        &self,
        matrix_id: i32,
        partition_id: i32,
    ) -> Result<PartitionSnapshot, StoreError> {
        let partition = self.partition(PartitionKey::new(matrix_id, partition_id))?;
        Ok(partition.snapshot())
    }

    fn update(&self, key: PartitionKey, payload: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        let deltas = decode_row_deltas(payload)?;
        for (row_index, delta) in &deltas {
            partition.check_row(*row_index, delta.len())?;
        }

        let mut rows = partition.rows.write();
        for (row_index, delta) in deltas {
            let row = rows
                .entry(row_index)
                .or_insert_with(|| vec![0.0; partition.cols]);
            for (value, change) in row.iter_mut().zip(delta) {
                *value += change;
            }
        }
        Ok(())
    }

    fn clock(
        &self,
        key: PartitionKey,
        task_index: u32,
        clock: Clock,
    ) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        let mut clocks = partition.clocks.lock();
        let slot = clocks
            .get_mut(task_index as usize)
            .ok_or(StoreError::UnknownTask { key, task_index })?;
        if clock < *slot {
            debug!(%key, task_index, current = *slot, clock, "ignoring stale clock");
        } else {
            *slot = clock;
        }
        Ok(())
    }

    fn clocks(&self) -> Result<ClockTable, StoreError> {
        let partitions = self.partitions.read();
        let mut table = ClockTable::new();
        for (key, partition) in partitions.iter() {
            table.insert(*key, partition.clocks.lock().clone());
        }
        Ok(table)
    }

    fn modify(
        &self,
        key: PartitionKey,
        f: &mut dyn FnMut(&mut PartitionSnapshot),
    ) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        let mut rows = partition.rows.write();

        // work on a copy so a function that bails out or panics leaves the
        // rows alone
        let mut snapshot = PartitionSnapshot {
            key,
            start_row: partition.start_row,
            end_row: partition.end_row,
            rows: rows
                .iter()
                .map(|(row_index, values)| Row {
                    row_index: *row_index,
                    values: values.clone(),
                })
                .collect(),
        };
        f(&mut snapshot);

        let mut modified = HashMap::with_capacity(snapshot.rows.len());
        for row in snapshot.rows {
            partition.check_row(row.row_index, row.values.len())?;
            if modified.insert(row.row_index, row.values).is_some() {
                return Err(StoreError::DuplicateRow {
                    key,
                    row_index: row.row_index,
                });
            }
        }
        *rows = modified;
        Ok(())
    }
}

/// Encodes row deltas in the layout [`MemoryStore`] applies.
pub fn encode_row_deltas<V: AsRef<[f64]>>(deltas: &[(i32, V)]) -> Vec<u8> {
    let len: usize = deltas
        .iter()
        .map(|(_, values)| 8 + values.as_ref().len() * 8)
        .sum();
    let mut buf = Vec::with_capacity(len);
    for (row_index, values) in deltas {
        let values = values.as_ref();
        // writes into a Vec cannot fail
        let _ = buf.write_i32::<BigEndian>(*row_index);
        let _ = buf.write_i32::<BigEndian>(values.len() as i32);
        for value in values {
            let _ = buf.write_f64::<BigEndian>(*value);
        }
    }
    buf
}

fn decode_row_deltas(payload: &[u8]) -> Result<Vec<(i32, Vec<f64>)>, StoreError> {
    let truncated = |_| StoreError::MalformedPayload("truncated row delta".into());
    let mut cursor = Cursor::new(payload);
    let mut deltas = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        let row_index = cursor.read_i32::<BigEndian>().map_err(truncated)?;
        let n = cursor.read_i32::<BigEndian>().map_err(truncated)?;
        let n = usize::try_from(n).map_err(|_| {
            StoreError::MalformedPayload(format!("negative length {n} for row {row_index}"))
        })?;
        let remaining = payload.len() - cursor.position() as usize;
        if n > remaining / 8 {
            return Err(StoreError::MalformedPayload(format!(
                "row {row_index} claims {n} values but only {remaining} bytes remain"
            )));
        }
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(cursor.read_f64::<BigEndian>().map_err(truncated)?);
        }
        deltas.push((row_index, values));
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MemoryStore, PartitionKey) {
        let store = MemoryStore::new();
        let key = PartitionKey::new(1, 0);
        store.add_partition(key, 0, 10, 3, 2);
        (store, key)
    }

    #[test]
    fn readiness_follows_the_slowest_task() {
        let (store, key) = store();
        assert!(store.partition_ready(key, 0).unwrap());
        assert!(!store.partition_ready(key, 1).unwrap());

        store.clock(key, 0, 3).unwrap();
        assert!(!store.partition_ready(key, 1).unwrap());
        store.clock(key, 1, 1).unwrap();
        assert!(store.partition_ready(key, 1).unwrap());
        assert!(!store.partition_ready(key, 2).unwrap());
    }

    #[test]
    fn clocks_never_move_backwards() {
        let (store, key) = store();
        store.clock(key, 0, 5).unwrap();
        store.clock(key, 0, 2).unwrap();
        assert_eq!(store.clocks().unwrap().clock(key, 0), Some(5));
        assert_eq!(
            store.clock(key, 7, 1),
            Err(StoreError::UnknownTask { key, task_index: 7 })
        );
    }

    #[test]
    fn update_adds_deltas_and_materializes_rows() {
        let (store, key) = store();
        assert_eq!(store.get_row(1, 4, 0).unwrap(), None);

        let payload = encode_row_deltas(&[(4, [1.0, 2.0, 3.0]), (4, [0.5, 0.5, 0.5])]);
        store.update(key, &payload).unwrap();

        let row = store.get_row(1, 4, 0).unwrap().unwrap();
        assert_eq!(row.values, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn rejected_update_changes_nothing() {
        let (store, key) = store();
        store.put_row(key, 1, vec![1.0, 1.0, 1.0]).unwrap();

        let payload = encode_row_deltas(&[(1, [1.0, 1.0, 1.0]), (42, [1.0, 1.0, 1.0])]);
        assert_eq!(
            store.update(key, &payload),
            Err(StoreError::RowOutOfRange { key, row_index: 42 })
        );
        assert_eq!(store.get_row(1, 1, 0).unwrap().unwrap().values, vec![1.0; 3]);

        let truncated = &encode_row_deltas(&[(1, [1.0, 1.0, 1.0])])[..12];
        assert!(matches!(
            store.update(key, truncated),
            Err(StoreError::MalformedPayload(_))
        ));
    }

    #[test]
    fn unknown_partitions_are_errors() {
        let store = MemoryStore::new();
        let key = PartitionKey::new(9, 9);
        assert_eq!(
            store.partition_ready(key, 0),
            Err(StoreError::UnknownPartition(key))
        );
        assert!(store.get_partition(9, 9).is_err());
    }

    #[test]
    fn snapshot_lists_rows_in_order() {
        let (store, key) = store();
        store.put_row(key, 7, vec![7.0; 3]).unwrap();
        store.put_row(key, 2, vec![2.0; 3]).unwrap();

        let snapshot = store.get_partition(1, 0).unwrap();
        let indexes: Vec<i32> = snapshot.rows.iter().map(|r| r.row_index).collect();
        assert_eq!(indexes, vec![2, 7]);
        assert_eq!((snapshot.start_row, snapshot.end_row), (0, 10));
    }

    #[test]
    fn modify_writes_back_rows() {
        let (store, key) = store();
        store.put_row(key, 3, vec![1.0, 2.0, 3.0]).unwrap();
        store
            .modify(key, &mut |partition| {
                for row in &mut partition.rows {
                    row.values.iter_mut().for_each(|v| *v *= 2.0);
                }
            })
            .unwrap();
        assert_eq!(store.get_row(1, 3, 0).unwrap().unwrap().values, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn invalid_rows_from_modify_change_nothing() {
        let (store, key) = store();
        store.put_row(key, 3, vec![1.0, 2.0, 3.0]).unwrap();
        store.put_row(key, 4, vec![4.0; 3]).unwrap();

        let result = store.modify(key, &mut |partition| {
            for row in &mut partition.rows {
                row.values.iter_mut().for_each(|v| *v = 0.0);
                if row.row_index == 3 {
                    row.values.push(9.0);
                }
            }
        });
        assert_eq!(
            result,
            Err(StoreError::ShapeMismatch {
                key,
                row_index: 3,
                expected: 3,
                got: 4
            })
        );
        assert_eq!(store.get_row(1, 3, 0).unwrap().unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(store.get_row(1, 4, 0).unwrap().unwrap().values, vec![4.0; 3]);

        let result = store.modify(key, &mut |partition| {
            partition.rows.push(Row {
                row_index: 4,
                values: vec![0.0; 3],
            });
        });
        assert_eq!(result, Err(StoreError::DuplicateRow { key, row_index: 4 }));
        assert_eq!(store.get_row(1, 4, 0).unwrap().unwrap().values, vec![4.0; 3]);
    }

    #[test]
    fn add_matrix_lays_out_consecutive_partitions() {
        let store = MemoryStore::new();
        store.add_matrix(2, 3, 5, 1, 1).unwrap();
        let snapshot = store.get_partition(2, 2).unwrap();
        assert_eq!((snapshot.start_row, snapshot.end_row), (10, 15));
        assert_eq!(store.clocks().unwrap().len(), 3);
    }

    #[test]
    fn add_matrix_rejects_row_ranges_past_i32() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_matrix(1, 100_000, 100_000, 1, 1),
            Err(StoreError::InvalidLayout(_))
        ));
        assert!(store.clocks().unwrap().is_empty());
        assert!(store.add_matrix(1, 2, -5, 1, 1).is_err());
    }
}
