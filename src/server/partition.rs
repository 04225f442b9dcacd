use std::fmt;

use hashbrown::HashMap;

/// A clock counts committed update rounds for one task on one partition.
pub type Clock = i32;

/// Addresses one partition of one matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub matrix_id: i32,
    pub partition_id: i32,
}

impl PartitionKey {
    pub fn new(matrix_id: i32, partition_id: i32) -> Self {
        Self {
            matrix_id,
            partition_id,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.matrix_id, self.partition_id)
    }
}

/// One row of a partition as handed out by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub row_index: i32,
    pub values: Vec<f64>,
}

/// A point-in-time copy of a whole partition. Rows cover
/// `start_row..end_row`; rows the store never materialized are left out.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionSnapshot {
    pub key: PartitionKey,
    pub start_row: i32,
    pub end_row: i32,
    pub rows: Vec<Row>,
}

impl PartitionSnapshot {
    pub fn row(&self, row_index: i32) -> Option<&Row> {
        self.rows.iter().find(|row| row.row_index == row_index)
    }
}

/// Clock of every task on every partition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClockTable {
    clocks: HashMap<PartitionKey, Vec<Clock>>,
}

impl ClockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PartitionKey, task_clocks: Vec<Clock>) {
        self.clocks.insert(key, task_clocks);
    }

    /// The clock reported by `task_index` for `key`.
    pub fn clock(&self, key: PartitionKey, task_index: u32) -> Option<Clock> {
        self.clocks
            .get(&key)
            .and_then(|clocks| clocks.get(task_index as usize))
            .copied()
    }

    /// The slowest task's clock, i.e. the newest clock a reader may ask for.
    pub fn ready_clock(&self, key: PartitionKey) -> Option<Clock> {
        self.clocks
            .get(&key)
            .and_then(|clocks| clocks.iter().min())
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionKey, &Vec<Clock>)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    UnknownPartition(PartitionKey),
    UnknownTask {
        key: PartitionKey,
        task_index: u32,
    },
    RowOutOfRange {
        key: PartitionKey,
        row_index: i32,
    },
    ShapeMismatch {
        key: PartitionKey,
        row_index: i32,
        expected: usize,
        got: usize,
    },
    DuplicateRow {
        key: PartitionKey,
        row_index: i32,
    },
    MalformedPayload(String),
    InvalidLayout(String),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPartition(key) => write!(f, "unknown partition {key}"),
            Self::UnknownTask { key, task_index } => {
                write!(f, "partition {key} has no task {task_index}")
            }
            Self::RowOutOfRange { key, row_index } => {
                write!(f, "row {row_index} is not in partition {key}")
            }
            Self::ShapeMismatch {
                key,
                row_index,
                expected,
                got,
            } => write!(
                f,
                "row {row_index} of partition {key} has {expected} columns, got {got}"
            ),
            Self::DuplicateRow { key, row_index } => {
                write!(f, "row {row_index} of partition {key} was written twice")
            }
            Self::MalformedPayload(reason) => {
                write!(f, "malformed update payload: {reason}")
            }
            Self::InvalidLayout(reason) => write!(f, "invalid layout: {reason}"),
            Self::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The partition storage engine the server answers from.
///
/// Every call is atomic with respect to the others. Implementations are
/// shared across the receive tasks and the worker pool, and are called from
/// blocking context, so they may take locks but must not await.
pub trait PartitionStore: Send + Sync {
    /// True once every task contributing to `key` has reached `clock`.
    fn partition_ready(
        &self,
        key: PartitionKey,
        clock: Clock,
    ) -> Result<bool, StoreError>;

    fn get_row(
        &self,
        matrix_id: i32,
        row_index: i32,
        partition_id: i32,
    ) -> Result<Option<Row>, StoreError>;

    fn get_partition(
        &self,
        matrix_id: i32,
        partition_id: i32,
    ) -> Result<PartitionSnapshot, StoreError>;

    /// Applies an encoded update. Either the whole payload lands or none of
    /// it does.
    fn update(&self, key: PartitionKey, payload: &[u8]) -> Result<(), StoreError>;

    /// Records that `task_index` finished round `clock` on `key`. Clocks
    /// never move backwards.
    fn clock(
        &self,
        key: PartitionKey,
        task_index: u32,
        clock: Clock,
    ) -> Result<(), StoreError>;

    fn clocks(&self) -> Result<ClockTable, StoreError>;

    /// Runs `f` with exclusive access to the partition's rows. Used by
    /// update functions. If `f` leaves a row the partition cannot hold, the
    /// call fails and no row changes.
    fn modify(
        &self,
        key: PartitionKey,
        f: &mut dyn FnMut(&mut PartitionSnapshot),
    ) -> Result<(), StoreError>;
}
