//! Request and response records as they travel over a connection.
//!
//! Every frame on the transport is a big-endian `u32` length followed by the
//! body. A request body starts with `seq_id: i32 | method_id: i32`; a response
//! body starts with `seq_id: i32 | response_type: i32`. Strings and byte blobs
//! are prefixed with an `i32` length, rows are `row_index: i32 | n: i32 |
//! n * f64`, and partition keys are `matrix_id: i32 | partition_id: i32`.

use std::{fmt, io::Cursor};

use byteorder::{BigEndian, ReadBytesExt};

use super::{
    partition::{Clock, ClockTable, PartitionKey, PartitionSnapshot, Row},
    udf::PartitionParam,
};

/// Size of the transport length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// One row of a partition, gated on the partition's clock
    GetRowSplit = 1,
    /// Several rows of one partition, gated on the partition's clock
    GetRowsSplit = 2,
    /// A whole partition, gated on the partition's clock
    GetPartition = 3,
    /// An update that may also advance the sender's clock
    PutPartitionUpdate = 4,
    /// An update that leaves clocks alone
    PutPartition = 5,
    /// Every clock the server knows about
    GetClocks = 6,
    /// Runs a registered update function against one partition
    Updater = 7,
    /// Runs a registered get function against one partition
    GetUdf = 8,
}

impl Method {
    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::GetRowSplit => "GET_ROWSPLIT",
            Method::GetRowsSplit => "GET_ROWSSPLIT",
            Method::GetPartition => "GET_PART",
            Method::PutPartitionUpdate => "PUT_PARTUPDATE",
            Method::PutPartition => "PUT_PART",
            Method::GetClocks => "GET_CLOCKS",
            Method::Updater => "UPDATER",
            Method::GetUdf => "GET_UDF",
        }
    }
}

impl TryFrom<i32> for Method {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Method::GetRowSplit,
            2 => Method::GetRowsSplit,
            3 => Method::GetPartition,
            4 => Method::PutPartitionUpdate,
            5 => Method::PutPartition,
            6 => Method::GetClocks,
            7 => Method::Updater,
            8 => Method::GetUdf,
            other => return Err(DecodeError::UnknownMethod(other)),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    Success = 0,
    NotReady = 1,
    Fatal = 2,
}

impl TryFrom<i32> for ResponseType {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseType::Success),
            1 => Ok(ResponseType::NotReady),
            2 => Ok(ResponseType::Fatal),
            other => Err(DecodeError::UnknownResponseType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body ended in the middle of the named field.
    Truncated(&'static str),
    NegativeLength { field: &'static str, len: i32 },
    InvalidUtf8(&'static str),
    InvalidValue { field: &'static str, value: i64 },
    UnknownMethod(i32),
    UnknownResponseType(i32),
    TrailingBytes(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(field) => write!(f, "truncated while reading {field}"),
            Self::NegativeLength { field, len } => {
                write!(f, "negative length {len} for {field}")
            }
            Self::InvalidUtf8(field) => write!(f, "{field} is not valid utf-8"),
            Self::InvalidValue { field, value } => {
                write!(f, "invalid value {value} for {field}")
            }
            Self::UnknownMethod(id) => write!(f, "unknown method id {id}"),
            Self::UnknownResponseType(tag) => write!(f, "unknown response type {tag}"),
            Self::TrailingBytes(n) => write!(f, "{n} unexpected trailing bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// The fixed start of every request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq_id: i32,
    pub method_id: i32,
}

impl FrameHeader {
    pub const LEN: usize = 8;

    /// Splits a request body into its header and the method-specific rest.
    pub fn parse(body: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut reader = BodyReader::new(body);
        let seq_id = reader.i32("seq_id")?;
        let method_id = reader.i32("method_id")?;
        Ok((Self { seq_id, method_id }, &body[Self::LEN..]))
    }

    pub fn method(&self) -> Result<Method, DecodeError> {
        Method::try_from(self.method_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    GetRowSplit {
        key: PartitionKey,
        clock: Clock,
        row_index: i32,
    },
    GetRowsSplit {
        key: PartitionKey,
        clock: Clock,
        row_indexes: Vec<i32>,
    },
    GetPartition {
        key: PartitionKey,
        clock: Clock,
    },
    PutPartitionUpdate {
        key: PartitionKey,
        clock: Clock,
        task_index: u32,
        update_clock: bool,
        payload: Vec<u8>,
    },
    PutPartition {
        key: PartitionKey,
        payload: Vec<u8>,
    },
    GetClocks,
    Updater {
        func: String,
        param: PartitionParam,
    },
    GetUdf {
        func: String,
        param: PartitionParam,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::GetRowSplit { .. } => Method::GetRowSplit,
            Request::GetRowsSplit { .. } => Method::GetRowsSplit,
            Request::GetPartition { .. } => Method::GetPartition,
            Request::PutPartitionUpdate { .. } => Method::PutPartitionUpdate,
            Request::PutPartition { .. } => Method::PutPartition,
            Request::GetClocks => Method::GetClocks,
            Request::Updater { .. } => Method::Updater,
            Request::GetUdf { .. } => Method::GetUdf,
        }
    }

    /// Decodes the method-specific part of a request body, i.e. everything
    /// after the [`FrameHeader`].
    pub fn decode(method: Method, body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = BodyReader::new(body);
        let request = match method {
            Method::GetRowSplit => Request::GetRowSplit {
                key: r.key()?,
                clock: r.i32("clock")?,
                row_index: r.i32("row_index")?,
            },
            Method::GetRowsSplit => {
                let key = r.key()?;
                let clock = r.i32("clock")?;
                let n = r.len("row_indexes", 4)?;
                let mut row_indexes = Vec::with_capacity(n);
                for _ in 0..n {
                    row_indexes.push(r.i32("row_indexes")?);
                }
                Request::GetRowsSplit {
                    key,
                    clock,
                    row_indexes,
                }
            }
            Method::GetPartition => Request::GetPartition {
                key: r.key()?,
                clock: r.i32("clock")?,
            },
            Method::PutPartitionUpdate => {
                let clock = r.i32("clock")?;
                let key = r.key()?;
                let task_index = r.i32("task_index")?;
                let task_index = u32::try_from(task_index).map_err(|_| {
                    DecodeError::InvalidValue {
                        field: "task_index",
                        value: task_index.into(),
                    }
                })?;
                let update_clock = r.bool("update_clock")?;
                return Ok(Request::PutPartitionUpdate {
                    key,
                    clock,
                    task_index,
                    update_clock,
                    payload: r.rest(),
                });
            }
            Method::PutPartition => {
                let key = r.key()?;
                return Ok(Request::PutPartition {
                    key,
                    payload: r.rest(),
                });
            }
            Method::GetClocks => Request::GetClocks,
            Method::Updater => {
                let func = r.string("func")?;
                let param = r.param()?;
                Request::Updater { func, param }
            }
            Method::GetUdf => {
                let func = r.string("func")?;
                let param = r.param()?;
                Request::GetUdf { func, param }
            }
        };
        r.finish()?;
        Ok(request)
    }

    /// Encodes a full request body, header included.
    pub fn encode(&self, seq_id: i32) -> Vec<u8> {
        let mut w = BodyWriter::default();
        w.i32(seq_id);
        w.i32(self.method().id());
        match self {
            Request::GetRowSplit {
                key,
                clock,
                row_index,
            } => {
                w.key(*key);
                w.i32(*clock);
                w.i32(*row_index);
            }
            Request::GetRowsSplit {
                key,
                clock,
                row_indexes,
            } => {
                w.key(*key);
                w.i32(*clock);
                w.i32(row_indexes.len() as i32);
                for row_index in row_indexes {
                    w.i32(*row_index);
                }
            }
            Request::GetPartition { key, clock } => {
                w.key(*key);
                w.i32(*clock);
            }
            Request::PutPartitionUpdate {
                key,
                clock,
                task_index,
                update_clock,
                payload,
            } => {
                w.i32(*clock);
                w.key(*key);
                w.i32(*task_index as i32);
                w.0.push(*update_clock as u8);
                w.0.extend_from_slice(payload);
            }
            Request::PutPartition { key, payload } => {
                w.key(*key);
                w.0.extend_from_slice(payload);
            }
            Request::GetClocks => {}
            Request::Updater { func, param } | Request::GetUdf { func, param } => {
                w.bytes(func.as_bytes());
                w.key(param.key);
                w.bytes(&param.bytes);
            }
        }
        w.0
    }

    /// Encodes the request as a transport frame, length prefix included.
    pub fn to_frame(&self, seq_id: i32) -> Vec<u8> {
        frame(&self.encode(seq_id))
    }
}

/// What a successful response carries. The shape is fixed by the method.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Empty,
    Row(Option<Row>),
    Rows(Vec<Row>),
    Partition(PartitionSnapshot),
    Clocks(ClockTable),
    FuncResult(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Success(Payload),
    NotReady,
    Fatal(String),
}

impl ResponseBody {
    pub fn response_type(&self) -> ResponseType {
        match self {
            ResponseBody::Success(_) => ResponseType::Success,
            ResponseBody::NotReady => ResponseType::NotReady,
            ResponseBody::Fatal(_) => ResponseType::Fatal,
        }
    }
}

/// A response, tagged with the seq id of the request that caused it.
///
/// Responses to pooled requests are written in completion order, not
/// request order, so callers must match them up by `seq_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub seq_id: i32,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(seq_id: i32, body: ResponseBody) -> Self {
        Self { seq_id, body }
    }

    pub fn success(seq_id: i32, payload: Payload) -> Self {
        Self::new(seq_id, ResponseBody::Success(payload))
    }

    pub fn not_ready(seq_id: i32) -> Self {
        Self::new(seq_id, ResponseBody::NotReady)
    }

    pub fn fatal(seq_id: i32, detail: impl Into<String>) -> Self {
        Self::new(seq_id, ResponseBody::Fatal(detail.into()))
    }

    /// Exact size of the encoded body.
    pub fn encoded_len(&self) -> usize {
        fn row_len(row: &Row) -> usize {
            8 + row.values.len() * 8
        }
        FrameHeader::LEN
            + match &self.body {
                ResponseBody::NotReady => 0,
                ResponseBody::Fatal(detail) => 4 + detail.len(),
                ResponseBody::Success(payload) => match payload {
                    Payload::Empty => 0,
                    Payload::Row(row) => 1 + row.as_ref().map_or(0, row_len),
                    Payload::Rows(rows) => 4 + rows.iter().map(row_len).sum::<usize>(),
                    Payload::Partition(part) => {
                        8 + 4 + 4 + 4 + part.rows.iter().map(row_len).sum::<usize>()
                    }
                    Payload::Clocks(table) => {
                        4 + table
                            .iter()
                            .map(|(_, clocks)| 8 + 4 + clocks.len() * 4)
                            .sum::<usize>()
                    }
                    Payload::FuncResult(bytes) => 4 + bytes.len(),
                },
            }
    }

    /// Appends the encoded body to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut w = BodyWriter(std::mem::take(buf));
        w.i32(self.seq_id);
        w.i32(self.body.response_type() as i32);
        match &self.body {
            ResponseBody::NotReady => {}
            ResponseBody::Fatal(detail) => w.bytes(detail.as_bytes()),
            ResponseBody::Success(payload) => match payload {
                Payload::Empty => {}
                Payload::Row(row) => {
                    w.0.push(row.is_some() as u8);
                    if let Some(row) = row {
                        w.row(row);
                    }
                }
                Payload::Rows(rows) => {
                    w.i32(rows.len() as i32);
                    rows.iter().for_each(|row| w.row(row));
                }
                Payload::Partition(part) => {
                    w.key(part.key);
                    w.i32(part.start_row);
                    w.i32(part.end_row);
                    w.i32(part.rows.len() as i32);
                    part.rows.iter().for_each(|row| w.row(row));
                }
                Payload::Clocks(table) => {
                    w.i32(table.len() as i32);
                    for (key, clocks) in table.iter() {
                        w.key(*key);
                        w.i32(clocks.len() as i32);
                        clocks.iter().for_each(|clock| w.i32(*clock));
                    }
                }
                Payload::FuncResult(bytes) => w.bytes(bytes),
            },
        }
        *buf = w.0;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes a response body. The caller supplies the method of the
    /// request it correlated the seq id with, since that fixes the payload
    /// shape.
    pub fn decode(method: Method, body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = BodyReader::new(body);
        let seq_id = r.i32("seq_id")?;
        let response_type = ResponseType::try_from(r.i32("response_type")?)?;
        let body = match response_type {
            ResponseType::NotReady => ResponseBody::NotReady,
            ResponseType::Fatal => ResponseBody::Fatal(r.string("detail")?),
            ResponseType::Success => ResponseBody::Success(match method {
                Method::GetRowSplit => {
                    if r.bool("row_present")? {
                        Payload::Row(Some(r.row()?))
                    } else {
                        Payload::Row(None)
                    }
                }
                Method::GetRowsSplit => {
                    let n = r.len("rows", 8)?;
                    let mut rows = Vec::with_capacity(n);
                    for _ in 0..n {
                        rows.push(r.row()?);
                    }
                    Payload::Rows(rows)
                }
                Method::GetPartition => {
                    let key = r.key()?;
                    let start_row = r.i32("start_row")?;
                    let end_row = r.i32("end_row")?;
                    let n = r.len("rows", 8)?;
                    let mut rows = Vec::with_capacity(n);
                    for _ in 0..n {
                        rows.push(r.row()?);
                    }
                    Payload::Partition(PartitionSnapshot {
                        key,
                        start_row,
                        end_row,
                        rows,
                    })
                }
                Method::GetClocks => {
                    let n = r.len("clocks", 12)?;
                    let mut table = ClockTable::new();
                    for _ in 0..n {
                        let key = r.key()?;
                        let tasks = r.len("task_clocks", 4)?;
                        let mut clocks = Vec::with_capacity(tasks);
                        for _ in 0..tasks {
                            clocks.push(r.i32("task_clocks")?);
                        }
                        table.insert(key, clocks);
                    }
                    Payload::Clocks(table)
                }
                Method::GetUdf => Payload::FuncResult(r.bytes("result")?),
                Method::PutPartitionUpdate | Method::PutPartition | Method::Updater => {
                    Payload::Empty
                }
            }),
        };
        r.finish()?;
        Ok(Self { seq_id, body })
    }
}

/// Prefixes `body` with its length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

struct BodyReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BodyReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(body),
        }
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| DecodeError::Truncated(field))
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, DecodeError> {
        self.cursor
            .read_f64::<BigEndian>()
            .map_err(|_| DecodeError::Truncated(field))
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.cursor.read_u8().map_err(|_| DecodeError::Truncated(field))? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidValue {
                field,
                value: other.into(),
            }),
        }
    }

    /// Reads a count of elements that each take at least `min_size` bytes,
    /// rejecting counts the rest of the body cannot possibly hold.
    fn len(&mut self, field: &'static str, min_size: usize) -> Result<usize, DecodeError> {
        let len = self.i32(field)?;
        let n = usize::try_from(len).map_err(|_| DecodeError::NegativeLength { field, len })?;
        if n.saturating_mul(min_size) > self.remaining() {
            return Err(DecodeError::Truncated(field));
        }
        Ok(n)
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let n = self.len(field, 1)?;
        let start = self.cursor.position() as usize;
        let bytes = self.cursor.get_ref()[start..start + n].to_vec();
        self.cursor.set_position((start + n) as u64);
        Ok(bytes)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        String::from_utf8(self.bytes(field)?).map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn key(&mut self) -> Result<PartitionKey, DecodeError> {
        Ok(PartitionKey {
            matrix_id: self.i32("matrix_id")?,
            partition_id: self.i32("partition_id")?,
        })
    }

    fn row(&mut self) -> Result<Row, DecodeError> {
        let row_index = self.i32("row_index")?;
        let n = self.len("row_values", 8)?;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.f64("row_values")?);
        }
        Ok(Row { row_index, values })
    }

    fn param(&mut self) -> Result<PartitionParam, DecodeError> {
        let key = self.key()?;
        let bytes = self.bytes("param")?;
        Ok(PartitionParam { key, bytes })
    }

    fn rest(self) -> Vec<u8> {
        let start = self.cursor.position() as usize;
        self.cursor.get_ref()[start..].to_vec()
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[derive(Default)]
struct BodyWriter(Vec<u8>);

impl BodyWriter {
    fn i32(&mut self, value: i32) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.i32(bytes.len() as i32);
        self.0.extend_from_slice(bytes);
    }

    fn key(&mut self, key: PartitionKey) {
        self.i32(key.matrix_id);
        self.i32(key.partition_id);
    }

    fn row(&mut self, row: &Row) {
        self.i32(row.row_index);
        self.i32(row.values.len() as i32);
        for value in &row.values {
            self.0.extend_from_slice(&value.to_be_bytes());
        }
    }
}
