use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, error, warn};

use super::{
    partition::{Clock, PartitionKey, PartitionStore, StoreError},
    udf::{panic_message, FuncError, FunctionRegistry, PartitionParam},
    wire::{DecodeError, FrameHeader, Payload, Request, Response, ResponseBody},
};

/// Why a handler gave up on a request.
enum Failure {
    Store(StoreError),
    Func(FuncError),
    Panicked(String),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<FuncError> for Failure {
    fn from(e: FuncError) -> Self {
        Self::Func(e)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Store(e) => write!(f, "{e}"),
            Failure::Func(e) => write!(f, "{e}"),
            Failure::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Turns request bodies into responses. Exactly one response comes back for
/// every request, and it always carries the request's seq id.
pub struct Dispatcher {
    store: Arc<dyn PartitionStore>,
    functions: FunctionRegistry,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn PartitionStore>, functions: FunctionRegistry) -> Self {
        Self { store, functions }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Parses the header off `frame` and dispatches the rest. Fails only if
    /// the header itself is unreadable.
    pub fn dispatch_frame(&self, frame: &[u8]) -> Result<Response, DecodeError> {
        let (header, body) = FrameHeader::parse(frame)?;
        Ok(self.dispatch(header, body))
    }

    /// Decodes the method-specific `body` and answers it. Unknown methods and
    /// malformed bodies are answered with FATAL.
    pub fn dispatch(&self, header: FrameHeader, body: &[u8]) -> Response {
        let seq_id = header.seq_id;
        let method = match header.method() {
            Ok(method) => method,
            Err(e) => {
                warn!(seq_id, method_id = header.method_id, "received unknown method id");
                return Response::fatal(seq_id, e.to_string());
            }
        };
        match Request::decode(method, body) {
            Ok(request) => self.handle(seq_id, request),
            Err(e) => {
                error!(seq_id, %method, error = %e, "could not decode request");
                Response::fatal(seq_id, format!("malformed {method} request: {e}"))
            }
        }
    }

    /// Runs one request. A panic anywhere below, in the store included, is
    /// answered with FATAL like any other failure.
    pub fn handle(&self, seq_id: i32, request: Request) -> Response {
        let method = request.method();
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(request)))
            .unwrap_or_else(|panic| {
                Err(Failure::Panicked(panic_message(panic.as_ref())))
            });
        let body = result.unwrap_or_else(|failure| {
            error!(seq_id, %method, error = %failure, "request failed");
            ResponseBody::Fatal(format!("{method} request failed: {failure}"))
        });
        debug!(
            seq_id,
            %method,
            response = ?body.response_type(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "handled request"
        );
        Response::new(seq_id, body)
    }

    fn run(&self, request: Request) -> Result<ResponseBody, Failure> {
        match request {
            Request::GetRowSplit {
                key,
                clock,
                row_index,
            } => self.get_row_split(key, clock, row_index),
            Request::GetRowsSplit {
                key,
                clock,
                row_indexes,
            } => self.get_rows_split(key, clock, &row_indexes),
            Request::GetPartition { key, clock } => self.get_partition(key, clock),
            Request::PutPartitionUpdate {
                key,
                clock,
                task_index,
                update_clock,
                payload,
            } => self.put_partition_update(key, clock, task_index, update_clock, &payload),
            Request::PutPartition { key, payload } => self.put_partition(key, &payload),
            Request::GetClocks => self.get_clocks(),
            Request::Updater { func, param } => self.update(&func, &param),
            Request::GetUdf { func, param } => self.get_udf(&func, &param),
        }
    }

    fn get_row_split(
        &self,
        key: PartitionKey,
        clock: Clock,
        row_index: i32,
    ) -> Result<ResponseBody, Failure> {
        debug!(%key, clock, row_index, "get row request");
        if !self.store.partition_ready(key, clock)? {
            return Ok(ResponseBody::NotReady);
        }
        let row = self
            .store
            .get_row(key.matrix_id, row_index, key.partition_id)?;
        Ok(ResponseBody::Success(Payload::Row(row)))
    }

    fn get_rows_split(
        &self,
        key: PartitionKey,
        clock: Clock,
        row_indexes: &[i32],
    ) -> Result<ResponseBody, Failure> {
        debug!(%key, clock, rows = row_indexes.len(), "get rows request");
        if !self.store.partition_ready(key, clock)? {
            return Ok(ResponseBody::NotReady);
        }
        let mut rows = Vec::with_capacity(row_indexes.len());
        for row_index in row_indexes {
            if let Some(row) = self
                .store
                .get_row(key.matrix_id, *row_index, key.partition_id)?
            {
                rows.push(row);
            }
        }
        Ok(ResponseBody::Success(Payload::Rows(rows)))
    }

    fn get_partition(&self, key: PartitionKey, clock: Clock) -> Result<ResponseBody, Failure> {
        debug!(%key, clock, "get partition request");
        if !self.store.partition_ready(key, clock)? {
            return Ok(ResponseBody::NotReady);
        }
        let partition = self.store.get_partition(key.matrix_id, key.partition_id)?;
        Ok(ResponseBody::Success(Payload::Partition(partition)))
    }

    fn put_partition_update(
        &self,
        key: PartitionKey,
        clock: Clock,
        task_index: u32,
        update_clock: bool,
        payload: &[u8],
    ) -> Result<ResponseBody, Failure> {
        debug!(%key, clock, task_index, update_clock, len = payload.len(), "update request");
        // the clock only moves once the data it covers is in the store
        self.store.update(key, payload)?;
        if update_clock {
            self.store.clock(key, task_index, clock)?;
        }
        Ok(ResponseBody::Success(Payload::Empty))
    }

    fn put_partition(&self, key: PartitionKey, payload: &[u8]) -> Result<ResponseBody, Failure> {
        debug!(%key, len = payload.len(), "put partition request");
        self.store.update(key, payload)?;
        Ok(ResponseBody::Success(Payload::Empty))
    }

    fn get_clocks(&self) -> Result<ResponseBody, Failure> {
        Ok(ResponseBody::Success(Payload::Clocks(self.store.clocks()?)))
    }

    fn update(&self, func: &str, param: &PartitionParam) -> Result<ResponseBody, Failure> {
        debug!(func, key = %param.key, "updater request");
        self.functions
            .invoke_update(func, &*self.store, param)?;
        Ok(ResponseBody::Success(Payload::Empty))
    }

    fn get_udf(&self, func: &str, param: &PartitionParam) -> Result<ResponseBody, Failure> {
        debug!(func, key = %param.key, "get udf request");
        let result = self.functions.invoke_get(func, &*self.store, param)?;
        Ok(ResponseBody::Success(Payload::FuncResult(result)))
    }
}
