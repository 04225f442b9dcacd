use std::{io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, debug_span, warn, Instrument, Span};

use super::{
    config::ServerConfig,
    dispatch::Dispatcher,
    error::Error,
    partition::PartitionStore,
    scheduler::{Execution, WorkerPool},
    udf::FunctionRegistry,
    wire::{FrameHeader, Response, FRAME_PREFIX_LEN},
};

/// Everything a connection needs, shared by all connections of a server.
pub struct ServerContext {
    pub dispatcher: Dispatcher,
    pub pool: WorkerPool,
    pub config: ServerConfig,
}

impl ServerContext {
    /// Builds the context, dropping every function the config does not
    /// allow.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn PartitionStore>,
        mut functions: FunctionRegistry,
    ) -> Self {
        if let Some(allowed) = &config.allowed_functions {
            functions.retain_allowed(allowed);
        }
        debug!(functions = ?functions.names(), "registered functions");
        Self {
            dispatcher: Dispatcher::new(store, functions),
            pool: WorkerPool::new(config.worker_pool_size),
            config,
        }
    }
}

/// The sending half of a connection.
///
/// Can be cloned to obtain another handle to the same connection. Each
/// response is written as a whole while holding the connection's write
/// guard, so concurrent senders never interleave their bytes.
pub struct ResponseWriter<W> {
    conn_id: u64,
    sink: Arc<Mutex<W>>,
    presize: bool,
}

impl<W> Clone for ResponseWriter<W> {
    fn clone(&self) -> Self {
        Self {
            conn_id: self.conn_id,
            sink: self.sink.clone(),
            presize: self.presize,
        }
    }
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(conn_id: u64, sink: W, presize: bool) -> Self {
        Self {
            conn_id,
            sink: Arc::new(Mutex::new(sink)),
            presize,
        }
    }

    /// Encodes and writes one length-prefixed response. Failures are logged
    /// against the connection before they are returned.
    pub async fn send(&self, response: &Response) -> Result<(), Error> {
        let result = self.write_frame(response).await;
        if let Err(e) = &result {
            warn!(
                conn_id = self.conn_id,
                seq_id = response.seq_id,
                error = %e,
                "could not send response"
            );
        }
        result
    }

    async fn write_frame(&self, response: &Response) -> Result<(), Error> {
        let mut buf = if self.presize {
            Vec::with_capacity(FRAME_PREFIX_LEN + response.encoded_len())
        } else {
            Vec::new()
        };
        buf.extend_from_slice(&[0; FRAME_PREFIX_LEN]);
        response.encode_into(&mut buf);
        let len = (buf.len() - FRAME_PREFIX_LEN) as u32;
        buf[..FRAME_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());

        let mut sink = self.sink.lock().await;
        sink.write_all(&buf).await?;
        sink.flush().await?;
        Ok(())
    }
}

/// The receiving half of a connection. Yields whole frame bodies.
pub struct FrameReader<R> {
    source: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(source: R, max_frame_len: usize) -> Self {
        Self {
            source,
            max_frame_len,
        }
    }

    /// Reads the next frame body. `None` means the peer closed the stream
    /// exactly between two frames; closing anywhere else is an error.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        let mut filled = 0;
        while filled < FRAME_PREFIX_LEN {
            match self.source.read(&mut prefix[filled..]).await? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection inside a frame length",
                    )))
                }
                n => filled += n,
            }
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let mut body = vec![0u8; len];
        self.source.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}

/// Serves requests arriving on `stream` until the peer closes it or sends a
/// frame whose header cannot be read.
///
/// Pooled requests still running when this returns finish on their own;
/// their responses are dropped if the stream is gone. A pooled request gives
/// its worker slot back before its response is written, so a peer that stops
/// reading only stalls its own responses.
pub async fn serve<S>(conn_id: u64, stream: S, ctx: Arc<ServerContext>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (source, sink) = tokio::io::split(stream);
    let mut reader = FrameReader::new(source, ctx.config.max_frame_len);
    let writer = ResponseWriter::new(conn_id, sink, ctx.config.preallocate_responses);

    async move {
        debug!("serving connection");
        while let Some(frame) = reader.next_frame().await? {
            let (header, _) = FrameHeader::parse(&frame)?;
            match Execution::for_method(header.method().ok()) {
                Execution::Inline => {
                    let response = ctx
                        .dispatcher
                        .dispatch(header, &frame[FrameHeader::LEN..]);
                    writer.send(&response).await?;
                }
                Execution::Pooled => {
                    let job_ctx = ctx.clone();
                    let job_span = Span::current();
                    let send_span = job_span.clone();
                    let writer = writer.clone();
                    ctx.pool.spawn(
                        move || {
                            let _entered = job_span.enter();
                            job_ctx
                                .dispatcher
                                .dispatch(header, &frame[FrameHeader::LEN..])
                        },
                        move |response| {
                            async move {
                                // already logged by the writer
                                let _ = writer.send(&response).await;
                            }
                            .instrument(send_span)
                        },
                    );
                }
            }
        }
        debug!("peer closed connection");
        Ok::<(), Error>(())
    }
    .instrument(debug_span!("conn", id = conn_id))
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{duplex, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;
    use crate::server::{
        udf::{builtin, FuncError, GetFunc, PartitionParam},
        wire::{Method, Payload, Request, ResponseBody},
        Clock, ClockTable, MemoryStore, PartitionKey, PartitionSnapshot, Row, StoreError,
    };

    struct Client {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, seq_id: i32, request: &Request) {
            self.writer
                .write_all(&request.to_frame(seq_id))
                .await
                .unwrap();
        }

        async fn recv(&mut self, method: Method) -> Response {
            let body = self.reader.next_frame().await.unwrap().unwrap();
            Response::decode(method, &body).unwrap()
        }
    }

    fn context(config: ServerConfig) -> (Arc<MemoryStore>, Arc<ServerContext>) {
        let store = Arc::new(MemoryStore::new());
        store.add_partition(PartitionKey::new(1, 0), 0, 16, 2, 2);
        for row in 0..16 {
            store
                .put_row(PartitionKey::new(1, 0), row, vec![row as f64, 1.0])
                .unwrap();
        }
        let ctx = ServerContext::new(config, store.clone(), FunctionRegistry::with_builtins());
        (store, Arc::new(ctx))
    }

    fn connect(
        ctx: Arc<ServerContext>,
    ) -> (Client, tokio::task::JoinHandle<Result<(), Error>>) {
        connect_with_buffer(ctx, 1, 64 * 1024)
    }

    fn connect_with_buffer(
        ctx: Arc<ServerContext>,
        conn_id: u64,
        buffer: usize,
    ) -> (Client, tokio::task::JoinHandle<Result<(), Error>>) {
        let (client, server) = duplex(buffer);
        let handle = tokio::spawn(serve(conn_id, server, ctx));
        let (source, writer) = tokio::io::split(client);
        let client = Client {
            reader: FrameReader::new(source, usize::MAX),
            writer,
        };
        (client, handle)
    }

    #[tokio::test]
    async fn every_pooled_request_gets_one_whole_response() {
        let (_, ctx) = context(ServerConfig::builder().worker_pool_size(4).build());
        let (mut client, _) = connect(ctx);
        let key = PartitionKey::new(1, 0);

        for seq_id in 0..32 {
            let request = Request::GetRowSplit {
                key,
                clock: 0,
                row_index: seq_id % 16,
            };
            client.send(seq_id, &request).await;
        }

        let mut seen = Vec::new();
        for _ in 0..32 {
            let response = client.recv(Method::GetRowSplit).await;
            let ResponseBody::Success(Payload::Row(Some(row))) = response.body else {
                panic!("expected a row");
            };
            assert_eq!(row.row_index, response.seq_id % 16);
            seen.push(response.seq_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn presized_responses_match() {
        let (_, ctx) = context(
            ServerConfig::builder()
                .preallocate_responses(true)
                .build(),
        );
        let (mut client, _) = connect(ctx);
        client
            .send(
                3,
                &Request::GetPartition {
                    key: PartitionKey::new(1, 0),
                    clock: 0,
                },
            )
            .await;
        let response = client.recv(Method::GetPartition).await;
        let ResponseBody::Success(Payload::Partition(part)) = response.body else {
            panic!("expected a partition");
        };
        assert_eq!(part.rows.len(), 16);
    }

    #[tokio::test]
    async fn failed_function_leaves_connection_usable() {
        let (_, ctx) = context(ServerConfig::default());
        let (mut client, _) = connect(ctx);
        let param = PartitionParam {
            key: PartitionKey::new(1, 0),
            bytes: builtin::row_param(0),
        };

        client
            .send(
                1,
                &Request::GetUdf {
                    func: "no.Such".into(),
                    param,
                },
            )
            .await;
        let response = client.recv(Method::GetUdf).await;
        assert_eq!(response.seq_id, 1);
        assert!(matches!(response.body, ResponseBody::Fatal(_)));

        client.send(2, &Request::GetClocks).await;
        let response = client.recv(Method::GetClocks).await;
        assert_eq!(response.seq_id, 2);
        assert!(matches!(response.body, ResponseBody::Success(Payload::Clocks(_))));
    }

    #[tokio::test]
    async fn disallowed_functions_do_not_resolve() {
        let config = ServerConfig::builder()
            .allowed_functions(vec![builtin::SUM.to_string()])
            .build();
        let (_, ctx) = context(config);
        assert!(ctx.dispatcher.functions().contains(builtin::SUM));
        assert!(!ctx.dispatcher.functions().contains(builtin::MAX));

        let (mut client, _) = connect(ctx);
        let param = PartitionParam {
            key: PartitionKey::new(1, 0),
            bytes: builtin::row_param(3),
        };
        client
            .send(
                5,
                &Request::GetUdf {
                    func: builtin::MAX.into(),
                    param,
                },
            )
            .await;
        assert!(matches!(
            client.recv(Method::GetUdf).await.body,
            ResponseBody::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn unknown_method_is_answered() {
        let (_, ctx) = context(ServerConfig::default());
        let (mut client, _) = connect(ctx);
        let mut body = 9i32.to_be_bytes().to_vec();
        body.extend_from_slice(&99i32.to_be_bytes());
        client
            .writer
            .write_all(&crate::server::wire::frame(&body))
            .await
            .unwrap();

        // any method works for decoding a FATAL response
        let response = client.recv(Method::GetClocks).await;
        assert_eq!(response.seq_id, 9);
        assert!(matches!(response.body, ResponseBody::Fatal(_)));
    }

    #[tokio::test]
    async fn short_header_closes_connection() {
        let (_, ctx) = context(ServerConfig::default());
        let (mut client, handle) = connect(ctx);
        client
            .writer
            .write_all(&crate::server::wire::frame(&[0, 0, 1]))
            .await
            .unwrap();
        assert!(matches!(handle.await.unwrap(), Err(Error::Decode(_))));
        assert!(client.reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let (_, ctx) = context(ServerConfig::builder().max_frame_len(16).build());
        let (mut client, handle) = connect(ctx);
        client
            .writer
            .write_all(&crate::server::wire::frame(&[0; 17]))
            .await
            .unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn clean_close_ends_serve() {
        let (_, ctx) = context(ServerConfig::default());
        let (client, handle) = connect(ctx);
        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_inside_a_length_prefix_is_an_error() {
        let (_, ctx) = context(ServerConfig::default());
        let (mut client, handle) = connect(ctx);
        client.writer.write_all(&[0, 0]).await.unwrap();
        client.writer.shutdown().await.unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_peer_that_stops_reading_does_not_stall_others() {
        let (_, ctx) = context(ServerConfig::builder().worker_pool_size(2).build());
        let key = PartitionKey::new(1, 0);

        // each partition response is larger than half the pipe, so most of
        // these can never be written
        let (mut stalled, _) = connect_with_buffer(ctx.clone(), 1, 1024);
        for seq_id in 0..8 {
            stalled
                .send(seq_id, &Request::GetPartition { key, clock: 0 })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut healthy, _) = connect_with_buffer(ctx, 2, 64 * 1024);
        healthy
            .send(
                99,
                &Request::GetRowSplit {
                    key,
                    clock: 0,
                    row_index: 3,
                },
            )
            .await;
        let response = timeout(Duration::from_secs(5), healthy.recv(Method::GetRowSplit))
            .await
            .expect("second connection was never answered");
        assert_eq!(response.seq_id, 99);
        assert!(matches!(
            response.body,
            ResponseBody::Success(Payload::Row(Some(_)))
        ));
    }

    #[derive(Default)]
    struct Slow;

    impl GetFunc for Slow {
        fn partition_get(
            &self,
            _store: &dyn PartitionStore,
            _param: &PartitionParam,
        ) -> Result<Vec<u8>, FuncError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![1])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pooled_responses_may_overtake_earlier_requests() {
        let store = Arc::new(MemoryStore::new());
        let key = PartitionKey::new(1, 0);
        store.add_partition(key, 0, 4, 1, 1);
        store.put_row(key, 2, vec![8.0]).unwrap();
        let mut functions = FunctionRegistry::new();
        functions.register_get::<Slow>("test.Slow");
        let config = ServerConfig::builder().worker_pool_size(2).build();
        let ctx = Arc::new(ServerContext::new(config, store, functions));
        let (mut client, _) = connect(ctx);

        client
            .send(
                1,
                &Request::GetUdf {
                    func: "test.Slow".into(),
                    param: PartitionParam { key, bytes: vec![] },
                },
            )
            .await;
        client
            .send(
                2,
                &Request::GetRowSplit {
                    key,
                    clock: 0,
                    row_index: 2,
                },
            )
            .await;

        let first = client.reader.next_frame().await.unwrap().unwrap();
        let first = Response::decode(Method::GetRowSplit, &first).unwrap();
        assert_eq!(first.seq_id, 2);
        let second = client.recv(Method::GetUdf).await;
        assert_eq!(second, Response::success(1, Payload::FuncResult(vec![1])));
    }

    /// Delegates to a [`MemoryStore`] except for row reads and the clock
    /// table, which panic.
    struct PanickingStore(MemoryStore);

    impl PartitionStore for PanickingStore {
        fn partition_ready(&self, key: PartitionKey, clock: Clock) -> Result<bool, StoreError> {
            self.0.partition_ready(key, clock)
        }

        fn get_row(&self, _: i32, _: i32, _: i32) -> Result<Option<Row>, StoreError> {
            panic!("row storage is corrupt")
        }

        fn get_partition(
            &self,
            matrix_id: i32,
            partition_id: i32,
        ) -> Result<PartitionSnapshot, StoreError> {
            self.0.get_partition(matrix_id, partition_id)
        }

        fn update(&self, key: PartitionKey, payload: &[u8]) -> Result<(), StoreError> {
            self.0.update(key, payload)
        }

        fn clock(&self, key: PartitionKey, task_index: u32, clock: Clock) -> Result<(), StoreError> {
            self.0.clock(key, task_index, clock)
        }

        fn clocks(&self) -> Result<ClockTable, StoreError> {
            panic!("clock table is corrupt")
        }

        fn modify(
            &self,
            key: PartitionKey,
            f: &mut dyn FnMut(&mut PartitionSnapshot),
        ) -> Result<(), StoreError> {
            self.0.modify(key, f)
        }
    }

    #[tokio::test]
    async fn store_panics_are_answered_with_fatal() {
        let inner = MemoryStore::new();
        let key = PartitionKey::new(1, 0);
        inner.add_partition(key, 0, 4, 1, 1);
        let ctx = Arc::new(ServerContext::new(
            ServerConfig::default(),
            Arc::new(PanickingStore(inner)),
            FunctionRegistry::new(),
        ));
        let (mut client, _) = connect(ctx);

        // pooled
        client
            .send(
                5,
                &Request::GetRowSplit {
                    key,
                    clock: 0,
                    row_index: 1,
                },
            )
            .await;
        let response = timeout(Duration::from_secs(5), client.recv(Method::GetRowSplit))
            .await
            .expect("no response to a request whose store call panicked");
        assert_eq!(response.seq_id, 5);
        let ResponseBody::Fatal(detail) = response.body else {
            panic!("expected fatal");
        };
        assert!(detail.contains("row storage is corrupt"));

        // inline
        client.send(6, &Request::GetClocks).await;
        let response = client.recv(Method::GetClocks).await;
        assert_eq!(response.seq_id, 6);
        assert!(matches!(response.body, ResponseBody::Fatal(_)));

        client.send(7, &Request::GetPartition { key, clock: 0 }).await;
        let response = client.recv(Method::GetPartition).await;
        assert_eq!(response.seq_id, 7);
        assert!(matches!(
            response.body,
            ResponseBody::Success(Payload::Partition(_))
        ));
    }
}
