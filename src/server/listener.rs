use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::RwLock,
};
use tracing::{debug, info, warn};

use super::{
    config::ServerConfig,
    conn::{serve, ServerContext},
    error::Error,
    partition::PartitionStore,
    udf::FunctionRegistry,
};

/// A bound TCP listener serving one store.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    connections: Arc<RwLock<HashMap<u64, SocketAddr>>>,
    next_id: AtomicU64,
}

impl Server {
    /// Binds to `config.bind_addr`. Functions outside
    /// `config.allowed_functions` are unregistered here and never resolve.
    pub async fn bind(
        config: ServerConfig,
        store: Arc<dyn PartitionStore>,
        functions: FunctionRegistry,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            worker_pool_size = config.worker_pool_size,
            "matrix server listening"
        );
        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext::new(config, store, functions)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Connections currently being served.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Accepts connections until accepting fails. Each connection is served
    /// on its own task.
    pub async fn run(&self) -> Result<(), Error> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            self.start_connection(stream, peer).await;
        }
    }

    /// Like [`run`](Self::run), but returns cleanly once `shutdown`
    /// resolves. Connections already accepted keep being served.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("matrix server stopped accepting connections");
                Ok(())
            }
        }
    }

    async fn start_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "could not disable nagle");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, peer);
        debug!(id, %peer, "accepted connection");

        let ctx = self.ctx.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            match serve(id, stream, ctx).await {
                Ok(()) => debug!(id, %peer, "connection closed"),
                Err(e) => warn!(id, %peer, error = %e, "connection closed"),
            }
            connections.write().await.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::server::{conn::FrameReader, wire::*, MemoryStore, PartitionKey};

    #[tokio::test]
    async fn tracks_open_connections() {
        let store = Arc::new(MemoryStore::new());
        store.add_partition(PartitionKey::new(3, 0), 0, 4, 1, 1);
        let config = ServerConfig::builder()
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build();
        let server = Arc::new(
            Server::bind(config, store, FunctionRegistry::with_builtins())
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&Request::GetClocks.to_frame(1))
            .await
            .unwrap();
        let (source, sink) = stream.into_split();
        let mut reader = FrameReader::new(source, usize::MAX);
        let body = reader.next_frame().await.unwrap().unwrap();
        let response = Response::decode(Method::GetClocks, &body).unwrap();
        assert_eq!(response.seq_id, 1);
        assert_eq!(server.connection_count().await, 1);

        drop(reader);
        drop(sink);
        for _ in 0..100 {
            if server.connection_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was never unregistered");
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let config = ServerConfig::builder()
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build();
        let server = Server::bind(
            config,
            Arc::new(MemoryStore::new()),
            FunctionRegistry::new(),
        )
        .await
        .unwrap();
        server.run_until(async {}).await.unwrap();
    }
}
