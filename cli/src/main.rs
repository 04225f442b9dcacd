use std::{net::SocketAddr, process::ExitCode, str::FromStr, sync::Arc};

use clap::Parser;
use matrixps::server::{
    udf::FunctionRegistry, MemoryStore, Server, ServerConfig,
};
use tracing::{error, info};

/// A matrix to create in the in-memory store at startup.
#[derive(Clone, Debug)]
struct MatrixSpec {
    id: i32,
    partitions: i32,
    rows_per_partition: i32,
    cols: usize,
    tasks: usize,
}

impl FromStr for MatrixSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [id, partitions, rows_per_partition, cols, tasks] = fields.as_slice() else {
            return Err(format!(
                "expected id:partitions:rows_per_partition:cols:tasks, got {s:?}"
            ));
        };
        fn num<T: FromStr>(name: &str, value: &str) -> Result<T, String> {
            value
                .parse()
                .map_err(|_| format!("{name} must be a non-negative integer, got {value:?}"))
        }
        let spec = MatrixSpec {
            id: num("id", id)?,
            partitions: num("partitions", partitions)?,
            rows_per_partition: num("rows_per_partition", rows_per_partition)?,
            cols: num("cols", cols)?,
            tasks: num("tasks", tasks)?,
        };
        if spec.partitions < 0 || spec.rows_per_partition < 0 {
            return Err(format!("partition counts must not be negative in {s:?}"));
        }
        if spec.partitions.checked_mul(spec.rows_per_partition).is_none() {
            return Err(format!("{s:?} has more rows than fit in an i32"));
        }
        Ok(spec)
    }
}

#[derive(Parser, Debug)]
#[command(name = "matrixps", about = "Serves partitioned matrices to training workers")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "MATRIXPS_BIND", default_value = "0.0.0.0:9471")]
    bind: SocketAddr,

    /// How many requests may execute at once across all connections.
    #[arg(long, env = "MATRIXPS_WORKER_POOL_SIZE", default_value_t = 100)]
    worker_pool_size: usize,

    /// Largest accepted request frame, in bytes.
    #[arg(long, env = "MATRIXPS_MAX_FRAME_LEN", default_value_t = 64 * 1024 * 1024)]
    max_frame_len: usize,

    /// Size response buffers exactly before encoding.
    #[arg(long, env = "MATRIXPS_PREALLOCATE_RESPONSES")]
    preallocate_responses: bool,

    /// Restrict callable functions to these names.
    #[arg(long = "allow-function", env = "MATRIXPS_ALLOWED_FUNCTIONS", value_delimiter = ',')]
    allowed_functions: Vec<String>,

    /// id:partitions:rows_per_partition:cols:tasks, repeatable.
    #[arg(long = "matrix", env = "MATRIXPS_MATRICES", value_delimiter = ',')]
    matrices: Vec<MatrixSpec>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let config = ServerConfig::builder()
            .bind_addr(self.bind)
            .worker_pool_size(self.worker_pool_size)
            .max_frame_len(self.max_frame_len)
            .preallocate_responses(self.preallocate_responses);
        if self.allowed_functions.is_empty() {
            config.build()
        } else {
            config
                .allowed_functions(self.allowed_functions.clone())
                .build()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let store = MemoryStore::new();
    for m in &args.matrices {
        if let Err(e) = store.add_matrix(m.id, m.partitions, m.rows_per_partition, m.cols, m.tasks)
        {
            error!(matrix_id = m.id, error = %e, "could not create matrix");
            return ExitCode::FAILURE;
        }
        info!(
            matrix_id = m.id,
            partitions = m.partitions,
            rows_per_partition = m.rows_per_partition,
            cols = m.cols,
            tasks = m.tasks,
            "created matrix"
        );
    }

    let server = match Server::bind(
        args.server_config(),
        Arc::new(store),
        FunctionRegistry::with_builtins(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "could not start server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    match server.run_until(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
