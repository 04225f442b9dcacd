use std::net::{Ipv4Addr, SocketAddr};

use typed_builder::TypedBuilder;

pub const DEFAULT_PORT: u16 = 9471;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 100;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Settings fixed for the lifetime of a [`Server`](super::Server).
#[derive(TypedBuilder, Clone, Debug)]
pub struct ServerConfig {
    /// Where the listener binds.
    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))]
    pub bind_addr: SocketAddr,
    /// How many pooled requests may execute at once, across all connections.
    #[builder(default = DEFAULT_WORKER_POOL_SIZE)]
    pub worker_pool_size: usize,
    /// Frames announcing a longer body close the connection.
    #[builder(default = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
    /// Size response buffers exactly before encoding instead of letting them
    /// grow. Only affects allocation.
    #[builder(default = false)]
    pub preallocate_responses: bool,
    /// When set, only these function names may be invoked, whatever else
    /// was registered.
    #[builder(default, setter(strip_option))]
    pub allowed_functions: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
