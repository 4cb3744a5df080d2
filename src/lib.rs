// sqlbridge - client engine for an out-of-process query server
// Core library

pub mod config;
pub mod engine;
pub mod metrics;
pub mod observability;
pub mod server;

pub use config::{EngineConfig, LoggingConfig, ServerConfig};
pub use engine::{
    Client, ClientBuilder, Connection, ConnectionState, ConnectionString, EngineError,
    EngineResult, Environment, ProgressIndicator, QueryResult, RequestId, ResultCallback, Row,
    Vendor,
};
pub use metrics::MetricsSnapshot;
pub use server::{ProcessOrigin, ServerProcess, ServerProcessManager};
