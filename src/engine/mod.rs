// Engine module
// Connections to the query server, their request queues and the registry

pub mod client;
pub mod connection;
pub mod environment;
pub mod error;
pub(crate) mod poller;
pub mod progress;
pub mod transport;
pub mod types;

pub use client::{Client, ClientBuilder};
pub use connection::{Connection, ConnectionOptions, ConnectionSettings};
pub use environment::{ConnectionString, Environment};
pub use error::{EngineError, EngineResult};
pub use progress::{LogProgress, ProgressIndicator};
pub use transport::{Connector, TcpConnector, Transport};
pub use types::*;
