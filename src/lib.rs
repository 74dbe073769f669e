// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod router;
pub mod server;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use config::{Config, ServerKind};
pub use error::{ServerError, ServerResult};
pub use http::{Method, Request, Response};
pub use metrics::Metrics;
pub use processor::RequestProcessor;
pub use router::Router;
pub use server::{BlockingServer, MultiplexServer, Server};
