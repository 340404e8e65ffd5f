//! RPC layer: wire types and transports
//!
//! - `InMemoryTransport`: channel-based transport for testing
//! - `HttpTransport` + `router`: HTTP/JSON service for production

pub mod http;
pub mod inmemory;
pub mod traits;
pub mod types;

pub use traits::{RpcError, RpcResult, Transport};
