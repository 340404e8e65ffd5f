//! Core of the coordination service: replication engine, client request
//! surface, sessions, watches and user accounts.

pub mod config;
pub mod node;
pub mod perf;
pub mod session;
pub mod surface;
pub mod users;
pub mod watch;

pub use config::{node_dir_name, NodeConfig};
pub use node::{Node, NodeParts};
